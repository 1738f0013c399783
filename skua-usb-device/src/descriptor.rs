//! On-demand descriptor assembly into the EP0 buffer: device,
//! configuration, string, qualifier, other-speed and BOS descriptors.

use crate::device::{Functions, UsbDevice, MAX_CONFIGURATION_COUNT};
use crate::microsoft_os::write_ms_os_10_string_descriptor;
use crate::port::PortDriver;
use crate::types::{EpAddress, MsOsDescVersion, SerialNumber, UsbError, UsbSpeed};
use crate::wire::{
    ConfigurationDescriptor, DeviceDescriptor, DeviceQualifierDescriptor,
    write_hex_string_descriptor, write_string_descriptor, BOS_DESCRIPTOR,
    CONFIGURATION_DESCRIPTOR, DEVICE_DESCRIPTOR, DEVICE_QUALIFIER_DESCRIPTOR,
    ISTR_CONFIG, ISTR_INTERFACES, ISTR_LANGID, ISTR_MS_OS_1P0, ISTR_PRODUCT,
    ISTR_SERIAL, ISTR_VENDOR, LANGID_US_ENGLISH,
    OTHER_SPEED_CONFIGURATION_DESCRIPTOR, SPEC_BCD, SPEC_BCD_WITH_BOS,
    STRING_DESCRIPTOR,
};
use crate::function::{InterfaceString, UsbFunction};

// BOS device capability types
const DEVCAP_USB_2P0_EXT: u8 = 0x02;
const DEVCAP_PLATFORM: u8 = 0x05;

/// Platform capability UUID identifying the Microsoft OS 2.0 descriptor
/// set (MS OS 2.0 spec, table 3)
const MS_OS_20_PLATFORM_UUID: [u8; 16] = [
    0xDF, 0x60, 0xDD, 0xD8, 0x89, 0x45, 0xC7, 0x4C, 0x9C, 0xD2, 0x65, 0x9D,
    0x9E, 0x64, 0x8A, 0x9F,
];

/// dwWindowsVersion for Windows 8.1, the first with MS OS 2.0 support
pub(crate) const MS_OS_20_MIN_WINDOWS_VERSION: u32 = 0x0603_0000;

impl<P: PortDriver> UsbDevice<'_, P> {
    fn spec_bcd(&self) -> u16 {
        // A BOS descriptor bumps the reported release to USB 2.1
        if self.description.lpm
            || self.description.ms_os_desc == MsOsDescVersion::V2
        {
            SPEC_BCD_WITH_BOS
        } else {
            SPEC_BCD
        }
    }

    /// GET_DESCRIPTOR: assemble the requested descriptor in the EP0
    /// buffer and start the IN data stage
    pub(crate) fn get_descriptor(
        &mut self,
        funcs: &mut Functions<'_, P>,
    ) -> Result<(), UsbError> {
        let setup = self.bus.setup;

        // High byte identifies the descriptor type
        let len = match (setup.wValue >> 8) as u8 {
            DEVICE_DESCRIPTOR => self.write_device_descriptor(),

            CONFIGURATION_DESCRIPTOR => self.write_config_descriptor(funcs),

            STRING_DESCRIPTOR => self.write_string_descriptor(funcs),

            DEVICE_QUALIFIER_DESCRIPTOR => {
                if self.description.high_speed_capable
                    && self.bus.speed == UsbSpeed::High480
                {
                    self.write_qualifier_descriptor()
                } else {
                    0
                }
            }

            OTHER_SPEED_CONFIGURATION_DESCRIPTOR => {
                if self.description.high_speed_capable
                    && self.bus.speed == UsbSpeed::High480
                {
                    // Assemble the configuration as the Full Speed
                    // variant, then relabel it
                    self.bus.speed = UsbSpeed::Full12;
                    let len = self.write_config_descriptor(funcs);
                    self.bus.speed = UsbSpeed::High480;
                    self.bus.ctrl_buf[1] = OTHER_SPEED_CONFIGURATION_DESCRIPTOR;
                    len
                } else {
                    0
                }
            }

            BOS_DESCRIPTOR => self.write_bos_descriptor(funcs),

            _ => 0,
        };

        // An empty descriptor means the request is not supported
        if len > 0 {
            self.bus.ctrl_send_in_place(len)
        } else {
            Err(UsbError::Invalid)
        }
    }

    fn write_device_descriptor(&mut self) -> usize {
        let d = &self.description;
        let desc = DeviceDescriptor {
            bLength: core::mem::size_of::<DeviceDescriptor>() as u8,
            bDescriptorType: DEVICE_DESCRIPTOR,
            bcdUSB: self.spec_bcd().to_le_bytes(),
            bDeviceClass: 0,
            bDeviceSubClass: 0,
            bDeviceProtocol: 0,
            bMaxPacketSize0: self
                .bus
                .eps
                .get(EpAddress::CONTROL_OUT)
                .max_packet as u8,
            idVendor: d.vendor_id.to_le_bytes(),
            idProduct: d.product_id.to_le_bytes(),
            bcdDevice: d.version_bcd.to_le_bytes(),
            iManufacturer: ISTR_VENDOR,
            iProduct: ISTR_PRODUCT,
            iSerialNumber: match d.serial_number {
                SerialNumber::None => 0,
                _ => ISTR_SERIAL,
            },
            bNumConfigurations: MAX_CONFIGURATION_COUNT,
        };
        let bytes = bytemuck::bytes_of(&desc);
        self.bus.ctrl_buf[..bytes.len()].copy_from_slice(bytes);
        bytes.len()
    }

    /// Concatenate each function's descriptors after the 9-byte header,
    /// then patch the header with the final totals
    pub(crate) fn write_config_descriptor(
        &mut self,
        funcs: &mut Functions<'_, P>,
    ) -> usize {
        let speed = self.bus.speed;
        let header_len = core::mem::size_of::<ConfigurationDescriptor>();
        let mut total = header_len;

        for index in 0..self.layout.function_count().min(funcs.len()) {
            let base_if = self.layout.base_interface(index);
            total += funcs[index].write_descriptor(
                speed,
                base_if,
                &mut self.bus.ctrl_buf[total..],
            );
        }

        let mut attributes = 0x80;
        if self.description.self_powered {
            attributes |= 1 << 6;
        }
        if self.description.remote_wakeup {
            attributes |= 1 << 5;
        }

        let desc = ConfigurationDescriptor {
            bLength: header_len as u8,
            bDescriptorType: CONFIGURATION_DESCRIPTOR,
            wTotalLength: (total as u16).to_le_bytes(),
            bNumInterfaces: self.layout.interface_count(),
            bConfigurationValue: 1,
            iConfiguration: ISTR_CONFIG,
            bmAttributes: attributes,
            bMaxPower: (self.description.max_current_ma / 2) as u8,
        };
        self.bus.ctrl_buf[..header_len]
            .copy_from_slice(bytemuck::bytes_of(&desc));
        total
    }

    fn write_qualifier_descriptor(&mut self) -> usize {
        let desc = DeviceQualifierDescriptor {
            bLength: core::mem::size_of::<DeviceQualifierDescriptor>() as u8,
            bDescriptorType: DEVICE_QUALIFIER_DESCRIPTOR,
            bcdUSB: self.spec_bcd().to_le_bytes(),
            bDeviceClass: 0,
            bDeviceSubClass: 0,
            bDeviceProtocol: 0,
            bMaxPacketSize0: self
                .bus
                .eps
                .get(EpAddress::CONTROL_OUT)
                .max_packet as u8,
            bNumConfigurations: MAX_CONFIGURATION_COUNT,
            bReserved: 0,
        };
        let bytes = bytemuck::bytes_of(&desc);
        self.bus.ctrl_buf[..bytes.len()].copy_from_slice(bytes);
        bytes.len()
    }

    fn write_string_descriptor(
        &mut self,
        funcs: &mut Functions<'_, P>,
    ) -> usize {
        let index = (self.bus.setup.wValue & 0xFF) as u8;
        let buf = &mut self.bus.ctrl_buf;

        match index {
            // The list of supported Unicode language identifiers
            ISTR_LANGID => {
                buf[0] = 4;
                buf[1] = STRING_DESCRIPTOR;
                buf[2..4].copy_from_slice(&LANGID_US_ENGLISH.to_le_bytes());
                4
            }

            // For the rest, setup.wIndex carries the LangID of the
            // requested string; a single language is supported

            ISTR_VENDOR => {
                write_string_descriptor(buf, self.description.vendor_name)
            }

            ISTR_PRODUCT => {
                write_string_descriptor(buf, self.description.product_name)
            }

            ISTR_CONFIG => {
                write_string_descriptor(buf, self.description.config_name)
            }

            ISTR_SERIAL => match self.description.serial_number {
                SerialNumber::Ascii(s) => write_string_descriptor(buf, s),
                SerialNumber::Bcd(b) => write_hex_string_descriptor(buf, b),
                SerialNumber::None => 0,
            },

            ISTR_MS_OS_1P0
                if self.description.ms_os_desc == MsOsDescVersion::V1 =>
            {
                write_ms_os_10_string_descriptor(buf)
            }

            // Remaining indices decode as (interface, intra-interface
            // string)
            _ => {
                let if_num = (index & 0xF).wrapping_sub(ISTR_INTERFACES);
                let intra = index >> 4;
                if if_num >= self.layout.interface_count() {
                    return 0;
                }
                let Some(func) = self
                    .layout
                    .function_for_interface(if_num)
                    .filter(|i| *i < funcs.len())
                else {
                    return 0;
                };
                match funcs[func].interface_string(intra) {
                    Some(InterfaceString::Ascii(s)) => {
                        write_string_descriptor(buf, s)
                    }
                    Some(InterfaceString::HexBytes(b)) => {
                        write_hex_string_descriptor(buf, b)
                    }
                    None => 0,
                }
            }
        }
    }

    /// Binary device Object Store: USB 2.0 extension capability (with
    /// the LPM bits when enabled), plus the Microsoft OS 2.0 platform
    /// capability whose set length comes from a trial assembly
    fn write_bos_descriptor(
        &mut self,
        funcs: &mut Functions<'_, P>,
    ) -> usize {
        let v2 = self.description.ms_os_desc == MsOsDescVersion::V2;
        if !self.description.lpm && !v2 {
            return 0;
        }

        // Trial-assemble the MS OS 2.0 set first, for its total length
        let ms_set_len = if v2 { self.write_ms_os_20_set(funcs) } else { 0 };

        let buf = &mut self.bus.ctrl_buf;
        let total: u16 = if v2 { 5 + 7 + 28 } else { 5 + 7 };

        // BOS base
        buf[0] = 5;
        buf[1] = BOS_DESCRIPTOR;
        buf[2..4].copy_from_slice(&total.to_le_bytes());
        buf[4] = if v2 { 2 } else { 1 };

        // USB 2.0 extension capability; bit1 = LPM supported, bit2 =
        // BESL and alternate HIRD definitions
        let lpm_attributes: u32 =
            if self.description.lpm { 0x06 } else { 0x00 };
        buf[5] = 7;
        buf[6] = crate::wire::DEVICE_CAPABILITY_DESCRIPTOR;
        buf[7] = DEVCAP_USB_2P0_EXT;
        buf[8..12].copy_from_slice(&lpm_attributes.to_le_bytes());

        if v2 {
            // Microsoft OS 2.0 platform capability
            buf[12] = 28;
            buf[13] = crate::wire::DEVICE_CAPABILITY_DESCRIPTOR;
            buf[14] = DEVCAP_PLATFORM;
            buf[15] = 0;
            buf[16..32].copy_from_slice(&MS_OS_20_PLATFORM_UUID);
            buf[32..36].copy_from_slice(
                &MS_OS_20_MIN_WINDOWS_VERSION.to_le_bytes(),
            );
            buf[36..38]
                .copy_from_slice(&(ms_set_len as u16).to_le_bytes());
            buf[38] = crate::wire::MICROSOFT_OS_REQUEST;
            buf[39] = 0;
        }

        total as usize
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/descriptor.rs"]
mod tests;
