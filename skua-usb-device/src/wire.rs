//! On-the-wire structures and constants from USB 2.0 chapter 9.
//!
//! Multi-byte fields are stored as byte arrays so the structures have no
//! padding and no alignment requirement, and the little-endian wire order
//! is explicit at every access.

use crate::types::{Direction, EpAddress, EpKind, UsbSpeed};

/// A SETUP packet as received on the control endpoint.
///
/// All transactions on control endpoints start with a SETUP packet of
/// this format. (Some are then followed by IN or OUT data packets, but
/// others are not).
///
/// The format of this packet (and the un-Rust-like names of its
/// fields) are defined in the USB 2.0 specification, section 9.3.
/// Other sections of the USB specification, and of the specifications
/// of particular device classes, dictate what to put in these fields.
#[repr(C)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, Default, PartialEq, Eq)]
#[allow(non_snake_case)] // These names are from USB 2.0 table 9-2
pub struct SetupPacket {
    /// The type and specific target of the request.
    pub bmRequestType: u8,
    /// The particular request.
    pub bRequest: u8,
    /// A parameter to the request.
    pub wValue: u16,
    /// A second parameter to the request.
    pub wIndex: u16,
    /// The length of the subsequent IN or OUT data phase; can be zero
    /// if the setup packet itself contains all the required
    /// information.
    pub wLength: u16,
}

impl SetupPacket {
    /// Decode the 8 bytes a device controller hands over on a SETUP event
    pub fn from_bytes(raw: &[u8; 8]) -> Self {
        Self {
            bmRequestType: raw[0],
            bRequest: raw[1],
            wValue: u16::from_le_bytes([raw[2], raw[3]]),
            wIndex: u16::from_le_bytes([raw[4], raw[5]]),
            wLength: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub fn direction(&self) -> Direction {
        if (self.bmRequestType & DEVICE_TO_HOST) != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Request category: standard, class or vendor
    pub fn request_type(&self) -> u8 {
        self.bmRequestType & 0x60
    }

    pub fn recipient(&self) -> u8 {
        self.bmRequestType & 0x1F
    }
}

#[repr(C)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
#[allow(non_snake_case)] // These names are from USB 2.0 table 9-8
pub struct DeviceDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bcdUSB: [u8; 2],
    pub bDeviceClass: u8,
    pub bDeviceSubClass: u8,
    pub bDeviceProtocol: u8,
    pub bMaxPacketSize0: u8,

    pub idVendor: [u8; 2],
    pub idProduct: [u8; 2],
    pub bcdDevice: [u8; 2],
    pub iManufacturer: u8,
    pub iProduct: u8,
    pub iSerialNumber: u8,
    pub bNumConfigurations: u8,
}

// SAFETY: all fields zeroable
unsafe impl bytemuck::Zeroable for DeviceDescriptor {}
// SAFETY: no padding, no disallowed bit patterns
unsafe impl bytemuck::Pod for DeviceDescriptor {}

#[repr(C)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
#[allow(non_snake_case)] // These names are from USB 2.0 table 9-9
pub struct DeviceQualifierDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bcdUSB: [u8; 2],
    pub bDeviceClass: u8,
    pub bDeviceSubClass: u8,
    pub bDeviceProtocol: u8,
    pub bMaxPacketSize0: u8,
    pub bNumConfigurations: u8,
    pub bReserved: u8,
}

// SAFETY: all fields zeroable
unsafe impl bytemuck::Zeroable for DeviceQualifierDescriptor {}
// SAFETY: no padding, no disallowed bit patterns
unsafe impl bytemuck::Pod for DeviceQualifierDescriptor {}

#[repr(C)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
#[allow(non_snake_case)] // These names are from USB 2.0 table 9-10
pub struct ConfigurationDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub wTotalLength: [u8; 2],
    pub bNumInterfaces: u8,
    pub bConfigurationValue: u8,
    pub iConfiguration: u8,
    pub bmAttributes: u8,
    pub bMaxPower: u8,
}

// SAFETY: all fields zeroable
unsafe impl bytemuck::Zeroable for ConfigurationDescriptor {}
// SAFETY: no padding, no disallowed bit patterns
unsafe impl bytemuck::Pod for ConfigurationDescriptor {}

#[repr(C)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
#[allow(non_snake_case)] // These names are from USB 2.0 table 9-12
pub struct InterfaceDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bInterfaceNumber: u8,
    pub bAlternateSetting: u8,
    pub bNumEndpoints: u8,
    pub bInterfaceClass: u8,
    pub bInterfaceSubClass: u8,
    pub bInterfaceProtocol: u8,
    pub iInterface: u8,
}

// SAFETY: all fields zeroable
unsafe impl bytemuck::Zeroable for InterfaceDescriptor {}
// SAFETY: no padding, no disallowed bit patterns
unsafe impl bytemuck::Pod for InterfaceDescriptor {}

/// Interface Association Descriptor, grouping the interfaces of one
/// composite function (USB ECN, table 9-Z)
#[repr(C)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
#[allow(non_snake_case)]
pub struct InterfaceAssociationDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bFirstInterface: u8,
    pub bInterfaceCount: u8,
    pub bFunctionClass: u8,
    pub bFunctionSubClass: u8,
    pub bFunctionProtocol: u8,
    pub iFunction: u8,
}

// SAFETY: all fields zeroable
unsafe impl bytemuck::Zeroable for InterfaceAssociationDescriptor {}
// SAFETY: no padding, no disallowed bit patterns
unsafe impl bytemuck::Pod for InterfaceAssociationDescriptor {}

#[repr(C)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
#[allow(non_snake_case)] // These names are from USB 2.0 table 9-13
pub struct EndpointDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bEndpointAddress: u8,
    pub bmAttributes: u8,
    pub wMaxPacketSize: [u8; 2],
    pub bInterval: u8,
}

// SAFETY: all fields zeroable
unsafe impl bytemuck::Zeroable for EndpointDescriptor {}
// SAFETY: no padding, no disallowed bit patterns
unsafe impl bytemuck::Pod for EndpointDescriptor {}

// For request_type (USB 2.0 table 9-2)
pub const DEVICE_TO_HOST: u8 = 0x80;
pub const HOST_TO_DEVICE: u8 = 0;
pub const STANDARD_REQUEST: u8 = 0;
pub const CLASS_REQUEST: u8 = 0x20;
pub const VENDOR_REQUEST: u8 = 0x40;
pub const RECIPIENT_DEVICE: u8 = 0;
pub const RECIPIENT_INTERFACE: u8 = 1;
pub const RECIPIENT_ENDPOINT: u8 = 2;
pub const RECIPIENT_OTHER: u8 = 3;

// For request (USB 2.0 table 9-4)
pub const GET_STATUS: u8 = 0;
pub const CLEAR_FEATURE: u8 = 1;
pub const SET_FEATURE: u8 = 3;
pub const SET_ADDRESS: u8 = 5;
pub const GET_DESCRIPTOR: u8 = 6;
pub const SET_DESCRIPTOR: u8 = 7;
pub const GET_CONFIGURATION: u8 = 8;
pub const SET_CONFIGURATION: u8 = 9;
pub const GET_INTERFACE: u8 = 10;
pub const SET_INTERFACE: u8 = 11;

/// Vendor request code reserved for the Microsoft OS descriptor path
pub const MICROSOFT_OS_REQUEST: u8 = 0xEE;

// Descriptor types (USB 2.0 table 9-5)
pub const DEVICE_DESCRIPTOR: u8 = 1;
pub const CONFIGURATION_DESCRIPTOR: u8 = 2;
pub const STRING_DESCRIPTOR: u8 = 3;
pub const INTERFACE_DESCRIPTOR: u8 = 4;
pub const ENDPOINT_DESCRIPTOR: u8 = 5;
pub const DEVICE_QUALIFIER_DESCRIPTOR: u8 = 6;
pub const OTHER_SPEED_CONFIGURATION_DESCRIPTOR: u8 = 7;
pub const IAD_DESCRIPTOR: u8 = 11;
pub const BOS_DESCRIPTOR: u8 = 15;
pub const DEVICE_CAPABILITY_DESCRIPTOR: u8 = 16;

// Standard feature selectors (USB 2.0 table 9-6)
pub const FEATURE_EP_HALT: u16 = 0;
pub const FEATURE_REMOTE_WAKEUP: u16 = 1;

/// bcdUSB for a USB 2.0 device (2.1 when a BOS descriptor is present)
pub const SPEC_BCD: u16 = 0x0200;
pub const SPEC_BCD_WITH_BOS: u16 = 0x0201;

/// Default control endpoint max packet size at Full Speed
pub const EP0_FS_MAX_PACKET: u16 = 64;

// String descriptor index layout: the low nibble of an interface string
// index selects the interface (offset by ISTR_INTERFACES), the high
// nibble an interface-internal string.
pub const ISTR_LANGID: u8 = 0x00;
pub const ISTR_INTERFACES: u8 = 0x01;
pub const ISTR_VENDOR: u8 = 0x10;
pub const ISTR_PRODUCT: u8 = 0x20;
pub const ISTR_SERIAL: u8 = 0x30;
pub const ISTR_CONFIG: u8 = 0x40;
pub const ISTR_MS_OS_1P0: u8 = 0xEE;

/// String descriptor index of string `intra_index` of the function whose
/// first interface is `if_num`
pub const fn interface_string_index(if_num: u8, intra_index: u8) -> u8 {
    ISTR_INTERFACES + if_num + (intra_index << 4)
}

/// Supported LangID list: US English only
pub const LANGID_US_ENGLISH: u16 = 0x0409;

/// Write one endpoint descriptor, clamping the packet size to what the
/// link speed allows
pub fn write_endpoint_descriptor(
    out: &mut [u8],
    addr: EpAddress,
    kind: EpKind,
    max_packet: u16,
    interval: u8,
    speed: UsbSpeed,
) -> usize {
    let desc = EndpointDescriptor {
        bLength: core::mem::size_of::<EndpointDescriptor>() as u8,
        bDescriptorType: ENDPOINT_DESCRIPTOR,
        bEndpointAddress: addr.to_wire(),
        bmAttributes: kind as u8,
        wMaxPacketSize: max_packet.min(kind.max_packet_limit(speed)).to_le_bytes(),
        bInterval: interval,
    };
    let bytes = bytemuck::bytes_of(&desc);
    out[..bytes.len()].copy_from_slice(bytes);
    bytes.len()
}

/// Convert a polling interval in milliseconds to the logarithmic
/// `bInterval` encoding used by interrupt endpoints at High Speed
pub fn hs_interval(interval_ms: u32) -> u8 {
    let interval_125us = interval_ms * 8;
    let mut i = 3;
    while i < 16 {
        if interval_125us < (2u32 << i) {
            i += 1;
            break;
        }
        i += 1;
    }
    i as u8
}

/// Expand an ASCII string to a UTF-16LE string descriptor; returns the
/// descriptor length
pub fn write_string_descriptor(out: &mut [u8], s: &str) -> usize {
    let mut len = 2;
    for c in s.chars() {
        out[len..len + 2].copy_from_slice(&(c as u16).to_le_bytes());
        len += 2;
    }
    out[0] = len as u8;
    out[1] = STRING_DESCRIPTOR;
    len
}

/// Expand raw bytes to an uppercase-hex UTF-16LE string descriptor
/// (serial numbers, MAC addresses); returns the descriptor length
pub fn write_hex_string_descriptor(out: &mut [u8], bytes: &[u8]) -> usize {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut len = 2;
    for b in bytes {
        for nibble in [b >> 4, b & 0xF] {
            out[len] = HEX[nibble as usize];
            out[len + 1] = 0;
            len += 2;
        }
    }
    out[0] = len as u8;
    out[1] = STRING_DESCRIPTOR;
    len
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/wire.rs"]
mod tests;
