//! Microsoft OS descriptors: the 1.0 string-plus-compatible-ID scheme
//! and the 2.0 vendor-request descriptor set, both assembled from the
//! mounted functions' compatible IDs so Windows binds the right drivers
//! without an INF.

use crate::device::{Functions, UsbDevice};
use crate::function::UsbFunction;
use crate::port::PortDriver;
use crate::types::{MsOsDescVersion, UsbError};
use crate::wire::{MICROSOFT_OS_REQUEST, STRING_DESCRIPTOR};

// MS OS 1.0 feature indices (wIndex of the vendor request)
const MS_OS_10_EXTENDED_COMPAT_ID_INDEX: u16 = 4;

// MS OS 2.0 wIndex values
const MS_OS_20_DESCRIPTOR_INDEX: u16 = 7;

// MS OS 2.0 wDescriptorType values
const MS_OS_20_SET_HEADER: u16 = 0x00;
const MS_OS_20_SUBSET_HEADER_CONFIGURATION: u16 = 0x01;
const MS_OS_20_SUBSET_HEADER_FUNCTION: u16 = 0x02;
const MS_OS_20_FEATURE_COMPATIBLE_ID: u16 = 0x03;

/// The magic string descriptor Windows probes at index 0xEE: "MSFT100"
/// followed by the vendor request code
pub(crate) fn write_ms_os_10_string_descriptor(out: &mut [u8]) -> usize {
    let mut len = 2;
    for byte in *b"MSFT100" {
        out[len] = byte;
        out[len + 1] = 0;
        len += 2;
    }
    out[len] = MICROSOFT_OS_REQUEST;
    out[len + 1] = 0;
    len += 2;
    out[0] = len as u8;
    out[1] = STRING_DESCRIPTOR;
    len
}

fn put_u16(out: &mut [u8], offset: usize, value: u16) {
    out[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_compatible_id(out: &mut [u8], id: &str) {
    // 8 bytes compatible ID, 8 bytes sub-compatible ID, zero padded
    for (dst, src) in out[..8].iter_mut().zip(id.bytes()) {
        *dst = src;
    }
}

impl<P: PortDriver> UsbDevice<'_, P> {
    /// The Microsoft OS vendor request (bRequest = the code advertised
    /// in the 1.0 string descriptor or the 2.0 platform capability)
    pub(crate) fn get_ms_descriptor(
        &mut self,
        funcs: &mut Functions<'_, P>,
    ) -> Result<(), UsbError> {
        let len = match (self.description.ms_os_desc, self.bus.setup.wIndex) {
            (MsOsDescVersion::V1, MS_OS_10_EXTENDED_COMPAT_ID_INDEX) => {
                self.write_ms_os_10_compat_id_set(funcs)
            }
            (MsOsDescVersion::V2, MS_OS_20_DESCRIPTOR_INDEX) => {
                self.write_ms_os_20_set(funcs)
            }
            _ => 0,
        };

        if len > 0 {
            self.bus.ctrl_send_in_place(len)
        } else {
            Err(UsbError::Invalid)
        }
    }

    /// MS OS 1.0 extended compatible-ID set: a 16-byte header followed
    /// by one 24-byte block per function (empty blocks included, so
    /// every function is enumerated)
    fn write_ms_os_10_compat_id_set(
        &mut self,
        funcs: &mut Functions<'_, P>,
    ) -> usize {
        let buf = &mut self.bus.ctrl_buf;
        let count = self.layout.function_count().min(funcs.len());
        let mut len = 16;

        for index in 0..count {
            let base_if = self.layout.base_interface(index);
            let block = &mut buf[len..len + 24];
            block.fill(0);
            block[0] = base_if;
            if let Some(id) = funcs[index].ms_compatible_id() {
                put_compatible_id(&mut block[2..18], id);
            }
            len += 24;
        }

        buf[..16].fill(0);
        put_u16(buf, 4, 0x0100); // bcdVersion
        put_u16(buf, 6, MS_OS_10_EXTENDED_COMPAT_ID_INDEX);
        buf[8] = count as u8;
        buf[..4].copy_from_slice(&(len as u32).to_le_bytes());
        len
    }

    /// MS OS 2.0 descriptor set: set header, configuration subset, one
    /// function subset per function with a compatible ID. Subsets that
    /// end up empty are rolled back rather than emitted.
    pub(crate) fn write_ms_os_20_set(
        &mut self,
        funcs: &mut Functions<'_, P>,
    ) -> usize {
        let buf = &mut self.bus.ctrl_buf;
        let count = self.layout.function_count().min(funcs.len());

        // Set header
        put_u16(buf, 0, 10); // wLength
        put_u16(buf, 2, MS_OS_20_SET_HEADER);
        buf[4..8].copy_from_slice(
            &crate::descriptor::MS_OS_20_MIN_WINDOWS_VERSION.to_le_bytes(),
        );
        let mut len = 10;

        // Configuration subset
        let config_at = len;
        put_u16(buf, config_at, 8);
        put_u16(buf, config_at + 2, MS_OS_20_SUBSET_HEADER_CONFIGURATION);
        buf[config_at + 4] = 0; // bConfigurationValue - 1
        buf[config_at + 5] = 0;
        len += 8;

        for index in 0..count {
            let base_if = self.layout.base_interface(index);

            // Function subset
            let func_at = len;
            put_u16(buf, func_at, 8);
            put_u16(buf, func_at + 2, MS_OS_20_SUBSET_HEADER_FUNCTION);
            buf[func_at + 4] = base_if;
            buf[func_at + 5] = 0;
            len += 8;

            if let Some(id) = funcs[index].ms_compatible_id() {
                put_u16(buf, len, 20);
                put_u16(buf, len + 2, MS_OS_20_FEATURE_COMPATIBLE_ID);
                buf[len + 4..len + 20].fill(0);
                put_compatible_id(&mut buf[len + 4..len + 20], id);
                len += 20;
            }

            if len > func_at + 8 {
                put_u16(buf, func_at + 6, (len - func_at) as u16);
            } else {
                // No features: roll the subset back
                len = func_at;
            }
        }

        if len > config_at + 8 {
            put_u16(buf, config_at + 6, (len - config_at) as u16);
        } else {
            len = config_at;
        }

        if len > 10 {
            put_u16(buf, 8, len as u16);
        } else {
            // Nothing in the whole set: reject the request
            len = 0;
        }

        len
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/microsoft_os.rs"]
mod tests;
