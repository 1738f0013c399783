//! SCSI command dispatch for the Bulk-Only Transport: parses the
//! command block, validates it against the thirteen-cases rules, and
//! prepares response data or starts the block transfer loop.
//!
//! Multi-byte fields inside command blocks and responses are big-endian
//! on the wire.

use crate::{BotState, CswStatus, MassStorage};
use skua_usb_device::device::Bus;
use skua_usb_device::port::PortDriver;

// Operation codes handled here
const TEST_UNIT_READY: u8 = 0x00;
const REQUEST_SENSE: u8 = 0x03;
const INQUIRY: u8 = 0x12;
const MODE_SENSE6: u8 = 0x1A;
const START_STOP_UNIT: u8 = 0x1B;
const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
const READ_FORMAT_CAPACITIES: u8 = 0x23;
const READ_CAPACITY10: u8 = 0x25;
const READ10: u8 = 0x28;
const WRITE10: u8 = 0x2A;
const VERIFY10: u8 = 0x2F;
const MODE_SENSE10: u8 = 0x5A;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub enum SenseKey {
    #[default]
    NoSense = 0x0,
    RecoveredError = 0x1,
    NotReady = 0x2,
    MediumError = 0x3,
    HardwareError = 0x4,
    IllegalRequest = 0x5,
    UnitAttention = 0x6,
    DataProtect = 0x7,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub enum AdditionalSense {
    #[default]
    None = 0x00,
    WriteFault = 0x03,
    UnrecoveredReadError = 0x11,
    InvalidCdb = 0x20,
    AddressOutOfRange = 0x21,
    InvalidFieldInCommand = 0x24,
    WriteProtected = 0x27,
    MediumNotPresent = 0x3A,
}

/// The latest sense data, consumed by the next REQUEST SENSE
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, Default)]
pub struct ScsiSense {
    pub key: SenseKey,
    pub additional: AdditionalSense,
}

fn be16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn be32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl MassStorage<'_> {
    /// Route the command block to its handler; send any prepared
    /// response data and account for it in the CSW residue
    pub(crate) fn process_command<P: PortDriver>(
        &mut self,
        bus: &mut Bus<P>,
    ) {
        let resp_len = match self.cbw().cb[0] {
            READ10 => {
                self.cmd_read10(bus);
                0
            }

            WRITE10 => {
                self.cmd_write10(bus);
                0
            }

            VERIFY10 => self.cmd_verify10(),

            INQUIRY => self.cmd_inquiry(),

            READ_FORMAT_CAPACITIES => self.cmd_read_format_capacities(),

            TEST_UNIT_READY => self.cmd_test_unit_ready(),

            REQUEST_SENSE => self.cmd_request_sense(),

            START_STOP_UNIT | PREVENT_ALLOW_MEDIUM_REMOVAL => 0,

            MODE_SENSE6 => self.cmd_mode_sense(self.cbw().cb[4] as usize),

            MODE_SENSE10 => {
                self.cmd_mode_sense(be16(&self.cbw().cb[7..9]) as usize)
            }

            READ_CAPACITY10 => self.cmd_read_capacity10(),

            _ => {
                self.put_sense(
                    SenseKey::IllegalRequest,
                    AdditionalSense::InvalidCdb,
                );
                0
            }
        };

        let resp_len = resp_len.min(self.cbw().data_length as usize);

        // Responses prepared in the block buffer are sent from here
        if self.csw.status == CswStatus::Passed
            && self.state == BotState::CommandOut
            && resp_len > 0
        {
            let in_ep = self.config.in_ep;
            let _ = bus.ep_send(in_ep, &self.buffer[..resp_len]);
            self.csw.residue -= resp_len as u32;

            // Send the CSW next
            self.state = BotState::StatusIn;
        }
    }

    fn cmd_inquiry(&mut self) -> usize {
        let evpd = self.cbw().cb[1] & 0x01;
        let alloc_len = be16(&self.cbw().cb[3..5]) as usize;

        let resp_len = if evpd != 0 {
            // Vital Product Data is not kept; answer with an empty page
            self.buffer[..5].fill(0);
            5
        } else {
            let data = self.current_lu().inquiry().to_bytes();
            self.buffer[..data.len()].copy_from_slice(&data);
            data.len()
        };

        resp_len.min(alloc_len)
    }

    fn cmd_read_capacity10(&mut self) -> usize {
        let status = self.current_lu().status();
        if !status.ready {
            self.put_sense(
                SenseKey::NotReady,
                AdditionalSense::MediumNotPresent,
            );
            return 0;
        }

        self.buffer[0..4]
            .copy_from_slice(&(status.block_count - 1).to_be_bytes());
        self.buffer[4..8].copy_from_slice(&status.block_size.to_be_bytes());
        8
    }

    fn cmd_read_format_capacities(&mut self) -> usize {
        let status = self.current_lu().status();
        let alloc_len = be16(&self.cbw().cb[7..9]) as usize;

        self.buffer[..12].fill(0);
        self.buffer[3] = 8; // capacity list length
        self.buffer[4..8]
            .copy_from_slice(&(status.block_count - 1).to_be_bytes());
        self.buffer[8] = 2; // formatted media
        self.buffer[10..12]
            .copy_from_slice(&(status.block_size as u16).to_be_bytes());

        12.min(alloc_len)
    }

    fn cmd_mode_sense(&mut self, alloc_len: usize) -> usize {
        self.buffer[..8].fill(0);
        8.min(alloc_len)
    }

    fn cmd_request_sense(&mut self) -> usize {
        let alloc_len = self.cbw().cb[4] as usize;

        self.buffer[..18].fill(0);
        self.buffer[0] = 0x70; // fixed format, current errors
        self.buffer[2] = self.sense.key as u8;
        self.buffer[7] = 18 - 7; // additional sense length
        self.buffer[12] = self.sense.additional as u8;

        18.min(alloc_len)
    }

    fn cmd_test_unit_ready(&mut self) -> usize {
        // Case 9: the host expects data where none can come
        if self.cbw().data_length != 0 {
            self.put_sense(
                SenseKey::IllegalRequest,
                AdditionalSense::InvalidCdb,
            );
        } else if !self.current_lu().status().ready {
            self.put_sense(
                SenseKey::NotReady,
                AdditionalSense::MediumNotPresent,
            );
        }
        0
    }

    fn cmd_verify10(&mut self) -> usize {
        let cb = self.cbw().cb;
        let byte_check = (cb[1] & 0x02) != 0;
        let lba = be32(&cb[2..6]);
        let count = be16(&cb[7..9]) as u32;
        let status = self.current_lu().status();

        if byte_check {
            // Byte-by-byte comparison would need a second buffer
            self.put_sense(
                SenseKey::IllegalRequest,
                AdditionalSense::InvalidFieldInCommand,
            );
        } else if (lba as u64 + count as u64) > status.block_count as u64 {
            self.put_sense(
                SenseKey::IllegalRequest,
                AdditionalSense::AddressOutOfRange,
            );
        }
        0
    }

    fn cmd_read10<P: PortDriver>(&mut self, bus: &mut Bus<P>) {
        let cb = self.cbw().cb;
        let lba = be32(&cb[2..6]);
        let count = be16(&cb[7..9]) as u32;
        let status = self.current_lu().status();

        // Case 10: host expects to send data
        if !self.cbw().is_data_in() {
            self.put_sense(
                SenseKey::IllegalRequest,
                AdditionalSense::InvalidCdb,
            );
        } else if !status.ready {
            self.put_sense(
                SenseKey::NotReady,
                AdditionalSense::MediumNotPresent,
            );
        } else if (lba as u64 + count as u64) > status.block_count as u64 {
            self.put_sense(
                SenseKey::IllegalRequest,
                AdditionalSense::AddressOutOfRange,
            );
        } else {
            self.address = lba * status.block_size;
            self.remaining = count * status.block_size;

            // Cases 4, 5: wire length and command length disagree
            if self.cbw().data_length != self.remaining {
                self.put_sense(
                    SenseKey::IllegalRequest,
                    AdditionalSense::InvalidCdb,
                );
            } else {
                self.start_data_in(bus);
            }
        }
    }

    fn cmd_write10<P: PortDriver>(&mut self, bus: &mut Bus<P>) {
        let cb = self.cbw().cb;
        let lba = be32(&cb[2..6]);
        let count = be16(&cb[7..9]) as u32;
        let status = self.current_lu().status();

        // Case 8: host expects to read data
        if self.cbw().is_data_in() {
            self.put_sense(
                SenseKey::IllegalRequest,
                AdditionalSense::InvalidCdb,
            );
        } else if !status.ready {
            self.put_sense(
                SenseKey::NotReady,
                AdditionalSense::MediumNotPresent,
            );
        } else if !status.writable {
            self.put_sense(
                SenseKey::NotReady,
                AdditionalSense::WriteProtected,
            );
        } else if (lba as u64 + count as u64) > status.block_count as u64 {
            self.put_sense(
                SenseKey::IllegalRequest,
                AdditionalSense::AddressOutOfRange,
            );
        } else {
            self.address = lba * status.block_size;
            self.remaining = count * status.block_size;

            // Cases 3, 11, 13: wire length and command length disagree
            if self.cbw().data_length != self.remaining {
                self.put_sense(
                    SenseKey::IllegalRequest,
                    AdditionalSense::InvalidCdb,
                );
            } else {
                self.start_data_out(bus);
            }
        }
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/scsi.rs"]
mod tests;
