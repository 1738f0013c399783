#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![cfg_attr(docsrs, feature(doc_cfg_hide))]
#![cfg_attr(docsrs, doc(cfg_hide(doc)))]

mod debug;
mod scsi;

pub use scsi::{AdditionalSense, ScsiSense, SenseKey};

use skua_usb_device::device::Bus;
use skua_usb_device::function::{
    EpClaim, EpClaims, FunctionProfile, InterfaceString, UsbFunction,
};
use skua_usb_device::port::PortDriver;
use skua_usb_device::types::{
    bulk_max_packet, EpAddress, EpKind, UsbError, UsbSpeed,
};
use skua_usb_device::wire::{
    interface_string_index, write_endpoint_descriptor, InterfaceDescriptor,
    CLASS_REQUEST, INTERFACE_DESCRIPTOR,
};

/// Chunk size for READ(10)/WRITE(10) looping; one block of the common
/// 512-byte geometry per endpoint transfer
pub const BLOCK_BUFFER_SIZE: usize = 512;

// Class/subclass/protocol codes (MSC spec, section 1)
const MSC_CLASS: u8 = 0x08;
const MSC_SUBCLASS_SCSI_TRANSPARENT: u8 = 0x06;
const MSC_PROTOCOL_BULK_ONLY: u8 = 0x50;

// Class requests (MSC BOT spec, section 3)
const REQ_BULK_ONLY_RESET: u8 = 0xFF;
const REQ_GET_MAX_LUN: u8 = 0xFE;

/// Geometry and accessibility of one logical unit
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
pub struct LuStatus {
    pub block_count: u32,
    pub block_size: u32,
    pub ready: bool,
    pub writable: bool,
}

/// Fixed identification data returned by INQUIRY
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
pub struct InquiryData {
    /// Up to 8 characters, space padded on the wire
    pub vendor_id: &'static str,
    /// Up to 16 characters, space padded on the wire
    pub product_id: &'static str,
    /// Up to 4 characters, space padded on the wire
    pub revision: &'static str,
    pub removable: bool,
}

impl InquiryData {
    /// The standard-inquiry wire format (SPC, "standard INQUIRY data")
    pub fn to_bytes(&self) -> [u8; 36] {
        let mut data = [0u8; 36];
        data[1] = if self.removable { 0x80 } else { 0 };
        data[3] = 0x02; // response data format
        data[4] = 32; // additional length
        data[8..36].fill(b' ');
        for (dst, src) in
            data[8..16].iter_mut().zip(self.vendor_id.bytes())
        {
            *dst = src;
        }
        for (dst, src) in
            data[16..32].iter_mut().zip(self.product_id.bytes())
        {
            *dst = src;
        }
        for (dst, src) in data[32..36].iter_mut().zip(self.revision.bytes())
        {
            *dst = src;
        }
        data
    }
}

/// One addressable unit of storage behind a mass-storage function
pub trait LogicalUnit {
    fn status(&self) -> LuStatus;

    fn inquiry(&self) -> InquiryData;

    /// Read `blocks` blocks starting at `lba` into `dest`
    fn read(
        &mut self,
        dest: &mut [u8],
        lba: u32,
        blocks: u32,
    ) -> Result<(), UsbError>;

    /// Write `blocks` blocks starting at `lba` from `src`
    fn write(
        &mut self,
        src: &[u8],
        lba: u32,
        blocks: u32,
    ) -> Result<(), UsbError>;

    /// The unit's interface was configured
    fn init(&mut self) {}

    /// The unit's interface was deconfigured
    fn deinit(&mut self) {}
}

/// Endpoint assignment for a mass-storage function
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
pub struct MscConfig {
    pub in_ep: EpAddress,
    pub out_ep: EpAddress,
}

/// Command Block Wrapper, the 31-byte little-endian record opening
/// every Bulk-Only transaction
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, Default)]
pub struct Cbw {
    pub signature: u32,
    pub tag: u32,
    pub data_length: u32,
    pub flags: u8,
    pub lun: u8,
    pub cb_len: u8,
    pub cb: [u8; 16],
}

impl Cbw {
    pub const SIGNATURE: u32 = 0x4342_5355; // "USBC"
    pub const SIZE: usize = 31;

    /// Decode as much of a CBW as arrived; validity is judged
    /// separately so a malformed wrapper still reaches the error path
    pub fn parse(data: &[u8]) -> Self {
        let mut raw = [0u8; Self::SIZE];
        let n = data.len().min(Self::SIZE);
        raw[..n].copy_from_slice(&data[..n]);

        let mut cb = [0u8; 16];
        cb.copy_from_slice(&raw[15..31]);
        Self {
            signature: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            tag: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
            data_length: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            flags: raw[12],
            lun: raw[13],
            cb_len: raw[14],
            cb,
        }
    }

    /// Direction flag: bit 7 set means the data phase is device-to-host
    pub fn is_data_in(&self) -> bool {
        (self.flags & 0x80) != 0
    }
}

/// Command Status Wrapper, the 13-byte reply closing every transaction
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, Default)]
pub struct Csw {
    pub tag: u32,
    pub residue: u32,
    pub status: CswStatus,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub enum CswStatus {
    #[default]
    Passed = 0,
    Failed = 1,
    PhaseError = 2,
}

impl Csw {
    pub const SIGNATURE: u32 = 0x5342_5355; // "USBS"
    pub const SIZE: usize = 13;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut raw = [0u8; Self::SIZE];
        raw[0..4].copy_from_slice(&Self::SIGNATURE.to_le_bytes());
        raw[4..8].copy_from_slice(&self.tag.to_le_bytes());
        raw[8..12].copy_from_slice(&self.residue.to_le_bytes());
        raw[12] = self.status as u8;
        raw
    }
}

/// Bulk-Only Transport protocol phase
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
enum BotState {
    /// Waiting for (or receiving) a CBW; the only state that accepts one
    CommandOut,
    /// Streaming READ data to the host
    DataIn,
    /// Receiving WRITE data from the host
    DataOut,
    /// Data done, CSW goes out on the next IN completion
    StatusIn,
    /// An endpoint is halted until the host clears it
    Stall,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
enum BotStatus {
    Normal,
    /// Bulk-Only Reset seen; waiting for the host to clear both halts
    Recovery,
    /// Invalid CBW; both endpoints stay halted until Reset-Recovery
    Error,
}

/// A Mass Storage (Bulk-Only Transport) device function over one or
/// more logical units
pub struct MassStorage<'d> {
    config: MscConfig,
    lus: &'d mut [&'d mut dyn LogicalUnit],
    state: BotState,
    status: BotStatus,
    cbw: Cbw,
    csw: Csw,
    pub(crate) sense: ScsiSense,
    /// Byte address and bytes left of the running READ/WRITE
    pub(crate) address: u32,
    pub(crate) remaining: u32,
    buffer: [u8; BLOCK_BUFFER_SIZE],
}

impl<'d> MassStorage<'d> {
    /// `lus` must hold at least one logical unit; LUN numbering follows
    /// the slice order
    pub fn new(
        config: MscConfig,
        lus: &'d mut [&'d mut dyn LogicalUnit],
    ) -> Self {
        Self {
            config,
            lus,
            state: BotState::CommandOut,
            status: BotStatus::Normal,
            cbw: Cbw::default(),
            csw: Csw::default(),
            sense: ScsiSense::default(),
            address: 0,
            remaining: 0,
            buffer: [0; BLOCK_BUFFER_SIZE],
        }
    }

    pub fn max_lun(&self) -> u8 {
        (self.lus.len() - 1) as u8
    }

    pub(crate) fn cbw(&self) -> &Cbw {
        &self.cbw
    }

    pub(crate) fn current_lu(&mut self) -> &mut dyn LogicalUnit {
        &mut *self.lus[self.cbw.lun as usize]
    }

    /// Record a sense code for the next REQUEST SENSE and fail the
    /// transaction
    pub(crate) fn put_sense(&mut self, key: SenseKey, asc: AdditionalSense) {
        self.sense = ScsiSense {
            key,
            additional: asc,
        };
        self.csw.status = CswStatus::Failed;
    }

    fn receive_cbw<P: PortDriver>(&mut self, bus: &mut Bus<P>) {
        self.state = BotState::CommandOut;
        let _ = bus.ep_receive(self.config.out_ep, Cbw::SIZE as u16);
    }

    fn send_csw<P: PortDriver>(&mut self, bus: &mut Bus<P>) {
        let _ = bus.ep_send(self.config.in_ep, &self.csw.to_bytes());
        self.receive_cbw(bus);
    }

    /// Read the next chunk from the logical unit and queue it on the
    /// Bulk IN endpoint
    pub(crate) fn process_read<P: PortDriver>(&mut self, bus: &mut Bus<P>) {
        let block_size = self.current_lu().status().block_size;
        let len = (self.remaining).min(BLOCK_BUFFER_SIZE as u32);
        let lba = self.address / block_size;
        let blocks = len / block_size;

        let lun = self.cbw.lun as usize;
        let result =
            self.lus[lun].read(&mut self.buffer[..len as usize], lba, blocks);

        if result.is_err() {
            self.put_sense(
                SenseKey::HardwareError,
                AdditionalSense::UnrecoveredReadError,
            );
            return;
        }

        let _ = bus.ep_send(self.config.in_ep, &self.buffer[..len as usize]);

        self.address += len;
        self.remaining -= len;
        self.csw.residue -= len;

        if self.remaining == 0 {
            // Next transfer is the CSW
            self.state = BotState::StatusIn;
        }
    }

    /// Commit received WRITE data to the logical unit and arm the next
    /// chunk
    fn process_write<P: PortDriver>(&mut self, bus: &mut Bus<P>, data: &[u8]) {
        let block_size = self.current_lu().status().block_size;
        let len = (data.len() as u32).min(self.remaining);
        let lba = self.address / block_size;
        let blocks = len / block_size;

        let lun = self.cbw.lun as usize;
        let result = self.lus[lun].write(&data[..len as usize], lba, blocks);

        if result.is_err() {
            self.put_sense(
                SenseKey::HardwareError,
                AdditionalSense::WriteFault,
            );
            return;
        }

        self.address += len;
        self.remaining -= len;
        self.csw.residue -= len;

        if self.remaining > 0 {
            let next = self.remaining.min(BLOCK_BUFFER_SIZE as u32);
            let _ = bus.ep_receive(self.config.out_ep, next as u16);
        }
    }

    /// Arm reception of the first WRITE chunk
    pub(crate) fn start_data_out<P: PortDriver>(&mut self, bus: &mut Bus<P>) {
        self.state = BotState::DataOut;
        let len = self.remaining.min(BLOCK_BUFFER_SIZE as u32);
        let _ = bus.ep_receive(self.config.out_ep, len as u16);
    }

    pub(crate) fn start_data_in<P: PortDriver>(&mut self, bus: &mut Bus<P>) {
        self.state = BotState::DataIn;
        self.process_read(bus);
    }

    fn command_out<P: PortDriver>(&mut self, bus: &mut Bus<P>, data: &[u8]) {
        let cbw = Cbw::parse(data);

        // CSW initial setup
        self.csw.tag = cbw.tag;
        self.csw.residue = cbw.data_length;
        self.csw.status = CswStatus::Passed;

        let valid = data.len() == Cbw::SIZE
            && cbw.signature == Cbw::SIGNATURE
            && cbw.lun <= self.max_lun()
            && cbw.cb_len >= 1
            && cbw.cb_len <= 16;

        if valid {
            self.cbw = cbw;
            self.process_command(bus);

            if self.cbw.data_length == 0 {
                self.send_csw(bus);
            } else if self.csw.status != CswStatus::Passed {
                // Rejected command: terminate the data transport by
                // stalling the endpoint it would have used
                self.state = BotState::Stall;
                if self.cbw.is_data_in() {
                    bus.ep_stall(self.config.in_ep);
                } else {
                    bus.ep_stall(self.config.out_ep);
                }
            }
        } else {
            debug::println!("invalid CBW ({} bytes)", data.len());
            self.put_sense(
                SenseKey::IllegalRequest,
                AdditionalSense::InvalidCdb,
            );
            self.state = BotState::Stall;
            self.status = BotStatus::Error;
            bus.ep_stall(self.config.out_ep);
            bus.ep_stall(self.config.in_ep);
        }
    }
}

impl<P: PortDriver> UsbFunction<P> for MassStorage<'_> {
    fn profile(&self) -> FunctionProfile {
        let mut endpoints = EpClaims::new();
        endpoints.push(EpClaim {
            address: self.config.in_ep,
            kind: EpKind::Bulk,
            max_packet: bulk_max_packet(UsbSpeed::High480),
        });
        endpoints.push(EpClaim {
            address: self.config.out_ep,
            kind: EpKind::Bulk,
            max_packet: bulk_max_packet(UsbSpeed::High480),
        });
        FunctionProfile {
            interfaces: 1,
            alt_settings: 1,
            endpoints,
        }
    }

    fn write_descriptor(
        &self,
        speed: UsbSpeed,
        base_if: u8,
        out: &mut [u8],
    ) -> usize {
        let desc = InterfaceDescriptor {
            bLength: core::mem::size_of::<InterfaceDescriptor>() as u8,
            bDescriptorType: INTERFACE_DESCRIPTOR,
            bInterfaceNumber: base_if,
            bAlternateSetting: 0,
            bNumEndpoints: 2,
            bInterfaceClass: MSC_CLASS,
            bInterfaceSubClass: MSC_SUBCLASS_SCSI_TRANSPARENT,
            bInterfaceProtocol: MSC_PROTOCOL_BULK_ONLY,
            iInterface: interface_string_index(base_if, 0),
        };
        let mut len = core::mem::size_of::<InterfaceDescriptor>();
        out[..len].copy_from_slice(bytemuck::bytes_of(&desc));

        let mps = bulk_max_packet(speed);
        len += write_endpoint_descriptor(
            &mut out[len..],
            self.config.out_ep,
            EpKind::Bulk,
            mps,
            0,
            speed,
        );
        len += write_endpoint_descriptor(
            &mut out[len..],
            self.config.in_ep,
            EpKind::Bulk,
            mps,
            0,
            speed,
        );
        len
    }

    fn interface_string(&self, index: u8) -> Option<InterfaceString<'_>> {
        match index {
            0 => Some(InterfaceString::Ascii(
                self.lus[0].inquiry().product_id,
            )),
            _ => None,
        }
    }

    fn ms_compatible_id(&self) -> Option<&str> {
        None
    }

    fn open(&mut self, bus: &mut Bus<P>) {
        let mps = bulk_max_packet(bus.speed());
        bus.ep_open(self.config.in_ep, EpKind::Bulk, mps);
        bus.ep_open(self.config.out_ep, EpKind::Bulk, mps);

        self.status = BotStatus::Normal;
        self.csw = Csw::default();
        self.sense = ScsiSense::default();
        self.receive_cbw(bus);

        for lu in self.lus.iter_mut() {
            lu.init();
        }
    }

    fn close(&mut self, bus: &mut Bus<P>) {
        bus.ep_close(self.config.in_ep);
        bus.ep_close(self.config.out_ep);

        for lu in self.lus.iter_mut() {
            lu.deinit();
        }
    }

    fn control_request(&mut self, bus: &mut Bus<P>) -> Result<(), UsbError> {
        let setup = *bus.setup();
        if setup.request_type() != CLASS_REQUEST {
            return Err(UsbError::Invalid);
        }

        match setup.bRequest {
            REQ_GET_MAX_LUN => {
                let max_lun = self.max_lun();
                bus.ctrl_send(&[max_lun])
            }
            REQ_BULK_ONLY_RESET => {
                self.status = BotStatus::Recovery;
                Ok(())
            }
            _ => Err(UsbError::Invalid),
        }
    }

    fn transfer_in_complete(
        &mut self,
        bus: &mut Bus<P>,
        _addr: EpAddress,
        _len: usize,
    ) {
        match self.state {
            // Keep feeding the host
            BotState::DataIn => {
                self.process_read(bus);
                if self.csw.status != CswStatus::Passed {
                    self.state = BotState::Stall;
                    bus.ep_stall(self.config.in_ep);
                }
            }

            // Single or last transfer is complete, or the host cleared
            // a halted IN endpoint: send the CSW
            BotState::StatusIn | BotState::Stall => {
                if self.status == BotStatus::Normal {
                    self.send_csw(bus);
                }
            }

            // CSW transmission finished
            _ => {}
        }
    }

    fn transfer_out_complete(
        &mut self,
        bus: &mut Bus<P>,
        _addr: EpAddress,
        data: &[u8],
    ) {
        match self.state {
            // Command Transport
            BotState::CommandOut => self.command_out(bus, data),

            // Data Transport
            BotState::DataOut => {
                self.process_write(bus, data);
                if self.csw.status != CswStatus::Passed {
                    self.state = BotState::Stall;
                    bus.ep_stall(self.config.out_ep);
                } else if self.csw.residue == 0 {
                    self.send_csw(bus);
                }
            }

            // The host cleared a halted OUT endpoint
            _ => {
                if self.status == BotStatus::Normal {
                    self.send_csw(bus);
                } else if self.status == BotStatus::Recovery {
                    self.receive_cbw(bus);
                    self.status = BotStatus::Normal;
                }
            }
        }
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/msc.rs"]
mod tests;
