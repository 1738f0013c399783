#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![cfg_attr(docsrs, feature(doc_cfg_hide))]
#![cfg_attr(docsrs, doc(cfg_hide(doc)))]

mod debug;

use skua_usb_device::device::Bus;
use skua_usb_device::function::{
    EpClaims, FunctionProfile, InterfaceString, UsbFunction,
};
use skua_usb_device::port::PortDriver;
use skua_usb_device::types::{Direction, UsbError, UsbSpeed};
use skua_usb_device::wire::{
    interface_string_index, InterfaceDescriptor, CLASS_REQUEST,
    INTERFACE_DESCRIPTOR,
};

const DFU_CLASS: u8 = 0xFE; // application specific
const DFU_SUBCLASS: u8 = 0x01;
const DFU_PROTOCOL_RUNTIME: u8 = 0x01;
const DFU_PROTOCOL_DFU_MODE: u8 = 0x02;

const DFU_DESC_TYPE_FUNCTIONAL: u8 = 0x21;

const ATTR_WILL_DETACH: u8 = 0x08;
const ATTR_MANIFESTATION_TOLERANT: u8 = 0x04;
const ATTR_CAN_UPLOAD: u8 = 0x02;
const ATTR_CAN_DNLOAD: u8 = 0x01;

/// Block size for DNLOAD/UPLOAD, advertised as wTransferSize
pub const DFU_TRANSFER_SIZE: usize = 256;

// Class requests (DFU 1.1, section 3)
const REQ_DETACH: u8 = 0;
const REQ_DNLOAD: u8 = 1;
const REQ_UPLOAD: u8 = 2;
const REQ_GETSTATUS: u8 = 3;
const REQ_CLRSTATUS: u8 = 4;
const REQ_GETSTATE: u8 = 5;
const REQ_ABORT: u8 = 6;

// DfuSe (STMicro extension) command bytes carried in block 0
const DFUSE_CMD_GETCOMMANDS: u8 = 0x00;
const DFUSE_CMD_SET_ADDRESS: u8 = 0x21;
const DFUSE_CMD_ERASE: u8 = 0x41;
const DFUSE_CMD_READ_UNPROTECT: u8 = 0x92;
const DFUSE_COMMANDS: [u8; 3] =
    [DFUSE_CMD_GETCOMMANDS, DFUSE_CMD_SET_ADDRESS, DFUSE_CMD_ERASE];

/// The magic word that survives a reboot to request DFU mode
pub const DFU_MODE_TAG: u32 = 0xB007_70DF; // "BOOT TO DFU"

/// DFU 1.1 device states, in their wire encoding
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum DfuState {
    AppIdle = 0,
    AppDetach = 1,
    Idle = 2,
    DownloadSync = 3,
    DownloadBusy = 4,
    DownloadIdle = 5,
    ManifestSync = 6,
    Manifest = 7,
    ManifestWaitReset = 8,
    UploadIdle = 9,
    Error = 10,
}

/// DFU 1.1 status codes returned by GETSTATUS
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub enum DfuStatus {
    #[default]
    Ok = 0x00,
    ErrTarget = 0x01,
    ErrFile = 0x02,
    ErrWrite = 0x03,
    ErrErase = 0x04,
    ErrCheckErased = 0x05,
    ErrProg = 0x06,
    ErrVerify = 0x07,
    ErrAddress = 0x08,
    ErrNotDone = 0x09,
    ErrFirmware = 0x0A,
    ErrVendor = 0x0B,
    ErrUsbReset = 0x0C,
    ErrPowerOnReset = 0x0D,
    ErrUnknown = 0x0E,
    ErrStalledPkt = 0x0F,
}

/// The reboot tag, placed by the application in memory that survives a
/// system reset (a no-init RAM section)
#[derive(Default)]
pub struct DfuTag(pub [u32; 2]);

impl DfuTag {
    pub const fn new() -> Self {
        Self([0, 0])
    }

    /// Mark the next boot as a DFU request
    pub fn arm(&mut self) {
        self.0 = [DFU_MODE_TAG, !DFU_MODE_TAG];
    }

    pub fn clear(&mut self) {
        self.0 = [0, 0];
    }

    pub fn is_requested(&self) -> bool {
        self.0[0] == DFU_MODE_TAG && self.0[1] == !DFU_MODE_TAG
    }
}

/// The flash region an upgrade writes
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
pub struct FirmwareRegion {
    pub address: u32,
    pub total_size: u32,
}

/// Flash programming and system control behind a DFU function
pub trait DfuApplication {
    fn firmware(&self) -> FirmwareRegion;

    /// Erase the block containing `address`
    fn erase(&mut self, address: u32) -> DfuStatus;

    /// Program `data` at `address`
    fn write(&mut self, address: u32, data: &[u8]) -> DfuStatus;

    /// Read firmware back for UPLOAD
    fn read(&mut self, address: u32, dest: &mut [u8]);

    /// Worst-case duration of an erase-or-write of `len` bytes at
    /// `address`, reported to the host as the GETSTATUS poll timeout
    fn poll_timeout_ms(&self, _address: u32, _len: usize) -> u32 {
        0
    }

    /// Complete the upgrade (checksum verification and the like)
    fn manifest(&mut self) -> DfuStatus {
        DfuStatus::Ok
    }

    /// Reset the system (after DETACH, or after manifestation when not
    /// manifestation tolerant)
    fn reboot(&mut self);
}

/// Per-request state validity (DFU 1.1, appendix A), indexed by request
const VALID_STATES: [u16; 7] = [
    // DETACH
    1 << DfuState::AppIdle as u16,
    // DNLOAD
    (1 << DfuState::Idle as u16) | (1 << DfuState::DownloadIdle as u16),
    // UPLOAD
    (1 << DfuState::Idle as u16) | (1 << DfuState::UploadIdle as u16),
    // GETSTATUS
    (1 << DfuState::AppIdle as u16)
        | (1 << DfuState::AppDetach as u16)
        | (1 << DfuState::Idle as u16)
        | (1 << DfuState::DownloadSync as u16)
        | (1 << DfuState::DownloadIdle as u16)
        | (1 << DfuState::ManifestSync as u16)
        | (1 << DfuState::UploadIdle as u16)
        | (1 << DfuState::Error as u16),
    // CLRSTATUS
    1 << DfuState::Error as u16,
    // GETSTATE
    (1 << DfuState::AppIdle as u16)
        | (1 << DfuState::AppDetach as u16)
        | (1 << DfuState::Idle as u16)
        | (1 << DfuState::DownloadSync as u16)
        | (1 << DfuState::DownloadIdle as u16)
        | (1 << DfuState::ManifestSync as u16)
        | (1 << DfuState::UploadIdle as u16)
        | (1 << DfuState::Error as u16),
    // ABORT
    (1 << DfuState::Idle as u16)
        | (1 << DfuState::DownloadSync as u16)
        | (1 << DfuState::DownloadIdle as u16)
        | (1 << DfuState::ManifestSync as u16)
        | (1 << DfuState::UploadIdle as u16),
];

/// Behavior switches fixed at construction
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
pub struct DfuConfig {
    /// Keep answering after manifestation instead of rebooting
    pub manifestation_tolerant: bool,
    /// Speak the STMicro DfuSe command set
    pub dfuse: bool,
    pub name: &'static str,
}

/// A DFU function: runtime flavor (just DETACH) or bootloader flavor
/// (the full upgrade machine), depending on the constructor
pub struct Dfu<'d> {
    config: DfuConfig,
    app: &'d mut dyn DfuApplication,
    tag: &'d mut DfuTag,
    state: DfuState,
    status: DfuStatus,
    poll_timeout: u32,
    address: u32,
    block_num: u16,
    block_length: u16,
    detach_timeout_ms: u16,
    block: [u8; DFU_TRANSFER_SIZE],
}

impl<'d> Dfu<'d> {
    /// The runtime flavor mounted next to the application's other
    /// functions; only DETACH (plus status queries) works here
    pub fn runtime(
        config: DfuConfig,
        app: &'d mut dyn DfuApplication,
        tag: &'d mut DfuTag,
        detach_timeout_ms: u16,
    ) -> Self {
        Self {
            config,
            app,
            tag,
            state: DfuState::AppIdle,
            status: DfuStatus::Ok,
            poll_timeout: 0,
            address: 0,
            block_num: 0,
            block_length: 0,
            detach_timeout_ms,
            block: [0; DFU_TRANSFER_SIZE],
        }
    }

    /// The bootloader flavor; enters dfuIDLE when the reboot tag was
    /// armed, and reports missing firmware otherwise
    pub fn bootloader(
        config: DfuConfig,
        app: &'d mut dyn DfuApplication,
        tag: &'d mut DfuTag,
    ) -> Self {
        let requested = tag.is_requested();
        let mut dfu = Self::runtime(config, app, tag, 100);
        if requested {
            dfu.state = DfuState::Idle;
        } else {
            dfu.state = DfuState::Error;
            dfu.status = DfuStatus::ErrFirmware;
        }
        dfu
    }

    pub fn state(&self) -> DfuState {
        self.state
    }

    /// Whether the previous session armed the reboot tag
    pub fn is_requested(&self) -> bool {
        self.tag.is_requested()
    }

    fn in_dfu_mode(&self) -> bool {
        !matches!(self.state, DfuState::AppIdle | DfuState::AppDetach)
    }

    fn attributes(&self) -> u8 {
        let mut attributes =
            ATTR_WILL_DETACH | ATTR_CAN_DNLOAD | ATTR_CAN_UPLOAD;
        if self.config.manifestation_tolerant {
            attributes |= ATTR_MANIFESTATION_TOLERANT;
        }
        attributes
    }

    /// Address a DfuSe download/upload block maps to (blocks 0 and 1
    /// are command blocks)
    fn dfuse_address(&self, block_num: u16) -> u32 {
        self.address
            + (block_num as u32 - 2) * DFU_TRANSFER_SIZE as u32
    }

    fn detach<P: PortDriver>(&mut self, bus: &mut Bus<P>) {
        self.state = DfuState::AppDetach;

        // Shutting down USB detaches from the host; attach happens
        // again in DFU mode after the reboot
        bus.port().stop();
        self.tag.arm();
        self.app.reboot();
    }

    fn download<P: PortDriver>(
        &mut self,
        bus: &mut Bus<P>,
    ) -> Result<(), UsbError> {
        let setup = *bus.setup();

        if setup.wLength == 0 {
            // A zero-length download closes the image and moves to
            // manifestation
            self.block_length = 1;
            self.state = DfuState::ManifestSync;
            return Ok(());
        }

        if setup.wLength as usize > DFU_TRANSFER_SIZE {
            return Err(UsbError::Invalid);
        }

        if !self.config.dfuse {
            if self.state == DfuState::Idle {
                // First block: start at the base of the region
                self.address = self.app.firmware().address;
                self.block_num = 0xFFFF;
            }

            let fw = self.app.firmware();
            let in_sequence =
                setup.wValue == self.block_num.wrapping_add(1);
            let in_range = self.address + setup.wLength as u32
                <= fw.address + fw.total_size;
            if !in_sequence || !in_range {
                return Err(UsbError::Invalid);
            }
        }

        self.block_num = setup.wValue;
        self.block_length = setup.wLength;
        self.state = DfuState::DownloadSync;
        bus.ctrl_receive(setup.wLength as usize)
    }

    fn upload<P: PortDriver>(
        &mut self,
        bus: &mut Bus<P>,
    ) -> Result<(), UsbError> {
        let setup = *bus.setup();

        if setup.wLength == 0 {
            self.state = DfuState::Idle;
            return Ok(());
        }

        if self.config.dfuse {
            self.block_num = setup.wValue;
            match self.block_num {
                0 => {
                    // Supported command bytes
                    self.state =
                        if setup.wLength as usize > DFUSE_COMMANDS.len() {
                            DfuState::Idle
                        } else {
                            DfuState::UploadIdle
                        };
                    bus.ctrl_send(&DFUSE_COMMANDS)
                }
                1 => Err(UsbError::Invalid),
                _ => {
                    self.state = DfuState::UploadIdle;
                    let len =
                        (setup.wLength as usize).min(DFU_TRANSFER_SIZE);
                    let address = self.dfuse_address(self.block_num);
                    self.app.read(address, &mut self.block[..len]);
                    bus.ctrl_send(&self.block[..len])
                }
            }
        } else {
            if self.state == DfuState::Idle {
                self.address = self.app.firmware().address;
                self.block_num = 0xFFFF;
            }

            if setup.wValue != self.block_num.wrapping_add(1) {
                return Err(UsbError::Invalid);
            }

            // Answer short (possibly empty) at the end of the image as
            // the end-of-file marker
            let fw = self.app.firmware();
            let progress = self.address - fw.address;
            let requested =
                (setup.wLength as usize).min(DFU_TRANSFER_SIZE);
            let len = if progress + requested as u32 > fw.total_size {
                (fw.total_size - progress) as usize
            } else {
                requested
            };
            self.state = if len < requested {
                DfuState::Idle
            } else {
                DfuState::UploadIdle
            };

            self.app.read(self.address, &mut self.block[..len]);
            self.address += len as u32;
            self.block_num = setup.wValue;

            bus.ctrl_send(&self.block[..len])
        }
    }

    fn get_status<P: PortDriver>(
        &mut self,
        bus: &mut Bus<P>,
    ) -> Result<(), UsbError> {
        let mut next_state = self.state;

        // Provide the poll timeout before starting a download or
        // manifestation step
        if self.state == DfuState::DownloadSync
            || self.state == DfuState::ManifestSync
        {
            if self.block_length > 0 {
                self.poll_timeout = self.app.poll_timeout_ms(
                    self.address,
                    self.block_length as usize,
                );
                next_state = if self.state == DfuState::DownloadSync {
                    DfuState::DownloadBusy
                } else {
                    DfuState::Manifest
                };
            } else if self.state == DfuState::DownloadSync {
                self.state = DfuState::DownloadIdle;
                next_state = DfuState::DownloadIdle;
            } else {
                // Manifestation has completed
                self.state = DfuState::Idle;
                next_state = DfuState::Idle;
            }
        }

        let timeout = self.poll_timeout.to_le_bytes();
        let reply = [
            self.status as u8,
            timeout[0],
            timeout[1],
            timeout[2],
            self.state as u8,
            0, // iString
        ];
        let result = bus.ctrl_send(&reply);

        self.state = next_state;
        result
    }

    /// The busy work deferred to the GETSTATUS data stage: program the
    /// downloaded block (or run a DfuSe command), or manifest
    fn after_get_status<P: PortDriver>(&mut self, bus: &mut Bus<P>) {
        match self.state {
            DfuState::DownloadBusy => {
                self.state = DfuState::DownloadSync;

                if self.config.dfuse {
                    if self.block_num > 1 {
                        let address = self.dfuse_address(self.block_num);
                        let len = self.block_length as usize;
                        self.status =
                            self.app.write(address, &self.block[..len]);
                    } else if self.block_num == 0 {
                        self.run_dfuse_command();
                    }
                } else {
                    // Erase ahead of the first write
                    if self.address == self.app.firmware().address {
                        self.status = self.app.erase(self.address);
                    }
                    if self.status == DfuStatus::Ok {
                        let len = self.block_length as usize;
                        self.status = self
                            .app
                            .write(self.address, &self.block[..len]);
                        self.address += self.block_length as u32;
                    }
                }

                self.block_length = 0;
                self.poll_timeout = 0;
            }

            DfuState::Manifest => {
                self.status = self.app.manifest();

                if self.status == DfuStatus::Ok {
                    if self.config.manifestation_tolerant {
                        self.state = DfuState::ManifestSync;
                        self.block_length = 0;
                        self.poll_timeout = 0;
                    } else {
                        self.state = DfuState::ManifestWaitReset;

                        // Disconnect and reset into the new firmware
                        bus.port().stop();
                        self.app.reboot();
                    }
                }
            }

            _ => {}
        }

        if self.status != DfuStatus::Ok {
            self.state = DfuState::Error;
        }
    }

    fn run_dfuse_command(&mut self) {
        let command = self.block[0];
        match command {
            DFUSE_CMD_SET_ADDRESS if self.block_length == 5 => {
                self.address = u32::from_le_bytes(
                    self.block[1..5].try_into().unwrap(),
                );
            }
            DFUSE_CMD_ERASE if self.block_length == 5 => {
                self.address = u32::from_le_bytes(
                    self.block[1..5].try_into().unwrap(),
                );
                self.status = self.app.erase(self.address);
            }
            // Left to the application / not acted upon
            DFUSE_CMD_READ_UNPROTECT | DFUSE_CMD_GETCOMMANDS => {}
            _ => {
                debug::println!("unsupported DfuSe command {}", command);
                self.status = DfuStatus::ErrStalledPkt;
            }
        }
    }
}

impl<P: PortDriver> UsbFunction<P> for Dfu<'_> {
    fn profile(&self) -> FunctionProfile {
        FunctionProfile {
            interfaces: 1,
            alt_settings: 1,
            endpoints: EpClaims::new(),
        }
    }

    fn write_descriptor(
        &self,
        _speed: UsbSpeed,
        base_if: u8,
        out: &mut [u8],
    ) -> usize {
        let desc = InterfaceDescriptor {
            bLength: 9,
            bDescriptorType: INTERFACE_DESCRIPTOR,
            bInterfaceNumber: base_if,
            bAlternateSetting: 0,
            bNumEndpoints: 0,
            bInterfaceClass: DFU_CLASS,
            bInterfaceSubClass: DFU_SUBCLASS,
            bInterfaceProtocol: if self.in_dfu_mode() {
                DFU_PROTOCOL_DFU_MODE
            } else {
                DFU_PROTOCOL_RUNTIME
            },
            iInterface: interface_string_index(base_if, 0),
        };
        out[..9].copy_from_slice(bytemuck::bytes_of(&desc));

        // DFU functional descriptor
        out[9] = 9;
        out[10] = DFU_DESC_TYPE_FUNCTIONAL;
        out[11] = self.attributes();
        out[12..14].copy_from_slice(&self.detach_timeout_ms.to_le_bytes());
        out[14..16]
            .copy_from_slice(&(DFU_TRANSFER_SIZE as u16).to_le_bytes());
        let bcd_dfu: u16 = if self.config.dfuse { 0x011A } else { 0x0101 };
        out[16..18].copy_from_slice(&bcd_dfu.to_le_bytes());
        18
    }

    fn interface_string(&self, index: u8) -> Option<InterfaceString<'_>> {
        match index {
            0 => Some(InterfaceString::Ascii(self.config.name)),
            _ => None,
        }
    }

    fn open(&mut self, _bus: &mut Bus<P>) {}

    fn close(&mut self, _bus: &mut Bus<P>) {}

    fn control_request(&mut self, bus: &mut Bus<P>) -> Result<(), UsbError> {
        let setup = *bus.setup();
        if setup.request_type() != CLASS_REQUEST {
            return Err(UsbError::Invalid);
        }

        let request = setup.bRequest as usize;
        if request >= VALID_STATES.len()
            || VALID_STATES[request] & (1 << self.state as u16) == 0
        {
            return Err(UsbError::Invalid);
        }

        match setup.bRequest {
            REQ_DETACH => {
                self.detach(bus);
                Ok(())
            }
            REQ_DNLOAD => self.download(bus),
            REQ_UPLOAD => self.upload(bus),
            REQ_GETSTATUS => self.get_status(bus),
            REQ_CLRSTATUS => {
                self.state = DfuState::Idle;
                self.status = DfuStatus::Ok;
                self.poll_timeout = 0;
                Ok(())
            }
            REQ_GETSTATE => {
                let state = self.state as u8;
                bus.ctrl_send(&[state])
            }
            REQ_ABORT => {
                self.state = DfuState::Idle;
                self.block_length = 0;
                Ok(())
            }
            _ => Err(UsbError::Invalid),
        }
    }

    fn control_complete(&mut self, bus: &mut Bus<P>) {
        let setup = *bus.setup();
        if setup.request_type() != CLASS_REQUEST {
            return;
        }

        match (setup.direction(), setup.bRequest) {
            (Direction::Out, REQ_DNLOAD) => {
                // Stash the block; it is programmed during the next
                // GETSTATUS, when the host expects to wait
                let data = bus.ctrl_data();
                let len = data.len().min(DFU_TRANSFER_SIZE);
                self.block[..len].copy_from_slice(&data[..len]);
            }
            (Direction::In, REQ_GETSTATUS) => self.after_get_status(bus),
            _ => {}
        }
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/dfu.rs"]
mod tests;
