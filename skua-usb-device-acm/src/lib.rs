#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![cfg_attr(docsrs, feature(doc_cfg_hide))]
#![cfg_attr(docsrs, doc(cfg_hide(doc)))]

mod debug;

use skua_usb_device::device::Bus;
use skua_usb_device::function::{
    EpClaim, EpClaims, FunctionProfile, InterfaceString, UsbFunction,
};
use skua_usb_device::port::PortDriver;
use skua_usb_device::types::{
    bulk_max_packet, Direction, EpAddress, EpKind, UsbError, UsbSpeed,
};
use skua_usb_device::wire::{
    interface_string_index, write_endpoint_descriptor,
    InterfaceAssociationDescriptor, InterfaceDescriptor, CLASS_REQUEST,
    IAD_DESCRIPTOR, INTERFACE_DESCRIPTOR,
};

// Class codes
const CDC_COMM_CLASS: u8 = 0x02;
const CDC_DATA_CLASS: u8 = 0x0A;
const CDC_SUBCLASS_ACM: u8 = 0x02;

// Class-specific functional descriptors
const CS_INTERFACE: u8 = 0x24;
const CDC_FUNC_HEADER: u8 = 0x00;
const CDC_FUNC_CALL_MANAGEMENT: u8 = 0x01;
const CDC_FUNC_ACM: u8 = 0x02;
const CDC_FUNC_UNION: u8 = 0x06;

// Class requests (CDC PSTN spec, table 13)
const REQ_SET_LINE_CODING: u8 = 0x20;
const REQ_GET_LINE_CODING: u8 = 0x21;
const REQ_SET_CONTROL_LINE_STATE: u8 = 0x22;
const REQ_SEND_BREAK: u8 = 0x23;

// Notifications
const NOTIFY_SERIAL_STATE: u8 = 0x20;

const NOTIFY_PACKET_SIZE: u16 = 8;
const NOTIFY_INTERVAL: u8 = 10;

/// Host request to hold the break condition until further notice
pub const BREAK_CONTINUOUS: u16 = 0xFFFF;

/// The 7-byte line coding block of SET/GET_LINE_CODING
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct LineCoding {
    pub baud_rate: u32,
    /// 0 = 1 stop bit, 1 = 1.5, 2 = 2
    pub stop_bits: u8,
    /// 0 = none, 1 = odd, 2 = even, 3 = mark, 4 = space
    pub parity: u8,
    pub data_bits: u8,
}

impl Default for LineCoding {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            stop_bits: 0,
            parity: 0,
            data_bits: 8,
        }
    }
}

impl LineCoding {
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < 7 {
            return None;
        }
        Some(Self {
            baud_rate: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            stop_bits: raw[4],
            parity: raw[5],
            data_bits: raw[6],
        })
    }

    pub fn to_bytes(&self) -> [u8; 7] {
        let mut raw = [0u8; 7];
        raw[0..4].copy_from_slice(&self.baud_rate.to_le_bytes());
        raw[4] = self.stop_bits;
        raw[5] = self.parity;
        raw[6] = self.data_bits;
        raw
    }
}

/// What the application plugs into a serial function
pub trait SerialHandler {
    /// The data interface opened with the given line coding
    fn opened(&mut self, _coding: &LineCoding) {}

    /// The data interface closed (reconfiguration or detach)
    fn closed(&mut self) {}

    /// Bytes arrived on the bulk OUT endpoint
    fn received(&mut self, _data: &[u8]) {}

    /// A transmit queued with [`Acm::transmit`] fully reached the host
    fn transmitted(&mut self, _len: usize) {}

    /// DTR/RTS from SET_CONTROL_LINE_STATE
    fn control_line(&mut self, _dtr: bool, _rts: bool) {}

    /// SEND_BREAK: duration in ms, [`BREAK_CONTINUOUS`] to hold, 0 to
    /// release
    fn send_break(&mut self, _duration_ms: u16) {}
}

/// Endpoint assignment for a serial function
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
pub struct AcmConfig {
    pub in_ep: EpAddress,
    pub out_ep: EpAddress,
    /// Interrupt endpoint for serial-state notifications; omit to save
    /// an endpoint
    pub notify_ep: Option<EpAddress>,
    pub name: &'static str,
}

/// A CDC-ACM (virtual serial port) device function
pub struct Acm<'d> {
    config: AcmConfig,
    handler: &'d mut dyn SerialHandler,
    line_coding: LineCoding,
    base_if: u8,
    /// Length of a transfer being terminated by a ZLP, reported to the
    /// handler once the ZLP is out
    transmit_length: u16,
}

impl<'d> Acm<'d> {
    pub fn new(config: AcmConfig, handler: &'d mut dyn SerialHandler) -> Self {
        Self {
            config,
            handler,
            line_coding: LineCoding::default(),
            base_if: 0,
            transmit_length: 0,
        }
    }

    pub fn line_coding(&self) -> &LineCoding {
        &self.line_coding
    }

    /// Queue bytes on the bulk IN endpoint; `Busy` while a previous
    /// transmit is in flight
    pub fn transmit<P: PortDriver>(
        &mut self,
        bus: &mut Bus<P>,
        data: &[u8],
    ) -> Result<(), UsbError> {
        bus.ep_send(self.config.in_ep, data)
    }

    /// Arm reception of up to `len` bytes; they arrive through
    /// [`SerialHandler::received`]
    pub fn receive<P: PortDriver>(
        &mut self,
        bus: &mut Bus<P>,
        len: u16,
    ) -> Result<(), UsbError> {
        bus.ep_receive(self.config.out_ep, len)
    }

    /// Report UART state (bit 0 = DCD, bit 1 = DSR, bit 3 = ring, ...)
    /// through the notification endpoint
    pub fn notify_serial_state<P: PortDriver>(
        &mut self,
        bus: &mut Bus<P>,
        state: u16,
    ) -> Result<(), UsbError> {
        let Some(notify_ep) = self.config.notify_ep else {
            return Err(UsbError::Error);
        };
        let mut notify = [0u8; 10];
        notify[0] = 0xA1;
        notify[1] = NOTIFY_SERIAL_STATE;
        notify[4..6].copy_from_slice(&(self.base_if as u16).to_le_bytes());
        notify[6..8].copy_from_slice(&2u16.to_le_bytes());
        notify[8..10].copy_from_slice(&state.to_le_bytes());
        bus.ep_send(notify_ep, &notify)
    }

    fn open_data<P: PortDriver>(&mut self, bus: &mut Bus<P>) {
        let mps = bulk_max_packet(bus.speed());
        bus.ep_open(self.config.in_ep, EpKind::Bulk, mps);
        bus.ep_open(self.config.out_ep, EpKind::Bulk, mps);
        self.handler.opened(&self.line_coding);
    }

    /// The data interface only closes if it was opened (the line coding
    /// survives until the host writes a new one)
    fn close_data<P: PortDriver>(&mut self, bus: &mut Bus<P>) {
        if self.line_coding.data_bits != 0 {
            bus.ep_close(self.config.in_ep);
            bus.ep_close(self.config.out_ep);
            self.handler.closed();
            self.line_coding.data_bits = 0;
        }
    }
}

impl<P: PortDriver> UsbFunction<P> for Acm<'_> {
    fn profile(&self) -> FunctionProfile {
        let mut endpoints = EpClaims::new();
        if let Some(notify_ep) = self.config.notify_ep {
            endpoints.push(EpClaim {
                address: notify_ep,
                kind: EpKind::Interrupt,
                max_packet: NOTIFY_PACKET_SIZE,
            });
        }
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
            interfaces: 2,
            alt_settings: 1,
            endpoints,
        }
    }

    fn mounted(&mut self, base_if: u8) {
        self.base_if = base_if;
    }

    fn write_descriptor(
        &self,
        speed: UsbSpeed,
        base_if: u8,
        out: &mut [u8],
    ) -> usize {
        let istr = interface_string_index(base_if, 0);
        let has_notify = self.config.notify_ep.is_some();
        let mut len = 0;

        let iad = InterfaceAssociationDescriptor {
            bLength: 8,
            bDescriptorType: IAD_DESCRIPTOR,
            bFirstInterface: base_if,
            bInterfaceCount: 2,
            bFunctionClass: CDC_COMM_CLASS,
            bFunctionSubClass: CDC_SUBCLASS_ACM,
            bFunctionProtocol: 0,
            iFunction: istr,
        };
        out[len..len + 8].copy_from_slice(bytemuck::bytes_of(&iad));
        len += 8;

        let comm_if = InterfaceDescriptor {
            bLength: 9,
            bDescriptorType: INTERFACE_DESCRIPTOR,
            bInterfaceNumber: base_if,
            bAlternateSetting: 0,
            bNumEndpoints: if has_notify { 1 } else { 0 },
            bInterfaceClass: CDC_COMM_CLASS,
            bInterfaceSubClass: CDC_SUBCLASS_ACM,
            bInterfaceProtocol: 0,
            iInterface: istr,
        };
        out[len..len + 9].copy_from_slice(bytemuck::bytes_of(&comm_if));
        len += 9;

        // Header functional descriptor, CDC 1.10
        out[len..len + 5]
            .copy_from_slice(&[5, CS_INTERFACE, CDC_FUNC_HEADER, 0x10, 0x01]);
        len += 5;

        // Call management: handled over the data interface
        out[len..len + 5].copy_from_slice(&[
            5,
            CS_INTERFACE,
            CDC_FUNC_CALL_MANAGEMENT,
            0x00,
            base_if + 1,
        ]);
        len += 5;

        // ACM capabilities: line coding + break
        out[len..len + 4]
            .copy_from_slice(&[4, CS_INTERFACE, CDC_FUNC_ACM, 0x06]);
        len += 4;

        out[len..len + 5].copy_from_slice(&[
            5,
            CS_INTERFACE,
            CDC_FUNC_UNION,
            base_if,
            base_if + 1,
        ]);
        len += 5;

        if let Some(notify_ep) = self.config.notify_ep {
            len += write_endpoint_descriptor(
                &mut out[len..],
                notify_ep,
                EpKind::Interrupt,
                NOTIFY_PACKET_SIZE,
                NOTIFY_INTERVAL,
                speed,
            );
        }

        let data_if = InterfaceDescriptor {
            bLength: 9,
            bDescriptorType: INTERFACE_DESCRIPTOR,
            bInterfaceNumber: base_if + 1,
            bAlternateSetting: 0,
            bNumEndpoints: 2,
            bInterfaceClass: CDC_DATA_CLASS,
            bInterfaceSubClass: 0,
            bInterfaceProtocol: 0,
            iInterface: 0,
        };
        out[len..len + 9].copy_from_slice(bytemuck::bytes_of(&data_if));
        len += 9;

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
            0 => Some(InterfaceString::Ascii(self.config.name)),
            _ => None,
        }
    }

    fn open(&mut self, bus: &mut Bus<P>) {
        if let Some(notify_ep) = self.config.notify_ep {
            bus.ep_open(notify_ep, EpKind::Interrupt, NOTIFY_PACKET_SIZE);
        }
        self.open_data(bus);
    }

    fn close(&mut self, bus: &mut Bus<P>) {
        self.close_data(bus);
        if let Some(notify_ep) = self.config.notify_ep {
            bus.ep_close(notify_ep);
        }
    }

    fn control_request(&mut self, bus: &mut Bus<P>) -> Result<(), UsbError> {
        let setup = *bus.setup();
        if setup.request_type() != CLASS_REQUEST {
            return Err(UsbError::Invalid);
        }

        match setup.bRequest {
            REQ_SET_LINE_CODING => {
                // Reset the data interface; it reopens with the new
                // coding after the data stage
                self.close_data(bus);
                bus.ctrl_receive(7)
            }

            REQ_GET_LINE_CODING => {
                let raw = self.line_coding.to_bytes();
                bus.ctrl_send(&raw)
            }

            REQ_SET_CONTROL_LINE_STATE => {
                let dtr = (setup.wValue & 0x01) != 0;
                let rts = (setup.wValue & 0x02) != 0;
                self.handler.control_line(dtr, rts);
                Ok(())
            }

            REQ_SEND_BREAK => {
                self.handler.send_break(setup.wValue);
                Ok(())
            }

            _ => Err(UsbError::Invalid),
        }
    }

    fn control_complete(&mut self, bus: &mut Bus<P>) {
        let setup = *bus.setup();
        if setup.direction() == Direction::Out
            && setup.bRequest == REQ_SET_LINE_CODING
        {
            if let Some(coding) = LineCoding::from_bytes(bus.ctrl_data()) {
                debug::println!("line coding {} baud", coding.baud_rate);
                self.line_coding = coding;
                if self.line_coding.data_bits != 0 {
                    self.open_data(bus);
                }
            }
        }
    }

    fn transfer_in_complete(
        &mut self,
        bus: &mut Bus<P>,
        addr: EpAddress,
        len: usize,
    ) {
        if Some(addr) == self.config.notify_ep {
            return;
        }

        let mps = bus.ep_max_packet(addr) as usize;
        let mut len = len;

        if len == 0 {
            // The terminating ZLP finished; report the original length
            len = self.transmit_length as usize;
            self.transmit_length = 0;
        } else if len % mps == 0 {
            // Full final packet: split the transfer with a ZLP so the
            // host knows it ended
            self.transmit_length = len as u16;
            let _ = bus.ep_send(addr, &[]);
        }

        if !bus.ep_is_busy(addr) {
            self.handler.transmitted(len);
        }
    }

    fn transfer_out_complete(
        &mut self,
        _bus: &mut Bus<P>,
        _addr: EpAddress,
        data: &[u8],
    ) {
        self.handler.received(data);
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/acm.rs"]
mod tests;
