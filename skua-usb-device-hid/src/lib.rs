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
    Direction, EpAddress, EpKind, UsbError, UsbSpeed,
};
use skua_usb_device::wire::{
    hs_interval, interface_string_index, write_endpoint_descriptor,
    InterfaceDescriptor, CLASS_REQUEST, GET_DESCRIPTOR, INTERFACE_DESCRIPTOR,
    STANDARD_REQUEST,
};

const HID_CLASS: u8 = 0x03;
const HID_SUBCLASS_BOOT: u8 = 0x01;

// HID descriptor types (HID 1.11, section 7.1)
const HID_DESC_TYPE_HID: u8 = 0x21;
const HID_DESC_TYPE_REPORT: u8 = 0x22;

// Class requests (HID 1.11, section 7.2)
const REQ_GET_REPORT: u8 = 0x01;
const REQ_GET_IDLE: u8 = 0x02;
const REQ_GET_PROTOCOL: u8 = 0x03;
const REQ_SET_REPORT: u8 = 0x09;
const REQ_SET_IDLE: u8 = 0x0A;
const REQ_SET_PROTOCOL: u8 = 0x0B;

/// Idle duration meaning "only report on change"
pub const IDLE_RATE_INDEFINITE: u16 = 0;

/// Report classification carried in `wValue` of GET/SET_REPORT
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum ReportKind {
    Input = 1,
    Output = 2,
    Feature = 3,
}

impl ReportKind {
    fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Input),
            2 => Some(Self::Output),
            3 => Some(Self::Feature),
            _ => None,
        }
    }
}

/// Boot protocol role advertised in `bInterfaceProtocol`
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum BootProtocol {
    None = 0,
    Keyboard = 1,
    Mouse = 2,
}

/// The report layout the application exposes
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
pub struct HidReportConfig {
    /// The HID report descriptor, verbatim
    pub descriptor: &'static [u8],
    /// Largest input report, also the interrupt IN packet size
    pub input_max: u16,
    /// Input polling interval in milliseconds
    pub input_interval_ms: u8,
    /// Largest output report (0 if none)
    pub output_max: u16,
    /// Largest feature report (0 if none)
    pub feature_max: u16,
}

/// What the application plugs into a HID function
pub trait HidApplication {
    /// Provide the requested report in `buf`; 0 rejects the request
    fn get_report(
        &mut self,
        _kind: ReportKind,
        _id: u8,
        _buf: &mut [u8],
    ) -> usize {
        0
    }

    /// A report arrived, over EP0 or the interrupt OUT endpoint
    fn set_report(&mut self, _kind: ReportKind, _id: u8, _data: &[u8]) {}

    /// Host set the idle duration (ms; [`IDLE_RATE_INDEFINITE`] = only
    /// on change) for one report ID (0 = all)
    fn set_idle(&mut self, _idle_ms: u16, _report_id: u8) {}

    /// Host switched between boot and report protocol
    fn set_protocol(&mut self, _boot: bool) {}

    /// An input report queued with [`Hid::report_in`] reached the host
    fn report_sent(&mut self, _len: usize) {}
}

/// Endpoint assignment for a HID function
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
pub struct HidConfig {
    pub in_ep: EpAddress,
    /// Optional interrupt OUT endpoint for output reports; without it
    /// the host uses SET_REPORT
    pub out_ep: Option<EpAddress>,
    pub boot: BootProtocol,
    pub name: &'static str,
}

/// A HID device function driven by the application's report descriptor
pub struct Hid<'d> {
    config: HidConfig,
    report: HidReportConfig,
    app: &'d mut dyn HidApplication,
    /// Idle rate in 4 ms units; 0 = indefinite
    idle_rate: u8,
    /// 0 = boot protocol, 1 = report protocol
    protocol: u8,
    /// Report kind of a SET_REPORT waiting for its data stage
    pending_set: Option<(ReportKind, u8)>,
}

impl<'d> Hid<'d> {
    pub fn new(
        config: HidConfig,
        report: HidReportConfig,
        app: &'d mut dyn HidApplication,
    ) -> Self {
        Self {
            config,
            report,
            app,
            idle_rate: 0,
            protocol: 1,
            pending_set: None,
        }
    }

    pub fn idle_rate_ms(&self) -> u16 {
        self.idle_rate as u16 * 4
    }

    /// Queue an input report on the interrupt IN endpoint
    pub fn report_in<P: PortDriver>(
        &mut self,
        bus: &mut Bus<P>,
        data: &[u8],
    ) -> Result<(), UsbError> {
        bus.ep_send(self.config.in_ep, data)
    }

    /// Arm the interrupt OUT endpoint for an output report
    pub fn report_out<P: PortDriver>(
        &mut self,
        bus: &mut Bus<P>,
    ) -> Result<(), UsbError> {
        let Some(out_ep) = self.config.out_ep else {
            return Err(UsbError::Error);
        };
        bus.ep_receive(out_ep, self.report.output_max)
    }

    fn write_hid_descriptor(&self, out: &mut [u8]) -> usize {
        out[0] = 9;
        out[1] = HID_DESC_TYPE_HID;
        out[2..4].copy_from_slice(&0x0111u16.to_le_bytes()); // bcdHID
        out[4] = 0; // country code
        out[5] = 1; // one class descriptor follows
        out[6] = HID_DESC_TYPE_REPORT;
        out[7..9].copy_from_slice(
            &(self.report.descriptor.len() as u16).to_le_bytes(),
        );
        9
    }

    fn interval(&self, speed: UsbSpeed) -> u8 {
        match speed {
            UsbSpeed::High480 => {
                hs_interval(self.report.input_interval_ms as u32)
            }
            _ => self.report.input_interval_ms,
        }
    }
}

impl<P: PortDriver> UsbFunction<P> for Hid<'_> {
    fn profile(&self) -> FunctionProfile {
        let mut endpoints = EpClaims::new();
        endpoints.push(EpClaim {
            address: self.config.in_ep,
            kind: EpKind::Interrupt,
            max_packet: self.report.input_max,
        });
        if let Some(out_ep) = self.config.out_ep {
            endpoints.push(EpClaim {
                address: out_ep,
                kind: EpKind::Interrupt,
                max_packet: self.report.output_max,
            });
        }
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
            bLength: 9,
            bDescriptorType: INTERFACE_DESCRIPTOR,
            bInterfaceNumber: base_if,
            bAlternateSetting: 0,
            bNumEndpoints: if self.config.out_ep.is_some() { 2 } else { 1 },
            bInterfaceClass: HID_CLASS,
            bInterfaceSubClass: if self.config.boot == BootProtocol::None {
                0
            } else {
                HID_SUBCLASS_BOOT
            },
            bInterfaceProtocol: self.config.boot as u8,
            iInterface: interface_string_index(base_if, 0),
        };
        let mut len = 9;
        out[..len].copy_from_slice(bytemuck::bytes_of(&desc));

        len += self.write_hid_descriptor(&mut out[len..]);

        let interval = self.interval(speed);
        len += write_endpoint_descriptor(
            &mut out[len..],
            self.config.in_ep,
            EpKind::Interrupt,
            self.report.input_max,
            interval,
            speed,
        );
        if let Some(out_ep) = self.config.out_ep {
            len += write_endpoint_descriptor(
                &mut out[len..],
                out_ep,
                EpKind::Interrupt,
                self.report.output_max,
                interval,
                speed,
            );
        }
        len
    }

    fn interface_string(&self, index: u8) -> Option<InterfaceString<'_>> {
        match index {
            0 => Some(InterfaceString::Ascii(self.config.name)),
            _ => None,
        }
    }

    fn open(&mut self, bus: &mut Bus<P>) {
        bus.ep_open(
            self.config.in_ep,
            EpKind::Interrupt,
            self.report.input_max,
        );
        if let Some(out_ep) = self.config.out_ep {
            bus.ep_open(out_ep, EpKind::Interrupt, self.report.output_max);
        }
        self.idle_rate = self.report.input_interval_ms / 4;
    }

    fn close(&mut self, bus: &mut Bus<P>) {
        bus.ep_close(self.config.in_ep);
        if let Some(out_ep) = self.config.out_ep {
            bus.ep_close(out_ep);
        }
    }

    fn control_request(&mut self, bus: &mut Bus<P>) -> Result<(), UsbError> {
        let setup = *bus.setup();

        match setup.request_type() {
            STANDARD_REQUEST => {
                // HID-specific descriptors arrive as standard requests
                // with interface recipient
                if setup.bRequest != GET_DESCRIPTOR {
                    return Err(UsbError::Invalid);
                }
                match (setup.wValue >> 8) as u8 {
                    HID_DESC_TYPE_HID => bus.ctrl_send_with(|buf| {
                        self.write_hid_descriptor(buf)
                    }),
                    HID_DESC_TYPE_REPORT => {
                        bus.ctrl_send(self.report.descriptor)
                    }
                    _ => Err(UsbError::Invalid),
                }
            }

            CLASS_REQUEST => {
                let report_id = setup.wValue as u8;
                let kind = ReportKind::from_wire((setup.wValue >> 8) as u8);

                match setup.bRequest {
                    REQ_GET_REPORT => {
                        let Some(kind) = kind else {
                            return Err(UsbError::Invalid);
                        };
                        let app = &mut self.app;
                        bus.ctrl_send_with(|buf| {
                            app.get_report(kind, report_id, buf)
                        })
                    }

                    REQ_SET_REPORT => {
                        let kind = kind.unwrap_or(ReportKind::Output);
                        let max_len = if kind == ReportKind::Feature {
                            self.report.feature_max
                        } else {
                            self.report.output_max
                        };
                        self.pending_set = Some((kind, report_id));
                        bus.ctrl_receive(max_len as usize)
                    }

                    REQ_GET_IDLE => {
                        let idle = self.idle_rate;
                        bus.ctrl_send(&[idle])
                    }

                    REQ_SET_IDLE => {
                        // Duration in wValue's upper byte, 4 ms units;
                        // report ID 0 applies to every report
                        let rate = (setup.wValue >> 8) as u8;
                        if report_id == 0 {
                            self.idle_rate = rate;
                        }
                        let idle_ms = if rate > 0 {
                            4 * rate as u16
                        } else {
                            IDLE_RATE_INDEFINITE
                        };
                        debug::println!("idle {} ms", idle_ms);
                        self.app.set_idle(idle_ms, report_id);
                        Ok(())
                    }

                    REQ_GET_PROTOCOL => {
                        let protocol = self.protocol;
                        bus.ctrl_send(&[protocol])
                    }

                    REQ_SET_PROTOCOL => {
                        if self.config.boot == BootProtocol::None {
                            return Err(UsbError::Invalid);
                        }
                        self.protocol = (setup.wValue & 1) as u8;
                        self.app.set_protocol(self.protocol == 0);
                        Ok(())
                    }

                    _ => Err(UsbError::Invalid),
                }
            }

            _ => Err(UsbError::Invalid),
        }
    }

    fn control_complete(&mut self, bus: &mut Bus<P>) {
        let setup = *bus.setup();
        if setup.direction() == Direction::Out
            && setup.bRequest == REQ_SET_REPORT
        {
            if let Some((kind, id)) = self.pending_set.take() {
                self.app.set_report(kind, id, bus.ctrl_data());
            }
        }
    }

    fn transfer_in_complete(
        &mut self,
        _bus: &mut Bus<P>,
        _addr: EpAddress,
        len: usize,
    ) {
        self.app.report_sent(len);
    }

    fn transfer_out_complete(
        &mut self,
        _bus: &mut Bus<P>,
        _addr: EpAddress,
        data: &[u8],
    ) {
        self.app.set_report(ReportKind::Output, 0, data);
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/hid.rs"]
mod tests;
