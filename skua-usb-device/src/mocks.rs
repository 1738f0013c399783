//! Support code for testing the stack (and class crates) without any
//! hardware: a port driver that records everything it is asked to do.

use crate::device::Bus;
use crate::function::{
    EpClaim, EpClaims, FunctionProfile, InterfaceString, UsbFunction,
};
use crate::port::{PortConfig, PortDriver};
use crate::types::{
    bulk_max_packet, EpAddress, EpKind, UsbError, UsbSpeed,
};
use crate::wire::{
    write_endpoint_descriptor, InterfaceDescriptor, CLASS_REQUEST,
    INTERFACE_DESCRIPTOR, VENDOR_REQUEST,
};

/// A [`PortDriver`] that records every operation, so tests can drive
/// bus-level scenarios and assert on the exact wire traffic
#[derive(Default)]
pub struct RecordingPort {
    /// Every IN transfer started, in order
    pub sends: Vec<(EpAddress, Vec<u8>)>,
    /// Every OUT transfer armed, in order
    pub receives: Vec<(EpAddress, u16)>,
    pub opened: Vec<(EpAddress, EpKind, u16)>,
    pub closed: Vec<EpAddress>,
    pub stalled: Vec<EpAddress>,
    pub unstalled: Vec<EpAddress>,
    pub address: Option<u8>,
    pub config: Option<PortConfig>,
    pub ctrl_ep_mps: Option<u16>,
    pub started: bool,
    pub stopped: bool,
    pub deinitialized: bool,
    pub remote_wakeup_active: bool,
}

impl RecordingPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent IN transfer on the given endpoint
    pub fn last_send_on(&self, addr: EpAddress) -> Option<&[u8]> {
        self.sends
            .iter()
            .rev()
            .find(|(a, _)| *a == addr)
            .map(|(_, d)| d.as_slice())
    }

    /// The most recent OUT arming on the given endpoint
    pub fn last_receive_on(&self, addr: EpAddress) -> Option<u16> {
        self.receives
            .iter()
            .rev()
            .find(|(a, _)| *a == addr)
            .map(|(_, len)| *len)
    }

    pub fn is_stalled(&self, addr: EpAddress) -> bool {
        let set = self.stalled.iter().filter(|a| **a == addr).count();
        let cleared = self.unstalled.iter().filter(|a| **a == addr).count();
        set > cleared
    }
}

impl PortDriver for RecordingPort {
    fn init(&mut self, config: &PortConfig) {
        self.config = Some(*config);
    }

    fn deinit(&mut self) {
        self.deinitialized = true;
    }

    fn start(&mut self) {
        self.started = true;
    }

    fn stop(&mut self) {
        self.stopped = true;
    }

    fn set_address(&mut self, address: u8) {
        self.address = Some(address);
    }

    fn ctrl_ep_open(&mut self, max_packet: u16) {
        self.ctrl_ep_mps = Some(max_packet);
    }

    fn ep_open(&mut self, addr: EpAddress, kind: EpKind, max_packet: u16) {
        self.opened.push((addr, kind, max_packet));
    }

    fn ep_close(&mut self, addr: EpAddress) {
        self.closed.push(addr);
    }

    fn ep_send(&mut self, addr: EpAddress, data: &[u8]) {
        self.sends.push((addr, data.to_vec()));
    }

    fn ep_receive(&mut self, addr: EpAddress, len: u16) {
        self.receives.push((addr, len));
    }

    fn ep_set_stall(&mut self, addr: EpAddress) {
        self.stalled.push(addr);
    }

    fn ep_clear_stall(&mut self, addr: EpAddress) {
        self.unstalled.push(addr);
    }

    fn set_remote_wakeup(&mut self) {
        self.remote_wakeup_active = true;
    }

    fn clear_remote_wakeup(&mut self) {
        self.remote_wakeup_active = false;
    }
}

/// A vendor-class function with one bulk endpoint pair that records
/// every callback, for exercising the core without a real class
pub struct LoopbackFunction {
    pub in_ep: EpAddress,
    pub out_ep: EpAddress,
    pub opened: usize,
    pub closed: usize,
    pub alt: u8,
    pub ms_id: Option<&'static str>,
    pub control_requests: Vec<u8>,
    pub control_completes: Vec<Vec<u8>>,
    pub in_completions: Vec<(EpAddress, usize)>,
    pub out_completions: Vec<(EpAddress, Vec<u8>)>,
}

impl LoopbackFunction {
    /// Vendor IN request answered with `wLength` 0xA5 bytes
    pub const REQ_READ: u8 = 0x01;
    /// Vendor OUT request capturing its data stage
    pub const REQ_WRITE: u8 = 0x02;
    /// Vendor IN request answering with only `wLength / 2` bytes, for
    /// exercising the short-reply ZLP path
    pub const REQ_READ_HALF: u8 = 0x03;

    pub fn new() -> Self {
        Self {
            in_ep: EpAddress::new_in(1),
            out_ep: EpAddress::new_out(1),
            opened: 0,
            closed: 0,
            alt: 0,
            ms_id: Some("WINUSB"),
            control_requests: Vec::new(),
            control_completes: Vec::new(),
            in_completions: Vec::new(),
            out_completions: Vec::new(),
        }
    }
}

impl Default for LoopbackFunction {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PortDriver> UsbFunction<P> for LoopbackFunction {
    fn profile(&self) -> FunctionProfile {
        let mut endpoints = EpClaims::new();
        endpoints.push(EpClaim {
            address: self.in_ep,
            kind: EpKind::Bulk,
            max_packet: 512,
        });
        endpoints.push(EpClaim {
            address: self.out_ep,
            kind: EpKind::Bulk,
            max_packet: 512,
        });
        FunctionProfile {
            interfaces: 1,
            alt_settings: 2,
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
            bInterfaceClass: 0xFF,
            bInterfaceSubClass: 0,
            bInterfaceProtocol: 0,
            iInterface: crate::wire::interface_string_index(base_if, 0),
        };
        let mut len = 9;
        out[..len].copy_from_slice(bytemuck::bytes_of(&desc));
        let mps = bulk_max_packet(speed);
        len += write_endpoint_descriptor(
            &mut out[len..],
            self.out_ep,
            EpKind::Bulk,
            mps,
            0,
            speed,
        );
        len += write_endpoint_descriptor(
            &mut out[len..],
            self.in_ep,
            EpKind::Bulk,
            mps,
            0,
            speed,
        );
        len
    }

    fn interface_string(&self, index: u8) -> Option<InterfaceString<'_>> {
        match index {
            0 => Some(InterfaceString::Ascii("Loopback")),
            _ => None,
        }
    }

    fn ms_compatible_id(&self) -> Option<&str> {
        self.ms_id
    }

    fn open(&mut self, bus: &mut Bus<P>) {
        let mps = bulk_max_packet(bus.speed());
        bus.ep_open(self.in_ep, EpKind::Bulk, mps);
        bus.ep_open(self.out_ep, EpKind::Bulk, mps);
        self.opened += 1;
    }

    fn close(&mut self, bus: &mut Bus<P>) {
        bus.ep_close(self.in_ep);
        bus.ep_close(self.out_ep);
        self.closed += 1;
    }

    fn alt_setting(&self) -> u8 {
        self.alt
    }

    fn select_alt(&mut self, alt: u8) {
        self.alt = alt;
    }

    fn control_request(&mut self, bus: &mut Bus<P>) -> Result<(), UsbError> {
        let setup = *bus.setup();
        if setup.request_type() != VENDOR_REQUEST
            && setup.request_type() != CLASS_REQUEST
        {
            return Err(UsbError::Invalid);
        }
        self.control_requests.push(setup.bRequest);
        match setup.bRequest {
            Self::REQ_READ => bus.ctrl_send_with(|buf| {
                let len = setup.wLength as usize;
                buf[..len].fill(0xA5);
                len
            }),
            Self::REQ_READ_HALF => bus.ctrl_send_with(|buf| {
                let len = (setup.wLength / 2) as usize;
                buf[..len].fill(0x5A);
                len
            }),
            Self::REQ_WRITE => bus.ctrl_receive(setup.wLength as usize),
            _ => Err(UsbError::Invalid),
        }
    }

    fn control_complete(&mut self, bus: &mut Bus<P>) {
        self.control_completes.push(bus.ctrl_data().to_vec());
    }

    fn transfer_in_complete(
        &mut self,
        _bus: &mut Bus<P>,
        addr: EpAddress,
        len: usize,
    ) {
        self.in_completions.push((addr, len));
    }

    fn transfer_out_complete(
        &mut self,
        _bus: &mut Bus<P>,
        addr: EpAddress,
        data: &[u8],
    ) {
        self.out_completions.push((addr, data.to_vec()));
    }
}

/// Same recorder, but modelling a controller that latches the device
/// address as soon as it is written
#[derive(Default)]
pub struct EarlyAddressPort(pub RecordingPort);

impl PortDriver for EarlyAddressPort {
    const SETS_ADDRESS_EARLY: bool = true;

    fn init(&mut self, config: &PortConfig) {
        self.0.init(config)
    }
    fn deinit(&mut self) {
        self.0.deinit()
    }
    fn start(&mut self) {
        self.0.start()
    }
    fn stop(&mut self) {
        self.0.stop()
    }
    fn set_address(&mut self, address: u8) {
        self.0.set_address(address)
    }
    fn ctrl_ep_open(&mut self, max_packet: u16) {
        self.0.ctrl_ep_open(max_packet)
    }
    fn ep_open(&mut self, addr: EpAddress, kind: EpKind, max_packet: u16) {
        self.0.ep_open(addr, kind, max_packet)
    }
    fn ep_close(&mut self, addr: EpAddress) {
        self.0.ep_close(addr)
    }
    fn ep_send(&mut self, addr: EpAddress, data: &[u8]) {
        self.0.ep_send(addr, data)
    }
    fn ep_receive(&mut self, addr: EpAddress, len: u16) {
        self.0.ep_receive(addr, len)
    }
    fn ep_set_stall(&mut self, addr: EpAddress) {
        self.0.ep_set_stall(addr)
    }
    fn ep_clear_stall(&mut self, addr: EpAddress) {
        self.0.ep_clear_stall(addr)
    }
    fn set_remote_wakeup(&mut self) {
        self.0.set_remote_wakeup()
    }
    fn clear_remote_wakeup(&mut self) {
        self.0.clear_remote_wakeup()
    }
}
