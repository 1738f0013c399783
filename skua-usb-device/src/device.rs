//! The USB device core: owns the port driver, the endpoint table and the
//! function layout; routes standard requests and endpoint completions.

use crate::debug;
use crate::endpoint::{EndpointTable, EpState, Transfer};
use crate::function::UsbFunction;
use crate::port::{PortConfig, PortDriver};
use crate::types::{
    DeviceDescription, Direction, EpAddress, EpKind, UsbError, UsbSpeed,
};
use crate::wire::{
    SetupPacket, CLEAR_FEATURE, FEATURE_EP_HALT, FEATURE_REMOTE_WAKEUP,
    GET_CONFIGURATION, GET_DESCRIPTOR, GET_INTERFACE, GET_STATUS,
    MICROSOFT_OS_REQUEST, RECIPIENT_DEVICE, RECIPIENT_ENDPOINT,
    RECIPIENT_INTERFACE, SET_ADDRESS, SET_CONFIGURATION, SET_FEATURE,
    SET_INTERFACE, STANDARD_REQUEST, VENDOR_REQUEST,
};
use crate::{
    CTRL_BUFFER_SIZE, MAX_EP_COUNT, MAX_FUNCTION_COUNT, MAX_INTERFACE_COUNT,
};

/// Only one configuration is offered; SET_CONFIGURATION accepts 0 or 1
pub const MAX_CONFIGURATION_COUNT: u8 = 1;

/// The mounted-function list every event handler takes, in mount order
pub type Functions<'f, P> = [&'f mut dyn UsbFunction<P>];

/// The part of the device that mounted functions interact with: the port
/// driver, the endpoint table, the in-flight SETUP packet and the shared
/// EP0 buffer.
pub struct Bus<P: PortDriver> {
    pub(crate) port: P,
    pub(crate) speed: UsbSpeed,
    pub(crate) config_selector: u8,
    pub(crate) remote_wakeup_enabled: bool,
    pub(crate) self_powered: bool,
    pub(crate) setup: SetupPacket,
    pub(crate) eps: EndpointTable,
    pub(crate) ctrl_buf: [u8; CTRL_BUFFER_SIZE],
    pub(crate) ctrl_rx_len: u16,
}

impl<P: PortDriver> Bus<P> {
    /// The SETUP packet of the control transfer in progress
    pub fn setup(&self) -> &SetupPacket {
        &self.setup
    }

    pub fn speed(&self) -> UsbSpeed {
        self.speed
    }

    pub fn configured(&self) -> bool {
        self.config_selector != 0
    }

    /// Raw access to the port driver, for application glue that needs it
    pub fn port(&mut self) -> &mut P {
        &mut self.port
    }

    /// Open a data endpoint claimed by the calling function
    pub fn ep_open(&mut self, addr: EpAddress, kind: EpKind, max_packet: u16) {
        let ep = self.eps.get_mut(addr);
        ep.kind = kind;
        ep.max_packet = max_packet;
        ep.state = EpState::Idle;
        ep.transfer = Transfer::default();
        self.port.ep_open(addr, kind, max_packet);
    }

    pub fn ep_close(&mut self, addr: EpAddress) {
        self.eps.get_mut(addr).state = EpState::Closed;
        self.port.ep_close(addr);
    }

    /// Start an IN transfer. Fails with `Busy` unless the endpoint is
    /// idle (isochronous endpoints accept data unconditionally; frame
    /// timing supersedes state).
    pub fn ep_send(
        &mut self,
        addr: EpAddress,
        data: &[u8],
    ) -> Result<(), UsbError> {
        let ep = self.eps.get_mut(addr);
        if ep.state == EpState::Idle || ep.kind == EpKind::Isochronous {
            ep.state = EpState::Data;
            ep.transfer = Transfer {
                total: data.len() as u16,
                progress: 0,
            };
            self.port.ep_send(addr, data);
            Ok(())
        } else {
            Err(UsbError::Busy)
        }
    }

    /// Arm an OUT transfer of up to `len` bytes. Same state rules as
    /// [`Bus::ep_send`].
    pub fn ep_receive(
        &mut self,
        addr: EpAddress,
        len: u16,
    ) -> Result<(), UsbError> {
        let ep = self.eps.get_mut(addr);
        if ep.state == EpState::Idle || ep.kind == EpKind::Isochronous {
            ep.state = EpState::Data;
            ep.transfer = Transfer {
                total: len,
                progress: 0,
            };
            self.port.ep_receive(addr, len);
            Ok(())
        } else {
            Err(UsbError::Busy)
        }
    }

    /// Halt a data endpoint (protocol stalls, e.g. MSC error signalling)
    pub fn ep_stall(&mut self, addr: EpAddress) {
        self.port.ep_set_stall(addr);
        self.eps.get_mut(addr).state = EpState::Stall;
    }

    pub fn ep_max_packet(&self, addr: EpAddress) -> u16 {
        self.eps.get(addr).max_packet
    }

    pub fn ep_is_busy(&self, addr: EpAddress) -> bool {
        self.eps.get(addr).state == EpState::Data
    }
}

#[derive(Copy, Clone, Default)]
struct FuncRecord {
    base_if: u8,
    interfaces: u8,
    alt_settings: u8,
}

#[derive(Default)]
pub(crate) struct Layout {
    records: [FuncRecord; MAX_FUNCTION_COUNT],
    count: u8,
    if_count: u8,
}

impl Layout {
    pub(crate) fn interface_count(&self) -> u8 {
        self.if_count
    }

    pub(crate) fn function_count(&self) -> usize {
        self.count as usize
    }

    pub(crate) fn base_interface(&self, func: usize) -> u8 {
        self.records[func].base_if
    }

    pub(crate) fn function_for_interface(&self, if_num: u8) -> Option<usize> {
        self.records[..self.count as usize].iter().position(|r| {
            if_num >= r.base_if && if_num < r.base_if + r.interfaces
        })
    }
}

/// One USB device: a port driver plus a set of mounted functions.
///
/// The application constructs the device, mounts its functions once, and
/// then forwards every controller event into the `handle_*` methods,
/// passing the same function list (same order) each time.
pub struct UsbDevice<'d, P: PortDriver> {
    pub(crate) bus: Bus<P>,
    pub(crate) description: DeviceDescription<'d>,
    pub(crate) layout: Layout,
}

impl<'d, P: PortDriver> UsbDevice<'d, P> {
    /// Initialize the controller and the device state. The bus stays
    /// detached until [`UsbDevice::connect`].
    pub fn new(mut port: P, description: DeviceDescription<'d>) -> Self {
        port.init(&PortConfig {
            ep0_max_packet: crate::wire::EP0_FS_MAX_PACKET,
            lpm: description.lpm,
        });

        let mut eps = EndpointTable::new();
        for addr in [EpAddress::CONTROL_IN, EpAddress::CONTROL_OUT] {
            let ep0 = eps.get_mut(addr);
            ep0.kind = EpKind::Control;
            // HS-capable devices must keep EP0 at 64; FS-only devices
            // could shrink it to save buffer space
            ep0.max_packet = crate::wire::EP0_FS_MAX_PACKET;
        }

        Self {
            bus: Bus {
                port,
                speed: UsbSpeed::Full12,
                config_selector: 0,
                remote_wakeup_enabled: false,
                self_powered: description.self_powered,
                setup: SetupPacket::default(),
                eps,
                ctrl_buf: [0; CTRL_BUFFER_SIZE],
                ctrl_rx_len: 0,
            },
            description,
            layout: Layout::default(),
        }
    }

    /// Shut the device down entirely
    pub fn deinit(&mut self, funcs: &mut Functions<'_, P>) {
        self.configure(funcs, 0);
        self.bus.port.deinit();
    }

    /// Access to the bus for application-side class calls
    /// (`ncm.put_datagram(usb.bus(), ..)` and friends)
    pub fn bus(&mut self) -> &mut Bus<P> {
        &mut self.bus
    }

    /// Bind a set of functions to the device: claim interface slots in
    /// mount order and data endpoints per each function's profile.
    /// Fails with `Error` when slots or endpoints run out, or an
    /// endpoint address is claimed twice.
    pub fn mount(
        &mut self,
        functions: &mut Functions<'_, P>,
    ) -> Result<(), UsbError> {
        for (index, func) in functions.iter_mut().enumerate() {
            let profile = func.profile();

            if self.layout.count as usize >= MAX_FUNCTION_COUNT
                || (self.layout.if_count + profile.interfaces) as usize
                    > MAX_INTERFACE_COUNT
            {
                return Err(UsbError::Error);
            }

            for claim in profile.endpoints.iter() {
                if claim.address.number() == 0
                    || claim.address.number() as usize >= MAX_EP_COUNT
                {
                    return Err(UsbError::Error);
                }
                let ep = self.bus.eps.get_mut(claim.address);
                if ep.is_claimed() {
                    return Err(UsbError::Error);
                }
                ep.kind = claim.kind;
                ep.max_packet = claim.max_packet;
                ep.claim_max_packet = claim.max_packet;
                ep.owner = index as u8;
            }

            self.layout.records[self.layout.count as usize] = FuncRecord {
                base_if: self.layout.if_count,
                interfaces: profile.interfaces,
                alt_settings: profile.alt_settings,
            };
            func.mounted(self.layout.if_count);
            self.layout.count += 1;
            self.layout.if_count += profile.interfaces;
        }
        Ok(())
    }

    /// Remove all mounted functions (for re-mounting a different set)
    pub fn unmount(&mut self, funcs: &mut Functions<'_, P>) {
        self.configure(funcs, 0);
        self.layout = Layout::default();
        self.bus.eps.reset_claims();
    }

    /// Attach to the bus
    pub fn connect(&mut self) {
        self.bus.port.start();
    }

    /// Detach from the bus, deinitializing any active configuration
    pub fn disconnect(&mut self, funcs: &mut Functions<'_, P>) {
        self.configure(funcs, 0);
        self.bus.port.stop();
    }

    /// Signal remote wakeup; only allowed while the host has enabled the
    /// feature
    pub fn set_remote_wakeup(&mut self) -> Result<(), UsbError> {
        if self.bus.remote_wakeup_enabled {
            self.bus.port.set_remote_wakeup();
            Ok(())
        } else {
            Err(UsbError::Error)
        }
    }

    /// End remote wakeup signalling (1..15 ms after
    /// [`UsbDevice::set_remote_wakeup`])
    pub fn clear_remote_wakeup(&mut self) -> Result<(), UsbError> {
        if self.bus.remote_wakeup_enabled {
            self.bus.port.clear_remote_wakeup();
            Ok(())
        } else {
            Err(UsbError::Error)
        }
    }

    /// Switch the active configuration, driving every function's
    /// `close`/`open`. Selecting the current configuration again is a
    /// no-op.
    pub fn configure(&mut self, funcs: &mut Functions<'_, P>, config: u8) {
        if self.bus.config_selector == config {
            return;
        }

        let count = self.layout.function_count().min(funcs.len());

        if self.bus.config_selector != 0 {
            for func in funcs[..count].iter_mut() {
                func.close(&mut self.bus);
                func.select_alt(0);
            }
        }

        self.bus.config_selector = config;

        if config != 0 {
            for func in funcs[..count].iter_mut() {
                func.open(&mut self.bus);
            }
        }
    }

    /// Bus Reset: adopt the negotiated speed, drop the configuration,
    /// re-open EP0
    pub fn handle_reset(
        &mut self,
        funcs: &mut Functions<'_, P>,
        speed: UsbSpeed,
    ) {
        debug::println!("usb reset, speed {:?}", speed);
        self.bus.speed = speed;
        self.configure(funcs, 0);

        // Limit packet sizes to what the current speed allows. An FS
        // frame is 8 HS microframes, so isochronous endpoints scale up
        // to keep their data rate; other types share the FS 64-byte
        // ceiling.
        for ep in self.bus.eps.data_endpoints_mut() {
            if !ep.is_claimed() {
                continue;
            }
            ep.max_packet = match (speed, ep.kind) {
                (UsbSpeed::High480, _) => ep.claim_max_packet,
                (_, EpKind::Isochronous) => {
                    (ep.claim_max_packet * 8).min(1023)
                }
                _ => ep.claim_max_packet.min(64),
            };
        }

        let mps = self.bus.eps.get(EpAddress::CONTROL_OUT).max_packet;
        self.bus.port.ctrl_ep_open(mps);
        self.bus.eps.get_mut(EpAddress::CONTROL_IN).state = EpState::Idle;
        self.bus.eps.get_mut(EpAddress::CONTROL_OUT).state = EpState::Idle;
    }

    /// A SETUP packet arrived on EP0: route it to its recipient and
    /// start the appropriate stage
    pub fn handle_setup(
        &mut self,
        funcs: &mut Functions<'_, P>,
        setup: SetupPacket,
    ) {
        self.bus.setup = setup;
        self.bus.eps.get_mut(EpAddress::CONTROL_OUT).state = EpState::Setup;

        let result = match setup.recipient() {
            RECIPIENT_DEVICE => self.device_request(funcs),
            RECIPIENT_INTERFACE => self.interface_request(funcs),
            RECIPIENT_ENDPOINT => self.endpoint_request(funcs),
            _ => Err(UsbError::Invalid),
        };

        match result {
            // Request Error: STALL both halves of EP0
            Err(_) => self.bus.ctrl_stall(),
            // No data stage requested: go straight to status
            Ok(()) if setup.wLength == 0 => self.bus.ctrl_send_status(),
            // Data stage started in the direction the request encodes
            Ok(()) => {}
        }
    }

    /// An IN transfer completed (the host read everything the endpoint
    /// had queued)
    pub fn handle_ep_in(
        &mut self,
        funcs: &mut Functions<'_, P>,
        addr: EpAddress,
    ) {
        if addr == EpAddress::CONTROL_IN {
            self.control_in_complete(funcs);
        } else {
            let ep = self.bus.eps.get_mut(addr);
            ep.state = EpState::Idle;
            ep.transfer.progress = ep.transfer.total;
            let owner = ep.owner as usize;
            let len = ep.transfer.total as usize;
            if owner < self.layout.function_count().min(funcs.len()) {
                funcs[owner].transfer_in_complete(&mut self.bus, addr, len);
            }
        }
    }

    /// An OUT transfer completed with the given received bytes
    pub fn handle_ep_out(
        &mut self,
        funcs: &mut Functions<'_, P>,
        addr: EpAddress,
        data: &[u8],
    ) {
        let ep = self.bus.eps.get_mut(addr);
        ep.state = EpState::Idle;
        ep.transfer.progress = data.len() as u16;
        let owner = ep.owner as usize;

        if addr == EpAddress::CONTROL_OUT {
            self.control_out_complete(funcs, data);
        } else if owner < self.layout.function_count().min(funcs.len()) {
            funcs[owner].transfer_out_complete(&mut self.bus, addr, data);
        }
    }

    fn device_request(
        &mut self,
        funcs: &mut Functions<'_, P>,
    ) -> Result<(), UsbError> {
        let setup = self.bus.setup;

        match setup.request_type() {
            STANDARD_REQUEST => match setup.bRequest {
                GET_DESCRIPTOR => self.get_descriptor(funcs),

                SET_ADDRESS => self.set_address(),

                SET_CONFIGURATION => {
                    if setup.wValue <= MAX_CONFIGURATION_COUNT as u16 {
                        self.configure(funcs, setup.wValue as u8);
                        Ok(())
                    } else {
                        Err(UsbError::Invalid)
                    }
                }

                GET_CONFIGURATION => {
                    let selector = self.bus.config_selector;
                    self.bus.ctrl_send(&[selector])
                }

                GET_STATUS => {
                    let mut status = 0u16;
                    if self.bus.self_powered {
                        status |= 1 << 0;
                    }
                    if self.bus.remote_wakeup_enabled {
                        status |= 1 << 1;
                    }
                    self.bus.ctrl_send(&status.to_le_bytes())
                }

                SET_FEATURE => {
                    // The only settable standard device feature
                    if setup.wValue == FEATURE_REMOTE_WAKEUP {
                        self.bus.remote_wakeup_enabled = true;
                        Ok(())
                    } else {
                        Err(UsbError::Invalid)
                    }
                }

                CLEAR_FEATURE => {
                    if setup.wValue == FEATURE_REMOTE_WAKEUP {
                        self.bus.remote_wakeup_enabled = false;
                        Ok(())
                    } else {
                        Err(UsbError::Invalid)
                    }
                }

                _ => Err(UsbError::Invalid),
            },

            VENDOR_REQUEST
                if setup.bRequest == MICROSOFT_OS_REQUEST
                    && setup.direction() == Direction::In =>
            {
                self.get_ms_descriptor(funcs)
            }

            _ => Err(UsbError::Invalid),
        }
    }

    /// SET_ADDRESS is only valid before configuration; depending on the
    /// controller the new address applies now or after the Status stage
    fn set_address(&mut self) -> Result<(), UsbError> {
        let setup = self.bus.setup;
        if setup.wIndex == 0
            && setup.wLength == 0
            && self.bus.config_selector == 0
        {
            if P::SETS_ADDRESS_EARLY {
                self.bus.port.set_address((setup.wValue & 0x7F) as u8);
            }
            Ok(())
        } else {
            Err(UsbError::Invalid)
        }
    }

    fn interface_request(
        &mut self,
        funcs: &mut Functions<'_, P>,
    ) -> Result<(), UsbError> {
        let setup = self.bus.setup;
        let if_num = setup.wIndex as u8;

        if self.bus.config_selector == 0
            || if_num >= self.layout.interface_count()
        {
            return Err(UsbError::Invalid);
        }
        let Some(index) = self.layout.function_for_interface(if_num) else {
            return Err(UsbError::Invalid);
        };
        if index >= funcs.len() {
            return Err(UsbError::Invalid);
        }

        if setup.request_type() == STANDARD_REQUEST {
            match setup.bRequest {
                GET_INTERFACE => {
                    let alt = funcs[index].alt_setting();
                    self.bus.ctrl_send(&[alt])
                }

                SET_INTERFACE => {
                    let alt = setup.wValue as u8;
                    if alt < self.layout.records[index].alt_settings {
                        funcs[index].close(&mut self.bus);
                        funcs[index].select_alt(alt);
                        funcs[index].open(&mut self.bus);
                        Ok(())
                    } else {
                        Err(UsbError::Invalid)
                    }
                }

                // Standard requests the core doesn't own (e.g. HID's
                // GET_DESCRIPTOR) are forwarded like class requests
                _ => funcs[index].control_request(&mut self.bus),
            }
        } else {
            funcs[index].control_request(&mut self.bus)
        }
    }

    fn endpoint_request(
        &mut self,
        funcs: &mut Functions<'_, P>,
    ) -> Result<(), UsbError> {
        let setup = self.bus.setup;
        let addr = EpAddress::from_wire(setup.wIndex as u8);

        // Only data endpoints of a configured device can be targeted
        if addr.number() == 0
            || addr.number() as usize >= MAX_EP_COUNT
            || self.bus.config_selector == 0
        {
            return Err(UsbError::Invalid);
        }
        if setup.request_type() != STANDARD_REQUEST {
            // Class/vendor endpoint requests are promoted to interface
            // level instead
            return Err(UsbError::Invalid);
        }

        match setup.bRequest {
            // EP halt is the only standard endpoint feature
            SET_FEATURE if setup.wValue == FEATURE_EP_HALT => {
                if self.bus.eps.get(addr).state != EpState::Stall {
                    self.bus.ep_stall(addr);
                }
                Ok(())
            }

            CLEAR_FEATURE if setup.wValue == FEATURE_EP_HALT => {
                if self.bus.eps.get(addr).state == EpState::Stall {
                    self.bus.port.ep_clear_stall(addr);
                    let ep = self.bus.eps.get_mut(addr);
                    ep.state = EpState::Idle;
                    ep.transfer = Transfer::default();

                    // Notify the owner of the ready endpoint with a
                    // zero-length completion so it can restart its
                    // protocol
                    let owner = ep.owner as usize;
                    if owner < self.layout.function_count().min(funcs.len())
                    {
                        match addr.direction() {
                            Direction::In => funcs[owner]
                                .transfer_in_complete(&mut self.bus, addr, 0),
                            Direction::Out => funcs[owner]
                                .transfer_out_complete(
                                    &mut self.bus,
                                    addr,
                                    &[],
                                ),
                        }
                    }
                }
                Ok(())
            }

            GET_STATUS => {
                let halted = self.bus.eps.get(addr).state == EpState::Stall;
                let status: u16 = if halted { 1 } else { 0 };
                self.bus.ctrl_send(&status.to_le_bytes())
            }

            _ => Err(UsbError::Invalid),
        }
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/device.rs"]
mod tests;
