//! The port-driver trait: what the device core needs from a USB device
//! controller.
//!
//! An implementation of [`PortDriver`] is the register-level glue for one
//! peripheral: it programs endpoints, moves bytes, and raises four events
//! back into the stack from its interrupt handler —
//! [`UsbDevice::handle_reset`](crate::device::UsbDevice::handle_reset),
//! [`UsbDevice::handle_setup`](crate::device::UsbDevice::handle_setup),
//! [`UsbDevice::handle_ep_in`](crate::device::UsbDevice::handle_ep_in) and
//! [`UsbDevice::handle_ep_out`](crate::device::UsbDevice::handle_ep_out).

use crate::types::{EpAddress, EpKind};

/// Controller configuration handed down at [`PortDriver::init`] time
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
pub struct PortConfig {
    /// Max packet size to program for EP0 in both directions
    pub ep0_max_packet: u16,
    /// Enable Link Power Management handshakes if the controller can
    pub lpm: bool,
}

/// One USB device controller (peripheral driver)
///
/// All operations are non-blocking: `ep_send` and `ep_receive` start a
/// transfer and complete later through the corresponding event. The stack
/// guarantees it never starts a second transfer on an endpoint with one
/// in flight.
pub trait PortDriver {
    /// Whether `set_address` takes effect immediately when written.
    ///
    /// Controllers differ: some latch the new address as soon as the
    /// register is written (the stack then applies it during the Setup
    /// stage of SET_ADDRESS), others must keep answering on address 0
    /// until the Status stage completes (the stack applies it after).
    const SETS_ADDRESS_EARLY: bool = false;

    /// Program the controller; leave the bus detached
    fn init(&mut self, config: &PortConfig);

    /// Power the controller down
    fn deinit(&mut self);

    /// Attach to the bus (enable the D+ pull-up)
    fn start(&mut self);

    /// Detach from the bus
    fn stop(&mut self);

    /// Write the device address register
    fn set_address(&mut self, address: u8);

    /// Open EP0 IN and OUT with the given max packet size
    fn ctrl_ep_open(&mut self, max_packet: u16);

    /// Program and enable a data endpoint
    fn ep_open(&mut self, addr: EpAddress, kind: EpKind, max_packet: u16);

    /// Disable a data endpoint
    fn ep_close(&mut self, addr: EpAddress);

    /// Start an IN transfer; raises an IN completion event for `addr`
    /// once the host has read all of `data`
    fn ep_send(&mut self, addr: EpAddress, data: &[u8]);

    /// Arm an OUT transfer of up to `len` bytes; raises an OUT completion
    /// event carrying the received bytes
    fn ep_receive(&mut self, addr: EpAddress, len: u16);

    /// Make the endpoint answer transactions with STALL
    fn ep_set_stall(&mut self, addr: EpAddress);

    /// Return the endpoint to normal operation with reset data toggle
    fn ep_clear_stall(&mut self, addr: EpAddress);

    /// Signal resume to the suspended host
    fn set_remote_wakeup(&mut self);

    /// End the resume signalling
    fn clear_remote_wakeup(&mut self);
}
