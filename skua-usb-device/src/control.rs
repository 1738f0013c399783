//! The EP0 control transfer engine: Setup, Data and Status stages as an
//! explicit state machine over the two halves of endpoint 0.

use crate::device::{Bus, Functions, UsbDevice};
use crate::endpoint::{EpState, Transfer};
use crate::function::UsbFunction;
use crate::port::PortDriver;
use crate::types::{Direction, EpAddress, UsbError};
use crate::wire::{RECIPIENT_INTERFACE, SET_ADDRESS};
use crate::CTRL_BUFFER_SIZE;

impl<P: PortDriver> Bus<P> {
    /// Answer the data stage of the current IN control transfer.
    ///
    /// Only callable from a Setup-stage handler of an IN request; sends
    /// at most `setup.wLength` bytes. The engine appends a ZLP
    /// terminator and the status stage on completion.
    pub fn ctrl_send(&mut self, data: &[u8]) -> Result<(), UsbError> {
        let len = data.len().min(CTRL_BUFFER_SIZE);
        self.ctrl_buf[..len].copy_from_slice(&data[..len]);
        self.ctrl_send_in_place(len)
    }

    /// Like [`Bus::ctrl_send`], letting the caller assemble the reply
    /// directly in the EP0 buffer (the closure returns the byte count).
    ///
    /// A zero-length result rejects the request instead; use
    /// [`Bus::ctrl_send`] with an empty slice for an intentionally
    /// empty data stage.
    pub fn ctrl_send_with(
        &mut self,
        fill: impl FnOnce(&mut [u8]) -> usize,
    ) -> Result<(), UsbError> {
        let len = fill(&mut self.ctrl_buf);
        if len == 0 {
            return Err(UsbError::Invalid);
        }
        self.ctrl_send_in_place(len)
    }

    /// Send `len` bytes already sitting in the EP0 buffer
    pub fn ctrl_send_in_place(&mut self, len: usize) -> Result<(), UsbError> {
        // Sanity check: an IN data stage must have been requested
        if self.setup.direction() != Direction::In
            || self.eps.get(EpAddress::CONTROL_OUT).state != EpState::Setup
        {
            return Err(UsbError::Error);
        }

        // Don't send more bytes than requested
        let len = len.min(self.setup.wLength as usize).min(CTRL_BUFFER_SIZE);

        let ep = self.eps.get_mut(EpAddress::CONTROL_IN);
        ep.state = EpState::Data;
        ep.transfer = Transfer {
            total: len as u16,
            progress: 0,
        };
        self.port.ep_send(EpAddress::CONTROL_IN, &self.ctrl_buf[..len]);
        Ok(())
    }

    /// Arm the data stage of the current OUT control transfer; the bytes
    /// land in [`Bus::ctrl_data`] before `control_complete` runs.
    pub fn ctrl_receive(&mut self, len: usize) -> Result<(), UsbError> {
        // Sanity check: an OUT data stage must have been requested
        if self.setup.direction() != Direction::Out
            || self.eps.get(EpAddress::CONTROL_OUT).state != EpState::Setup
        {
            return Err(UsbError::Error);
        }

        let len = len.min(self.setup.wLength as usize).min(CTRL_BUFFER_SIZE);

        let ep = self.eps.get_mut(EpAddress::CONTROL_OUT);
        ep.state = EpState::Data;
        ep.transfer = Transfer {
            total: len as u16,
            progress: 0,
        };
        self.port.ep_receive(EpAddress::CONTROL_OUT, len as u16);
        Ok(())
    }

    /// The bytes received by the latest OUT data stage
    pub fn ctrl_data(&self) -> &[u8] {
        &self.ctrl_buf[..self.ctrl_rx_len as usize]
    }

    /// Request Error: STALL both halves of EP0 (cleared by hardware on
    /// the next SETUP packet)
    pub(crate) fn ctrl_stall(&mut self) {
        self.port.ep_set_stall(EpAddress::CONTROL_IN);
        self.eps.get_mut(EpAddress::CONTROL_IN).state = EpState::Stall;
        self.port.ep_set_stall(EpAddress::CONTROL_OUT);
        self.eps.get_mut(EpAddress::CONTROL_OUT).state = EpState::Stall;
    }

    /// Successful request without (or after) an OUT data stage: ZLP on
    /// EP0 IN
    pub(crate) fn ctrl_send_status(&mut self) {
        let ep = self.eps.get_mut(EpAddress::CONTROL_IN);
        ep.state = EpState::Status;
        ep.transfer = Transfer::default();
        self.port.ep_send(EpAddress::CONTROL_IN, &[]);
    }

    /// Successful IN data stage: expect the host's ZLP on EP0 OUT
    pub(crate) fn ctrl_receive_status(&mut self) {
        let ep = self.eps.get_mut(EpAddress::CONTROL_OUT);
        ep.state = EpState::Status;
        ep.transfer = Transfer::default();
        self.port.ep_receive(EpAddress::CONTROL_OUT, 0);
    }
}

impl<P: PortDriver> UsbDevice<'_, P> {
    /// EP0 IN completion: terminate ambiguous transfers with a ZLP, run
    /// the data-stage callback, start the status stage, and apply a
    /// pending SET_ADDRESS on controllers that latch it late
    pub(crate) fn control_in_complete(
        &mut self,
        funcs: &mut Functions<'_, P>,
    ) {
        let setup = self.bus.setup;
        let (sent, mps) = {
            let ep = self.bus.eps.get(EpAddress::CONTROL_IN);
            (ep.transfer.total, ep.max_packet)
        };

        if sent != 0 && sent < setup.wLength && (sent % mps) == 0 {
            // Last packet was a full one but the host expects more:
            // send a ZLP to mark the end of the transfer
            let ep = self.bus.eps.get_mut(EpAddress::CONTROL_IN);
            ep.transfer = Transfer::default();
            self.bus.port.ep_send(EpAddress::CONTROL_IN, &[]);
            return;
        }

        self.bus.eps.get_mut(EpAddress::CONTROL_IN).state = EpState::Idle;

        if setup.direction() == Direction::In {
            // End of an IN data stage
            if self.bus.config_selector != 0
                && setup.recipient() == RECIPIENT_INTERFACE
            {
                if let Some(index) =
                    self.layout.function_for_interface(setup.wIndex as u8)
                {
                    if index < funcs.len() {
                        funcs[index].control_complete(&mut self.bus);
                    }
                }
            }
            self.bus.ctrl_receive_status();
        } else if !P::SETS_ADDRESS_EARLY
            && setup.bmRequestType == 0
            && setup.bRequest == SET_ADDRESS
        {
            // Status stage of SET_ADDRESS acknowledged; switch over now
            self.bus.port.set_address((setup.wValue & 0x7F) as u8);
        }
    }

    /// EP0 OUT completion: capture received data-stage bytes, run the
    /// data-stage callback, start the status stage
    pub(crate) fn control_out_complete(
        &mut self,
        funcs: &mut Functions<'_, P>,
        data: &[u8],
    ) {
        let setup = self.bus.setup;

        if setup.wLength > 0 && setup.direction() == Direction::Out {
            let len = data.len().min(CTRL_BUFFER_SIZE);
            self.bus.ctrl_buf[..len].copy_from_slice(&data[..len]);
            self.bus.ctrl_rx_len = len as u16;

            // Standard requests have no OUT data stage, so this must be
            // interface-related
            if self.bus.config_selector != 0
                && setup.recipient() == RECIPIENT_INTERFACE
            {
                if let Some(index) =
                    self.layout.function_for_interface(setup.wIndex as u8)
                {
                    if index < funcs.len() {
                        funcs[index].control_complete(&mut self.bus);
                    }
                }
            }

            self.bus.ctrl_send_status();
        }
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/control.rs"]
mod tests;
