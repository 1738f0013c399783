//! Endpoint bookkeeping: per-endpoint state, packet size and transfer
//! progress, for both directions of every endpoint number.

use crate::types::{Direction, EpAddress, EpKind};
use crate::MAX_EP_COUNT;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum EpState {
    Closed,
    Idle,
    /// EP0 OUT only: a SETUP packet has arrived and the request handler
    /// may start a data stage
    Setup,
    /// A transfer is in flight
    Data,
    /// EP0 only: the status-stage ZLP is in flight
    Status,
    Stall,
}

/// Progress of the transfer currently occupying an endpoint
///
/// `progress <= total`; for OUT endpoints a short packet can complete the
/// transfer with `progress < total`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, Default)]
pub struct Transfer {
    pub total: u16,
    pub progress: u16,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
pub struct Endpoint {
    pub kind: EpKind,
    /// Packet size currently in effect (clamped to the link speed)
    pub max_packet: u16,
    /// Packet size the owning function claimed at mount time (the High
    /// Speed value); the speed clamp recomputes `max_packet` from this
    pub claim_max_packet: u16,
    pub state: EpState,
    /// Index of the mounted function this endpoint was claimed by
    pub owner: u8,
    pub transfer: Transfer,
}

impl Endpoint {
    const fn unclaimed() -> Self {
        Self {
            kind: EpKind::Bulk,
            max_packet: 0,
            claim_max_packet: 0,
            state: EpState::Closed,
            owner: 0,
            transfer: Transfer {
                total: 0,
                progress: 0,
            },
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.max_packet != 0
    }
}

/// Both directions of all endpoint numbers on one device
pub struct EndpointTable {
    eps_in: [Endpoint; MAX_EP_COUNT],
    eps_out: [Endpoint; MAX_EP_COUNT],
}

impl Default for EndpointTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointTable {
    pub const fn new() -> Self {
        Self {
            eps_in: [Endpoint::unclaimed(); MAX_EP_COUNT],
            eps_out: [Endpoint::unclaimed(); MAX_EP_COUNT],
        }
    }

    pub fn get(&self, addr: EpAddress) -> &Endpoint {
        match addr.direction() {
            Direction::In => &self.eps_in[addr.number() as usize],
            Direction::Out => &self.eps_out[addr.number() as usize],
        }
    }

    pub fn get_mut(&mut self, addr: EpAddress) -> &mut Endpoint {
        match addr.direction() {
            Direction::In => &mut self.eps_in[addr.number() as usize],
            Direction::Out => &mut self.eps_out[addr.number() as usize],
        }
    }

    /// All data endpoints (both directions, number 1 and up)
    pub fn data_endpoints_mut(
        &mut self,
    ) -> impl Iterator<Item = &mut Endpoint> {
        self.eps_in
            .iter_mut()
            .skip(1)
            .chain(self.eps_out.iter_mut().skip(1))
    }

    /// Forget every data endpoint claim (unmounting all functions)
    pub fn reset_claims(&mut self) {
        for ep in self.data_endpoints_mut() {
            *ep = Endpoint::unclaimed();
        }
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/endpoint.rs"]
mod tests;
