//! The trait every device function (class implementation) satisfies, and
//! the profile it publishes at mount time.

use crate::device::Bus;
use crate::port::PortDriver;
use crate::types::{EpAddress, EpKind, UsbError, UsbSpeed};

/// A data endpoint claimed by a function at mount time
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
pub struct EpClaim {
    pub address: EpAddress,
    pub kind: EpKind,
    /// Largest packet size the function will ever open this endpoint
    /// with (the High Speed value for dual-speed functions)
    pub max_packet: u16,
}

/// Up to four endpoint claims per function (NCM's three is the current
/// maximum)
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, Default)]
pub struct EpClaims {
    list: [Option<EpClaim>; 4],
}

impl EpClaims {
    pub const fn new() -> Self {
        Self { list: [None; 4] }
    }

    pub fn push(&mut self, claim: EpClaim) {
        for slot in self.list.iter_mut() {
            if slot.is_none() {
                *slot = Some(claim);
                return;
            }
        }
        unreachable!("more endpoint claims than EpClaims can hold");
    }

    pub fn iter(&self) -> impl Iterator<Item = &EpClaim> {
        self.list.iter().filter_map(Option::as_ref)
    }
}

/// What a function tells the device when it is mounted
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
pub struct FunctionProfile {
    /// Consecutive interface slots the function occupies (composite
    /// CDC/NCM functions take two)
    pub interfaces: u8,
    /// Number of alternate settings of the function's interfaces
    pub alt_settings: u8,
    pub endpoints: EpClaims,
}

/// How a function's interface string is rendered into a string
/// descriptor
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
pub enum InterfaceString<'a> {
    Ascii(&'a str),
    /// Expanded to uppercase hex digits (MAC addresses and the like)
    HexBytes(&'a [u8]),
}

/// One device function: a class implementation mountable on a
/// [`UsbDevice`](crate::device::UsbDevice).
///
/// The device invokes these callbacks from its event handlers; functions
/// act on the bus (EP0 answers, data transfers, endpoint management)
/// through the [`Bus`] handle they are given.
pub trait UsbFunction<P: PortDriver> {
    /// Interface span and endpoint claims; read once at mount time
    fn profile(&self) -> FunctionProfile;

    /// Append the function's interface descriptors (with any class
    /// descriptors and endpoint descriptors) for a configuration rooted
    /// at interface number `base_if`; returns the number of bytes
    /// written
    fn write_descriptor(
        &self,
        speed: UsbSpeed,
        base_if: u8,
        out: &mut [u8],
    ) -> usize;

    /// A function-internal string, referenced from the function's
    /// descriptors via
    /// [`interface_string_index`](crate::wire::interface_string_index)
    fn interface_string(&self, _index: u8) -> Option<InterfaceString<'_>> {
        None
    }

    /// Microsoft compatible ID ("WINUSB", "WINNCM", ...) advertised for
    /// this function in the Microsoft OS descriptors
    fn ms_compatible_id(&self) -> Option<&str> {
        None
    }

    /// The device assigned the function its first interface number
    /// (classes that emit notifications carry it in `wIndex`)
    fn mounted(&mut self, _base_if: u8) {}

    /// The device has entered a configuration (or this interface's
    /// alternate setting was selected): open endpoints, start the class
    /// protocol
    fn open(&mut self, bus: &mut Bus<P>);

    /// Leaving the configuration: close endpoints, drop protocol state
    fn close(&mut self, bus: &mut Bus<P>);

    /// Currently selected alternate setting
    fn alt_setting(&self) -> u8 {
        0
    }

    /// Record a new alternate setting; the device calls `close`, then
    /// this, then `open`
    fn select_alt(&mut self, _alt: u8) {}

    /// A class or vendor SETUP request addressed to this function's
    /// interfaces. Returning an error stalls EP0.
    fn control_request(&mut self, bus: &mut Bus<P>) -> Result<(), UsbError>;

    /// The data stage of the current control transfer finished; for OUT
    /// requests the received bytes are in
    /// [`Bus::ctrl_data`]
    fn control_complete(&mut self, _bus: &mut Bus<P>) {}

    /// An IN transfer on one of the function's endpoints completed
    /// (`len` bytes reached the host; zero-length also reports a
    /// freshly un-stalled endpoint)
    fn transfer_in_complete(
        &mut self,
        _bus: &mut Bus<P>,
        _addr: EpAddress,
        _len: usize,
    ) {
    }

    /// An OUT transfer on one of the function's endpoints completed with
    /// the given bytes (empty also reports a freshly un-stalled
    /// endpoint)
    fn transfer_out_complete(
        &mut self,
        _bus: &mut Bus<P>,
        _addr: EpAddress,
        _data: &[u8],
    ) {
    }
}
