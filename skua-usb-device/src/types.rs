//! Common types shared by the device core and the class crates.

/// Errors which can arise inside the device stack
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum UsbError {
    /// A precondition was not met (unconfigured, feature disabled,
    /// resources exhausted)
    Error,
    /// The endpoint has a transfer in flight; retry from the completion
    /// callback
    Busy,
    /// Malformed or unsupported request; the control engine answers with
    /// an EP0 STALL
    Invalid,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum UsbSpeed {
    Low1_1,
    Full12,
    High480,
}

/// Transfer type of an endpoint, with the encoding of `bmAttributes`
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum EpKind {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl EpKind {
    /// Largest packet size the USB 2.0 spec allows for this transfer type
    /// at the given link speed
    pub const fn max_packet_limit(self, speed: UsbSpeed) -> u16 {
        match (self, speed) {
            (EpKind::Isochronous, UsbSpeed::High480) => 1024,
            (EpKind::Isochronous, _) => 1023,
            (EpKind::Bulk, UsbSpeed::High480) => 512,
            (EpKind::Interrupt, UsbSpeed::High480) => 1024,
            (EpKind::Control, UsbSpeed::Low1_1) => 8,
            _ => 64,
        }
    }
}

/// Largest bulk packet at the given speed (64 at Full Speed, 512 at High
/// Speed); data-class endpoints use this directly.
pub const fn bulk_max_packet(speed: UsbSpeed) -> u16 {
    EpKind::Bulk.max_packet_limit(speed)
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// A USB endpoint address: direction plus a number in `0..16`
///
/// The wire encoding (bit 7 = IN) is kept so that addresses round-trip
/// into `bEndpointAddress` and `wIndex` fields unchanged.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct EpAddress(u8);

impl EpAddress {
    pub const CONTROL_IN: Self = Self(0x80);
    pub const CONTROL_OUT: Self = Self(0x00);

    pub const fn new_in(number: u8) -> Self {
        Self(0x80 | (number & 0xF))
    }

    pub const fn new_out(number: u8) -> Self {
        Self(number & 0xF)
    }

    pub const fn from_wire(byte: u8) -> Self {
        Self(byte & 0x8F)
    }

    pub const fn direction(self) -> Direction {
        if (self.0 & 0x80) != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub const fn number(self) -> u8 {
        self.0 & 0xF
    }

    pub const fn to_wire(self) -> u8 {
        self.0
    }

    pub const fn is_control(self) -> bool {
        self.number() == 0
    }
}

/// How the serial number string descriptor is produced
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
pub enum SerialNumber<'a> {
    /// No serial number string (iSerialNumber = 0)
    None,
    /// Plain text serial number
    Ascii(&'a str),
    /// Raw bytes expanded to uppercase hex digits (e.g. a chip unique ID)
    Bcd(&'a [u8]),
}

/// Which Microsoft OS descriptor generation the device advertises
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum MsOsDescVersion {
    None,
    /// MS OS 1.0: magic string descriptor at index 0xEE plus the extended
    /// compatible-ID set
    V1,
    /// MS OS 2.0: BOS platform capability plus the vendor-request
    /// descriptor set
    V2,
}

/// Everything about the device that isn't contributed by a mounted
/// function: identity, strings, power attributes, capability switches.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
pub struct DeviceDescription<'a> {
    pub vendor_name: &'a str,
    pub vendor_id: u16,
    pub product_name: &'a str,
    pub product_id: u16,
    /// Device release number in binary-coded decimal (0x0120 = 1.20)
    pub version_bcd: u16,
    pub serial_number: SerialNumber<'a>,
    pub config_name: &'a str,
    pub self_powered: bool,
    pub remote_wakeup: bool,
    pub max_current_ma: u16,
    /// Advertise Link Power Management support in the BOS descriptor
    pub lpm: bool,
    /// The controller can negotiate High Speed; enables the device
    /// qualifier and other-speed descriptors
    pub high_speed_capable: bool,
    pub ms_os_desc: MsOsDescVersion,
}

impl Default for DeviceDescription<'_> {
    fn default() -> Self {
        Self {
            vendor_name: "",
            vendor_id: 0xFFFF,
            product_name: "",
            product_id: 0xFFFF,
            version_bcd: 0x0100,
            serial_number: SerialNumber::None,
            config_name: "",
            self_powered: false,
            remote_wakeup: false,
            max_current_ma: 100,
            lpm: false,
            high_speed_capable: false,
            ms_os_desc: MsOsDescVersion::None,
        }
    }
}
