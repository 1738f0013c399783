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

/// Capacity of one transmit NTB slot
pub const MAX_IN_SIZE: usize = 2048;

/// Capacity of one receive NTB slot
pub const MAX_OUT_SIZE: usize = 2048;

/// Largest Ethernet frame carried as one datagram
pub const MAX_SEGMENT_SIZE: usize = 1514;

/// Cap on datagrams batched into one NTB, advertised to the host and
/// applied to the transmit path as well
pub const MAX_NTB_DATAGRAMS: usize = 20;

const NTH16_SIZE: usize = 12;
const NDP16_BASE: usize = 8;
const NDP16_ENTRY: usize = 4;

const NTH16_SIGNATURE: u32 = 0x484D_434E; // "NCMH"
const NDP16_SIGNATURE: u32 = 0x304D_434E; // "NCM0"

// Class codes
const CDC_COMM_CLASS: u8 = 0x02;
const CDC_DATA_CLASS: u8 = 0x0A;
const CDC_SUBCLASS_NCM: u8 = 0x0D;
const CDC_PROTOCOL_NTB: u8 = 0x01;

// Class-specific functional descriptors
const CS_INTERFACE: u8 = 0x24;
const CDC_FUNC_HEADER: u8 = 0x00;
const CDC_FUNC_UNION: u8 = 0x06;
const CDC_FUNC_ETHERNET: u8 = 0x0F;
const CDC_FUNC_NCM: u8 = 0x1A;

// Class requests (NCM spec, table 6-2)
const REQ_GET_NTB_PARAMETERS: u8 = 0x80;
const REQ_GET_NTB_INPUT_SIZE: u8 = 0x85;
const REQ_SET_NTB_INPUT_SIZE: u8 = 0x86;

// Notifications (CDC spec, section 6.3)
const NOTIFY_NETWORK_CONNECTION: u8 = 0x00;
const NOTIFY_CONNECTION_SPEED_CHANGE: u8 = 0x2A;

const NOTIFY_PACKET_SIZE: u16 = 8;
const NOTIFY_INTERVAL: u8 = 20;

/// Endpoint assignment and identity of an NCM function
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone)]
pub struct NcmConfig {
    pub notify_ep: EpAddress,
    pub in_ep: EpAddress,
    pub out_ep: EpAddress,
    /// Device-side MAC address, exposed to the host through the
    /// iMACAddress string descriptor
    pub mac: [u8; 6],
    pub name: &'static str,
}

/// Ownership of one NTB buffer slot
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "std", derive(Debug))]
#[derive(Copy, Clone, PartialEq, Eq)]
enum SlotState {
    Empty,
    /// The application is filling or draining the slot
    Processing,
    /// The slot is on the wire
    Transferring,
    /// Loaded and waiting for its turn
    Ready,
}

struct InRing {
    pages: [[u8; MAX_IN_SIZE]; 2],
    fill_state: SlotState,
    send_state: SlotState,
    /// Slot currently being filled
    page: u8,
    dg_count: u16,
    /// Where the next datagram's payload goes; doubles as the NDP
    /// offset at send time
    index: u16,
    remaining: u16,
    /// Negotiated NTB cap (SET_NTB_INPUT_SIZE)
    max_size: u32,
    sequence: [u16; 2],
}

impl InRing {
    const fn new() -> Self {
        Self {
            pages: [[0; MAX_IN_SIZE]; 2],
            fill_state: SlotState::Empty,
            send_state: SlotState::Empty,
            page: 0,
            dg_count: 0,
            index: NTH16_SIZE as u16,
            remaining: 0,
            max_size: MAX_IN_SIZE as u32,
            sequence: [0, 1],
        }
    }

    fn reset(&mut self) {
        self.fill_state = SlotState::Empty;
        self.send_state = SlotState::Ready;
        self.page = 0;
        self.dg_count = 0;
        self.index = NTH16_SIZE as u16;
        self.remaining = self.free_space();
        self.sequence = [0, 1];
    }

    /// Bytes still available for payload plus pointer entries, keeping
    /// room for the NTH16 and an empty NDP16
    fn free_space(&self) -> u16 {
        (self.max_size as usize - NTH16_SIZE - (NDP16_BASE + NDP16_ENTRY))
            as u16
    }
}

struct OutRing {
    pages: [[u8; MAX_OUT_SIZE]; 2],
    state: [SlotState; 2],
    /// Slot the application drains from
    page: u8,
    /// Offset of the NDP16 currently walked
    ndp_offset: u16,
    /// Entry index within that NDP16
    dg_index: u16,
}

impl OutRing {
    const fn new() -> Self {
        Self {
            pages: [[0; MAX_OUT_SIZE]; 2],
            state: [SlotState::Empty; 2],
            page: 0,
            ndp_offset: 0,
            dg_index: 0,
        }
    }
}

fn rd16(page: &[u8], offset: usize) -> u16 {
    if offset + 2 > page.len() {
        return 0;
    }
    u16::from_le_bytes([page[offset], page[offset + 1]])
}

fn rd32(page: &[u8], offset: usize) -> u32 {
    if offset + 4 > page.len() {
        return 0;
    }
    u32::from_le_bytes([
        page[offset],
        page[offset + 1],
        page[offset + 2],
        page[offset + 3],
    ])
}

fn wr16(page: &mut [u8], offset: usize, value: u16) {
    page[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn wr32(page: &mut [u8], offset: usize, value: u32) {
    page[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// A CDC-NCM device function: one communication interface plus one data
/// interface whose alternate setting 1 carries NTB traffic
pub struct Ncm {
    config: NcmConfig,
    base_if: u8,
    alt: u8,
    connected: bool,
    bitrate: u32,
    tx: InRing,
    rx: OutRing,
}

impl Ncm {
    pub fn new(config: NcmConfig) -> Self {
        Self {
            config,
            base_if: 0,
            alt: 0,
            connected: false,
            bitrate: 0,
            tx: InRing::new(),
            rx: OutRing::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Bring the network link up: open the data endpoints, prime both
    /// rings and notify the host of the connection and its speed
    pub fn connect<P: PortDriver>(
        &mut self,
        bus: &mut Bus<P>,
        bitrate: u32,
    ) -> Result<(), UsbError> {
        if self.alt != 1 || self.connected {
            return Err(UsbError::Invalid);
        }

        let mps = bulk_max_packet(bus.speed());
        bus.ep_open(self.config.in_ep, EpKind::Bulk, mps);
        bus.ep_open(self.config.out_ep, EpKind::Bulk, mps);

        self.tx.reset();
        self.rx = OutRing::new();

        // Start receiving into slot 0
        let _ = bus.ep_receive(self.config.out_ep, MAX_OUT_SIZE as u16);
        self.rx.state[0] = SlotState::Transferring;

        self.bitrate = bitrate;
        self.connected = true;

        // Speed change and connection notifications in one transfer, so
        // the host learns the link speed first
        let mut notify = [0u8; 24];
        notify[0] = 0xA1;
        notify[1] = NOTIFY_CONNECTION_SPEED_CHANGE;
        wr16(&mut notify, 4, self.base_if as u16);
        wr16(&mut notify, 6, 8);
        wr32(&mut notify, 8, bitrate); // downlink
        wr32(&mut notify, 12, bitrate); // uplink
        notify[16] = 0xA1;
        notify[17] = NOTIFY_NETWORK_CONNECTION;
        wr16(&mut notify, 18, 1);
        wr16(&mut notify, 20, self.base_if as u16);
        bus.ep_send(self.config.notify_ep, &notify)
    }

    /// Drop the network link and tell the host
    pub fn disconnect<P: PortDriver>(
        &mut self,
        bus: &mut Bus<P>,
    ) -> Result<(), UsbError> {
        if self.alt != 1 || !self.connected {
            return Err(UsbError::Invalid);
        }

        self.connected = false;
        self.tx.fill_state = SlotState::Empty;

        bus.ep_close(self.config.in_ep);
        bus.ep_close(self.config.out_ep);

        let mut notify = [0u8; 8];
        notify[0] = 0xA1;
        notify[1] = NOTIFY_NETWORK_CONNECTION;
        wr16(&mut notify, 2, 0);
        wr16(&mut notify, 4, self.base_if as u16);
        bus.ep_send(self.config.notify_ep, &notify)
    }

    /// Reserve space for a `length`-byte datagram in the filling NTB.
    ///
    /// Returns the payload slot to copy the frame into; follow up with
    /// [`Ncm::set_datagram`]. `None` when disconnected, the frame is
    /// oversized, or the NTB is full.
    pub fn alloc_datagram(&mut self, length: usize) -> Option<&mut [u8]> {
        if !self.connected
            || length > MAX_SEGMENT_SIZE
            || self.tx.fill_state == SlotState::Processing
            || self.tx.dg_count as usize >= MAX_NTB_DATAGRAMS
        {
            return None;
        }

        // Payloads pack forward from the header; their lengths are
        // remembered backwards from the end of the slot, and turn into
        // the NDP16 only at transmission time
        let aligned = (length + 3) & !3;
        let charged = aligned + NDP16_ENTRY;
        if charged > self.tx.remaining as usize {
            return None;
        }

        self.tx.fill_state = SlotState::Processing;
        self.tx.dg_count += 1;

        let page = &mut self.tx.pages[self.tx.page as usize];
        let tail = MAX_IN_SIZE - NDP16_ENTRY * self.tx.dg_count as usize;
        wr16(page, tail, length as u16);
        wr16(page, tail + 2, 0);

        let start = self.tx.index as usize;
        self.tx.index += aligned as u16;
        self.tx.remaining -= charged as u16;

        Some(&mut page[start..start + length])
    }

    /// Finish the reservation made by [`Ncm::alloc_datagram`]; the NTB
    /// goes out immediately unless its sibling is still on the wire
    pub fn set_datagram<P: PortDriver>(
        &mut self,
        bus: &mut Bus<P>,
    ) -> Result<(), UsbError> {
        if self.tx.fill_state != SlotState::Processing {
            return Err(UsbError::Invalid);
        }

        if self.tx.send_state != SlotState::Empty {
            self.tx.fill_state = SlotState::Ready;
        } else {
            let page = self.tx.page;
            self.send_ntb(bus, page);
        }
        Ok(())
    }

    /// Copy a whole datagram in and send it at the next opportunity
    pub fn put_datagram<P: PortDriver>(
        &mut self,
        bus: &mut Bus<P>,
        data: &[u8],
    ) -> Result<(), UsbError> {
        let Some(slot) = self.alloc_datagram(data.len()) else {
            return Err(UsbError::Invalid);
        };
        slot.copy_from_slice(data);
        self.set_datagram(bus)
    }

    /// Pop the next received datagram, walking the NDP chain and
    /// re-arming reception as slots drain
    pub fn get_datagram<P: PortDriver>(
        &mut self,
        bus: &mut Bus<P>,
    ) -> Option<&[u8]> {
        let page = self.rx.page as usize;

        match self.rx.state[page] {
            // Fresh NTB: take its first datagram
            SlotState::Ready => self.rx.state[page] = SlotState::Processing,

            SlotState::Processing => {
                // Advance past the datagram handed out last time
                let bytes = &self.rx.pages[page];
                let entry = self.rx.ndp_offset as usize
                    + NDP16_BASE
                    + NDP16_ENTRY * (self.rx.dg_index as usize + 1);
                let next_ndp =
                    rd16(bytes, self.rx.ndp_offset as usize + 6);

                if rd16(bytes, entry) != 0 {
                    self.rx.dg_index += 1;
                } else if next_ndp != 0 {
                    self.rx.ndp_offset = next_ndp;
                    self.rx.dg_index = 0;
                } else {
                    // Fully drained
                    self.rx.state[page] = SlotState::Empty;
                }

                // Move on to the sibling slot if it is already loaded
                let other = 1 - page;
                if self.rx.state[page] == SlotState::Empty
                    && self.rx.state[other] == SlotState::Ready
                {
                    self.rx.page = other as u8;
                    self.rx.state[other] = SlotState::Processing;
                    self.rx.ndp_offset =
                        rd16(&self.rx.pages[other], 10);
                    self.rx.dg_index = 0;

                    if self.connected {
                        let _ = bus.ep_receive(
                            self.config.out_ep,
                            MAX_OUT_SIZE as u16,
                        );
                        self.rx.state[page] = SlotState::Transferring;
                    }
                }
            }

            _ => {}
        }

        let page = self.rx.page as usize;
        if self.rx.state[page] != SlotState::Processing {
            return None;
        }

        let bytes = &self.rx.pages[page];
        let entry = self.rx.ndp_offset as usize
            + NDP16_BASE
            + NDP16_ENTRY * self.rx.dg_index as usize;
        let index = rd16(bytes, entry) as usize;
        let length = rd16(bytes, entry + 2) as usize;

        if index == 0 || index + length > MAX_OUT_SIZE {
            self.rx.state[page] = SlotState::Empty;
            return None;
        }

        Some(&self.rx.pages[page][index..index + length])
    }

    /// Synthesize the NDP16 and NTH16 around the packed payloads and
    /// hand the block to the port
    fn send_ntb<P: PortDriver>(&mut self, bus: &mut Bus<P>, page: u8) {
        let count = self.tx.dg_count as usize;
        let ndp_offset = self.tx.index as usize;
        let ndp_len = NDP16_BASE + NDP16_ENTRY * (count + 1);

        // Collect the backward length list before the NDP overwrites
        // its tail
        let mut lengths = [0u16; MAX_NTB_DATAGRAMS];
        {
            let bytes = &self.tx.pages[page as usize];
            for (i, len) in lengths[..count].iter_mut().enumerate() {
                *len = rd16(bytes, MAX_IN_SIZE - NDP16_ENTRY * (i + 1));
            }
        }

        let block_len = (ndp_offset + ndp_len) as u16;
        let sequence = self.tx.sequence[page as usize];
        {
            let bytes = &mut self.tx.pages[page as usize];

            wr32(bytes, ndp_offset, NDP16_SIGNATURE);
            wr16(bytes, ndp_offset + 4, ndp_len as u16);
            wr16(bytes, ndp_offset + 6, 0); // no further NDP

            let mut dg_offset = NTH16_SIZE as u16;
            for (i, len) in lengths[..count].iter().enumerate() {
                let entry = ndp_offset + NDP16_BASE + NDP16_ENTRY * i;
                wr16(bytes, entry, dg_offset);
                wr16(bytes, entry + 2, *len);
                dg_offset = (dg_offset + len + 3) & !3;
            }
            // A null element ends the table
            let terminator = ndp_offset + NDP16_BASE + NDP16_ENTRY * count;
            wr32(bytes, terminator, 0);

            wr32(bytes, 0, NTH16_SIGNATURE);
            wr16(bytes, 4, NTH16_SIZE as u16);
            wr16(bytes, 6, sequence);
            wr16(bytes, 8, block_len);
            wr16(bytes, 10, ndp_offset as u16);
        }

        let _ = bus.ep_send(
            self.config.in_ep,
            &self.tx.pages[page as usize][..block_len as usize],
        );

        self.tx.sequence[page as usize] = sequence.wrapping_add(2);

        // Switch filling to the other slot
        self.tx.page = 1 - page;
        self.tx.dg_count = 0;
        self.tx.index = NTH16_SIZE as u16;
        self.tx.remaining = self.tx.free_space();
        self.tx.fill_state = SlotState::Empty;
        self.tx.send_state = SlotState::Transferring;
    }

    /// Check the NTH16 and every NDP16 of a freshly received block
    fn validate_ntb(bytes: &[u8], wire_len: usize) -> bool {
        if rd32(bytes, 0) != NTH16_SIGNATURE
            || rd16(bytes, 4) as usize != NTH16_SIZE
            || rd16(bytes, 8) as usize != wire_len
        {
            return false;
        }

        let block_len = wire_len;
        let mut ndp_offset = rd16(bytes, 10) as usize;

        // The chain must terminate with a zero next-NDP index; anything
        // else drops the block
        for _ in 0..MAX_NTB_DATAGRAMS {
            if ndp_offset < NTH16_SIZE
                || ndp_offset >= block_len
                || rd32(bytes, ndp_offset) != NDP16_SIGNATURE
                || (rd16(bytes, ndp_offset + 4) as usize)
                    <= NDP16_BASE + NDP16_ENTRY
            {
                return false;
            }
            ndp_offset = rd16(bytes, ndp_offset + 6) as usize;
            if ndp_offset == 0 {
                return true;
            }
        }
        false
    }

    fn out_complete<P: PortDriver>(&mut self, bus: &mut Bus<P>, data: &[u8]) {
        // Which slot was on the wire?
        let Some(rx) = self
            .rx
            .state
            .iter()
            .position(|s| *s == SlotState::Transferring)
        else {
            return;
        };

        let len = data.len().min(MAX_OUT_SIZE);
        self.rx.pages[rx][..len].copy_from_slice(&data[..len]);
        self.rx.state[rx] = SlotState::Empty;

        let mut refill = rx;
        if Self::validate_ntb(&self.rx.pages[rx], len) {
            self.rx.state[rx] = SlotState::Ready;
            refill = 1 - rx;

            // Publish the fresh block unless the sibling is still being
            // drained
            if self.rx.state[refill] == SlotState::Empty {
                self.rx.page = rx as u8;
                self.rx.ndp_offset = rd16(&self.rx.pages[rx], 10);
                self.rx.dg_index = 0;
            }
        } else {
            debug::println!("dropping invalid NTB ({} bytes)", len);
        }

        if self.rx.state[refill] == SlotState::Empty && self.connected {
            let _ = bus.ep_receive(self.config.out_ep, MAX_OUT_SIZE as u16);
            self.rx.state[refill] = SlotState::Transferring;
        }
    }

    /// NTB transmission is reconsidered after both notification and
    /// data IN completions, so the connect notification always reaches
    /// the host before the first block
    fn in_complete<P: PortDriver>(&mut self, bus: &mut Bus<P>) {
        self.tx.send_state = SlotState::Empty;

        if self.tx.fill_state == SlotState::Ready {
            let page = self.tx.page;
            self.send_ntb(bus, page);
        }
    }
}

impl<P: PortDriver> UsbFunction<P> for Ncm {
    fn profile(&self) -> FunctionProfile {
        let mut endpoints = EpClaims::new();
        endpoints.push(EpClaim {
            address: self.config.notify_ep,
            kind: EpKind::Interrupt,
            max_packet: NOTIFY_PACKET_SIZE,
        });
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
            alt_settings: 2,
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
        let mut len = 0;

        let iad = InterfaceAssociationDescriptor {
            bLength: 8,
            bDescriptorType: IAD_DESCRIPTOR,
            bFirstInterface: base_if,
            bInterfaceCount: 2,
            bFunctionClass: CDC_COMM_CLASS,
            bFunctionSubClass: CDC_SUBCLASS_NCM,
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
            bNumEndpoints: 1,
            bInterfaceClass: CDC_COMM_CLASS,
            bInterfaceSubClass: CDC_SUBCLASS_NCM,
            bInterfaceProtocol: 0,
            iInterface: istr,
        };
        out[len..len + 9].copy_from_slice(bytemuck::bytes_of(&comm_if));
        len += 9;

        // Header functional descriptor, CDC 1.10
        out[len..len + 5]
            .copy_from_slice(&[5, CS_INTERFACE, CDC_FUNC_HEADER, 0x10, 0x01]);
        len += 5;

        // Union: communication interface masters the data interface
        out[len..len + 5].copy_from_slice(&[
            5,
            CS_INTERFACE,
            CDC_FUNC_UNION,
            base_if,
            base_if + 1,
        ]);
        len += 5;

        // Ethernet networking functional descriptor
        out[len] = 13;
        out[len + 1] = CS_INTERFACE;
        out[len + 2] = CDC_FUNC_ETHERNET;
        out[len + 3] = interface_string_index(base_if, 1); // iMACAddress
        out[len + 4..len + 8].fill(0); // bmEthernetStatistics
        out[len + 8..len + 10]
            .copy_from_slice(&(MAX_SEGMENT_SIZE as u16).to_le_bytes());
        out[len + 10..len + 13].fill(0); // no filters
        len += 13;

        // NCM functional descriptor, NCM 1.0
        out[len..len + 6].copy_from_slice(&[
            6,
            CS_INTERFACE,
            CDC_FUNC_NCM,
            0x00,
            0x01,
            0x00,
        ]);
        len += 6;

        len += write_endpoint_descriptor(
            &mut out[len..],
            self.config.notify_ep,
            EpKind::Interrupt,
            NOTIFY_PACKET_SIZE,
            NOTIFY_INTERVAL,
            speed,
        );

        // Data interface: alternate 0 is idle, alternate 1 carries NTBs
        let data_if0 = InterfaceDescriptor {
            bLength: 9,
            bDescriptorType: INTERFACE_DESCRIPTOR,
            bInterfaceNumber: base_if + 1,
            bAlternateSetting: 0,
            bNumEndpoints: 0,
            bInterfaceClass: CDC_DATA_CLASS,
            bInterfaceSubClass: 0,
            bInterfaceProtocol: CDC_PROTOCOL_NTB,
            iInterface: 0,
        };
        out[len..len + 9].copy_from_slice(bytemuck::bytes_of(&data_if0));
        len += 9;

        let data_if1 = InterfaceDescriptor {
            bAlternateSetting: 1,
            bNumEndpoints: 2,
            iInterface: istr,
            ..data_if0
        };
        out[len..len + 9].copy_from_slice(bytemuck::bytes_of(&data_if1));
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
            1 => Some(InterfaceString::HexBytes(&self.config.mac)),
            _ => None,
        }
    }

    fn ms_compatible_id(&self) -> Option<&str> {
        Some("WINNCM")
    }

    fn open(&mut self, bus: &mut Bus<P>) {
        if self.alt == 1 {
            bus.ep_open(
                self.config.notify_ep,
                EpKind::Interrupt,
                NOTIFY_PACKET_SIZE,
            );
        } else {
            // Negotiation starts over from the full capability
            self.tx.max_size = MAX_IN_SIZE as u32;
        }
    }

    fn close(&mut self, bus: &mut Bus<P>) {
        self.connected = false;

        if self.alt == 1 {
            bus.ep_close(self.config.in_ep);
            bus.ep_close(self.config.out_ep);
            bus.ep_close(self.config.notify_ep);
        }
    }

    fn alt_setting(&self) -> u8 {
        self.alt
    }

    fn select_alt(&mut self, alt: u8) {
        self.alt = alt;
    }

    fn control_request(&mut self, bus: &mut Bus<P>) -> Result<(), UsbError> {
        let setup = *bus.setup();
        if setup.request_type() != CLASS_REQUEST {
            return Err(UsbError::Invalid);
        }

        match setup.bRequest {
            REQ_GET_NTB_PARAMETERS => bus.ctrl_send_with(|buf| {
                buf[..28].fill(0);
                wr16(buf, 0, 28); // wLength
                wr16(buf, 2, 1); // 16-bit NTBs only
                wr32(buf, 4, MAX_IN_SIZE as u32);
                wr16(buf, 8, 4); // wNdpInDivisor
                wr16(buf, 10, 0); // wNdpInPayloadRemainder
                wr16(buf, 12, 4); // wNdpInAlignment
                wr32(buf, 16, MAX_OUT_SIZE as u32);
                wr16(buf, 20, 4); // wNdpOutDivisor
                wr16(buf, 22, 0); // wNdpOutPayloadRemainder
                wr16(buf, 24, 4); // wNdpOutAlignment
                wr16(buf, 26, MAX_NTB_DATAGRAMS as u16);
                28
            }),

            REQ_GET_NTB_INPUT_SIZE => {
                let size = self.tx.max_size;
                bus.ctrl_send(&size.to_le_bytes())
            }

            REQ_SET_NTB_INPUT_SIZE => bus.ctrl_receive(4),

            _ => Err(UsbError::Invalid),
        }
    }

    fn control_complete(&mut self, bus: &mut Bus<P>) {
        let setup = *bus.setup();
        if setup.direction() != Direction::Out {
            return;
        }

        if setup.bRequest == REQ_SET_NTB_INPUT_SIZE {
            let data = bus.ctrl_data();
            if data.len() == 4 {
                let size = u32::from_le_bytes(data.try_into().unwrap());
                // Must leave room for a header and one pointer table
                if size as usize > NTH16_SIZE + NDP16_BASE + NDP16_ENTRY {
                    self.tx.max_size = size.min(MAX_IN_SIZE as u32);
                }
            }
        }
    }

    fn transfer_in_complete(
        &mut self,
        bus: &mut Bus<P>,
        _addr: EpAddress,
        _len: usize,
    ) {
        self.in_complete(bus);
    }

    fn transfer_out_complete(
        &mut self,
        bus: &mut Bus<P>,
        _addr: EpAddress,
        data: &[u8],
    ) {
        self.out_complete(bus, data);
    }
}

#[cfg(all(test, feature = "std"))]
#[path = "tests/ncm.rs"]
mod tests;
