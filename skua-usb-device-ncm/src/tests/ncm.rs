use super::*;
use skua_usb_device::device::UsbDevice;
use skua_usb_device::mocks::RecordingPort;
use skua_usb_device::types::DeviceDescription;
use skua_usb_device::wire::{
    SetupPacket, DEVICE_TO_HOST, GET_DESCRIPTOR, HOST_TO_DEVICE,
    RECIPIENT_INTERFACE, SET_CONFIGURATION, SET_INTERFACE,
};

const NOTIFY_EP: EpAddress = EpAddress::new_in(2);
const IN_EP: EpAddress = EpAddress::new_in(1);
const OUT_EP: EpAddress = EpAddress::new_out(1);

fn config() -> NcmConfig {
    NcmConfig {
        notify_ep: NOTIFY_EP,
        in_ep: IN_EP,
        out_ep: OUT_EP,
        mac: [0x02, 0x00, 0x5E, 0x10, 0x20, 0x30],
        name: "Skua Network",
    }
}

fn device() -> UsbDevice<'static, RecordingPort> {
    UsbDevice::new(RecordingPort::new(), DeviceDescription::default())
}

fn ev_setup(
    dev: &mut UsbDevice<'_, RecordingPort>,
    ncm: &mut Ncm,
    setup: SetupPacket,
) {
    let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] = [ncm];
    dev.handle_setup(&mut funcs, setup);
}

fn ev_in(
    dev: &mut UsbDevice<'_, RecordingPort>,
    ncm: &mut Ncm,
    addr: EpAddress,
) {
    let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] = [ncm];
    dev.handle_ep_in(&mut funcs, addr);
}

fn ev_out(
    dev: &mut UsbDevice<'_, RecordingPort>,
    ncm: &mut Ncm,
    addr: EpAddress,
    data: &[u8],
) {
    let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] = [ncm];
    dev.handle_ep_out(&mut funcs, addr, data);
}

/// Reset, SET_CONFIGURATION(1), SET_INTERFACE(1) on the data interface
fn bring_up(dev: &mut UsbDevice<'_, RecordingPort>, ncm: &mut Ncm) {
    {
        let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] = [ncm];
        dev.mount(&mut funcs).unwrap();
        dev.handle_reset(&mut funcs, UsbSpeed::Full12);
    }
    ev_setup(
        dev,
        ncm,
        SetupPacket {
            bmRequestType: HOST_TO_DEVICE,
            bRequest: SET_CONFIGURATION,
            wValue: 1,
            wIndex: 0,
            wLength: 0,
        },
    );
    ev_in(dev, ncm, EpAddress::CONTROL_IN);
    ev_setup(
        dev,
        ncm,
        SetupPacket {
            bmRequestType: HOST_TO_DEVICE | RECIPIENT_INTERFACE,
            bRequest: SET_INTERFACE,
            wValue: 1,
            wIndex: 1, // the data interface
            wLength: 0,
        },
    );
    ev_in(dev, ncm, EpAddress::CONTROL_IN);
}

fn connect(dev: &mut UsbDevice<'_, RecordingPort>, ncm: &mut Ncm) {
    ncm.connect(dev.bus(), 100_000_000).unwrap();
    // The connect notification completing releases NTB transmission
    ev_in(dev, ncm, NOTIFY_EP);
}

/// Assemble a valid single-NDP NTB carrying the given datagrams
fn build_ntb(sequence: u16, datagrams: &[&[u8]]) -> Vec<u8> {
    let mut offsets = Vec::new();
    let mut payload = Vec::new();
    let mut at = 12usize;
    for dg in datagrams {
        offsets.push(at);
        payload.extend_from_slice(dg);
        let aligned = (dg.len() + 3) & !3;
        payload.resize(payload.len() + aligned - dg.len(), 0);
        at += aligned;
    }

    let ndp_offset = at;
    let ndp_len = 8 + 4 * (datagrams.len() + 1);
    let block_len = ndp_offset + ndp_len;

    let mut ntb = Vec::with_capacity(block_len);
    ntb.extend_from_slice(&0x484D_434Eu32.to_le_bytes());
    ntb.extend_from_slice(&12u16.to_le_bytes());
    ntb.extend_from_slice(&sequence.to_le_bytes());
    ntb.extend_from_slice(&(block_len as u16).to_le_bytes());
    ntb.extend_from_slice(&(ndp_offset as u16).to_le_bytes());
    ntb.extend_from_slice(&payload);
    ntb.extend_from_slice(&0x304D_434Eu32.to_le_bytes());
    ntb.extend_from_slice(&(ndp_len as u16).to_le_bytes());
    ntb.extend_from_slice(&0u16.to_le_bytes());
    for (offset, dg) in offsets.iter().zip(datagrams) {
        ntb.extend_from_slice(&(*offset as u16).to_le_bytes());
        ntb.extend_from_slice(&(dg.len() as u16).to_le_bytes());
    }
    ntb.extend_from_slice(&[0, 0, 0, 0]);
    ntb
}

#[test]
fn descriptor_covers_both_interfaces() {
    let mut ncm = Ncm::new(config());
    let mut dev = device();
    bring_up(&mut dev, &mut ncm);

    ev_setup(
        &mut dev,
        &mut ncm,
        SetupPacket {
            bmRequestType: DEVICE_TO_HOST,
            bRequest: GET_DESCRIPTOR,
            wValue: 0x0200,
            wIndex: 0,
            wLength: 512,
        },
    );
    let cfg = dev
        .bus()
        .port()
        .last_send_on(EpAddress::CONTROL_IN)
        .unwrap()
        .to_vec();

    // config + IAD + comm IF + HFD + UFD + ENFD + NCMFD + notify EP +
    // data IF alt0 + data IF alt1 + 2 data EPs
    assert_eq!(cfg.len(), 9 + 8 + 9 + 5 + 5 + 13 + 6 + 7 + 9 + 9 + 7 + 7);
    assert_eq!(cfg[4], 2); // bNumInterfaces

    // IAD groups two interfaces starting at 0
    assert_eq!(cfg[9], 8);
    assert_eq!(cfg[10], 11);
    assert_eq!(cfg[11], 0);
    assert_eq!(cfg[12], 2);
    assert_eq!(cfg[13], 0x02);
    assert_eq!(cfg[14], 0x0D);

    // Ethernet functional descriptor advertises the segment size
    let enfd = 9 + 8 + 9 + 5 + 5;
    assert_eq!(cfg[enfd + 2], 0x0F);
    assert_eq!(
        u16::from_le_bytes([cfg[enfd + 8], cfg[enfd + 9]]),
        1514
    );
}

#[test]
fn ntb_parameters_report_16bit_format() {
    let mut ncm = Ncm::new(config());
    let mut dev = device();
    bring_up(&mut dev, &mut ncm);

    ev_setup(
        &mut dev,
        &mut ncm,
        SetupPacket {
            bmRequestType: DEVICE_TO_HOST | 0x20 | RECIPIENT_INTERFACE,
            bRequest: 0x80,
            wValue: 0,
            wIndex: 0,
            wLength: 28,
        },
    );
    let params = dev
        .bus()
        .port()
        .last_send_on(EpAddress::CONTROL_IN)
        .unwrap()
        .to_vec();
    assert_eq!(params.len(), 28);
    assert_eq!(u16::from_le_bytes([params[0], params[1]]), 28);
    assert_eq!(u16::from_le_bytes([params[2], params[3]]), 1);
    assert_eq!(
        u32::from_le_bytes(params[4..8].try_into().unwrap()),
        2048
    );
    assert_eq!(u16::from_le_bytes([params[8], params[9]]), 4);
    assert_eq!(u16::from_le_bytes([params[12], params[13]]), 4);
    assert_eq!(u16::from_le_bytes([params[26], params[27]]), 20);
}

#[test]
fn ntb_input_size_negotiation() {
    let mut ncm = Ncm::new(config());
    let mut dev = device();
    bring_up(&mut dev, &mut ncm);

    // Host shrinks the IN NTB cap to 1024
    ev_setup(
        &mut dev,
        &mut ncm,
        SetupPacket {
            bmRequestType: HOST_TO_DEVICE | 0x20 | RECIPIENT_INTERFACE,
            bRequest: 0x86,
            wValue: 0,
            wIndex: 0,
            wLength: 4,
        },
    );
    ev_out(
        &mut dev,
        &mut ncm,
        EpAddress::CONTROL_OUT,
        &1024u32.to_le_bytes(),
    );

    ev_setup(
        &mut dev,
        &mut ncm,
        SetupPacket {
            bmRequestType: DEVICE_TO_HOST | 0x20 | RECIPIENT_INTERFACE,
            bRequest: 0x85,
            wValue: 0,
            wIndex: 0,
            wLength: 4,
        },
    );
    assert_eq!(
        dev.bus().port().last_send_on(EpAddress::CONTROL_IN),
        Some(&1024u32.to_le_bytes()[..])
    );

    // A cap smaller than header + pointer table is ignored
    ev_setup(
        &mut dev,
        &mut ncm,
        SetupPacket {
            bmRequestType: HOST_TO_DEVICE | 0x20 | RECIPIENT_INTERFACE,
            bRequest: 0x86,
            wValue: 0,
            wIndex: 0,
            wLength: 4,
        },
    );
    ev_out(
        &mut dev,
        &mut ncm,
        EpAddress::CONTROL_OUT,
        &16u32.to_le_bytes(),
    );
    assert_eq!(ncm.tx.max_size, 1024);
}

#[test]
fn connect_notifies_and_arms_reception() {
    let mut ncm = Ncm::new(config());
    let mut dev = device();
    bring_up(&mut dev, &mut ncm);

    ncm.connect(dev.bus(), 100_000_000).unwrap();

    let notify = dev
        .bus()
        .port()
        .last_send_on(NOTIFY_EP)
        .unwrap()
        .to_vec();
    assert_eq!(notify.len(), 24);
    assert_eq!(notify[0], 0xA1);
    assert_eq!(notify[1], 0x2A); // connection speed change
    assert_eq!(
        u32::from_le_bytes(notify[8..12].try_into().unwrap()),
        100_000_000
    );
    assert_eq!(notify[17], 0x00); // network connection
    assert_eq!(u16::from_le_bytes([notify[18], notify[19]]), 1);

    assert_eq!(dev.bus().port().last_receive_on(OUT_EP), Some(2048));

    // Connecting twice is refused
    assert_eq!(
        ncm.connect(dev.bus(), 100_000_000),
        Err(UsbError::Invalid)
    );
}

#[test]
fn connect_requires_the_active_alt_setting() {
    let mut ncm = Ncm::new(config());
    let mut dev = device();
    {
        let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] = [&mut ncm];
        dev.mount(&mut funcs).unwrap();
        dev.handle_reset(&mut funcs, UsbSpeed::Full12);
    }
    assert_eq!(
        ncm.connect(dev.bus(), 1_000_000),
        Err(UsbError::Invalid)
    );
}

#[test]
fn transmit_frames_two_datagrams_into_one_ntb() {
    // Two 100-byte datagrams batched while the connect notification is
    // still in flight end up in a single NTB
    let mut ncm = Ncm::new(config());
    let mut dev = device();
    bring_up(&mut dev, &mut ncm);
    ncm.connect(dev.bus(), 100_000_000).unwrap();

    ncm.put_datagram(dev.bus(), &[0x11; 100]).unwrap();
    ncm.put_datagram(dev.bus(), &[0x22; 100]).unwrap();
    assert_eq!(dev.bus().port().last_send_on(IN_EP), None);

    // Notification completion releases the block
    ev_in(&mut dev, &mut ncm, NOTIFY_EP);
    let ntb = dev.bus().port().last_send_on(IN_EP).unwrap().to_vec();

    // NTH16
    assert_eq!(&ntb[0..4], b"NCMH");
    assert_eq!(u16::from_le_bytes([ntb[4], ntb[5]]), 12);
    assert_eq!(u16::from_le_bytes([ntb[6], ntb[7]]), 0); // sequence
    let block_len = u16::from_le_bytes([ntb[8], ntb[9]]) as usize;
    assert_eq!(block_len, ntb.len());
    assert_eq!(block_len, 12 + 100 + 100 + 20);
    let ndp = u16::from_le_bytes([ntb[10], ntb[11]]) as usize;
    assert_eq!(ndp, 212);

    // NDP16 with both entries and the terminator
    assert_eq!(&ntb[ndp..ndp + 4], b"NCM0");
    assert_eq!(u16::from_le_bytes([ntb[ndp + 4], ntb[ndp + 5]]), 20);
    assert_eq!(u16::from_le_bytes([ntb[ndp + 6], ntb[ndp + 7]]), 0);
    assert_eq!(u16::from_le_bytes([ntb[ndp + 8], ntb[ndp + 9]]), 12);
    assert_eq!(u16::from_le_bytes([ntb[ndp + 10], ntb[ndp + 11]]), 100);
    assert_eq!(u16::from_le_bytes([ntb[ndp + 12], ntb[ndp + 13]]), 112);
    assert_eq!(u16::from_le_bytes([ntb[ndp + 14], ntb[ndp + 15]]), 100);
    assert_eq!(&ntb[ndp + 16..ndp + 20], &[0, 0, 0, 0]);

    // Payload round-trips byte for byte
    assert!(ntb[12..112].iter().all(|b| *b == 0x11));
    assert!(ntb[112..212].iter().all(|b| *b == 0x22));
}

#[test]
fn sequence_numbers_interleave_across_slots() {
    let mut ncm = Ncm::new(config());
    let mut dev = device();
    bring_up(&mut dev, &mut ncm);
    connect(&mut dev, &mut ncm);

    for expected_seq in 0..4u16 {
        ncm.put_datagram(dev.bus(), &[7; 64]).unwrap();
        let ntb = dev.bus().port().last_send_on(IN_EP).unwrap().to_vec();
        assert_eq!(u16::from_le_bytes([ntb[6], ntb[7]]), expected_seq);
        ev_in(&mut dev, &mut ncm, IN_EP);
    }
}

#[test]
fn datagram_too_large_is_refused() {
    let mut ncm = Ncm::new(config());
    let mut dev = device();
    bring_up(&mut dev, &mut ncm);
    connect(&mut dev, &mut ncm);

    assert!(ncm.alloc_datagram(MAX_SEGMENT_SIZE + 1).is_none());
    assert_eq!(
        ncm.put_datagram(dev.bus(), &[0; MAX_SEGMENT_SIZE + 1]),
        Err(UsbError::Invalid)
    );
}

#[test]
fn receive_walks_the_datagram_pointer_table() {
    let mut ncm = Ncm::new(config());
    let mut dev = device();
    bring_up(&mut dev, &mut ncm);
    connect(&mut dev, &mut ncm);

    let ntb = build_ntb(0, &[&[0xAA; 42], &[0xBB; 100]]);
    ev_out(&mut dev, &mut ncm, OUT_EP, &ntb);

    // The sibling slot was re-armed immediately
    assert_eq!(
        dev.bus()
            .port()
            .receives
            .iter()
            .filter(|(a, _)| *a == OUT_EP)
            .count(),
        2
    );

    let first = ncm.get_datagram(dev.bus()).unwrap().to_vec();
    assert_eq!(first, vec![0xAA; 42]);
    let second = ncm.get_datagram(dev.bus()).unwrap().to_vec();
    assert_eq!(second, vec![0xBB; 100]);
    assert!(ncm.get_datagram(dev.bus()).is_none());
}

#[test]
fn invalid_ntb_is_dropped_silently() {
    let mut ncm = Ncm::new(config());
    let mut dev = device();
    bring_up(&mut dev, &mut ncm);
    connect(&mut dev, &mut ncm);

    let mut bad = build_ntb(0, &[&[0xCC; 64]]);
    bad[0] = b'X'; // break the NTH16 signature
    ev_out(&mut dev, &mut ncm, OUT_EP, &bad);

    assert!(ncm.get_datagram(dev.bus()).is_none());
    // Reception restarted into the same slot
    assert_eq!(
        dev.bus()
            .port()
            .receives
            .iter()
            .filter(|(a, _)| *a == OUT_EP)
            .count(),
        2
    );
}

#[test]
fn block_length_mismatch_is_dropped() {
    let mut ncm = Ncm::new(config());
    let mut dev = device();
    bring_up(&mut dev, &mut ncm);
    connect(&mut dev, &mut ncm);

    let mut bad = build_ntb(0, &[&[0xCC; 64]]);
    bad[8] = bad[8].wrapping_add(4); // wBlockLength lies
    ev_out(&mut dev, &mut ncm, OUT_EP, &bad);
    assert!(ncm.get_datagram(dev.bus()).is_none());
}

#[test]
fn double_buffering_defers_until_a_slot_drains() {
    let mut ncm = Ncm::new(config());
    let mut dev = device();
    bring_up(&mut dev, &mut ncm);
    connect(&mut dev, &mut ncm);

    // Fill both receive slots
    ev_out(&mut dev, &mut ncm, OUT_EP, &build_ntb(0, &[&[1; 16]]));
    ev_out(&mut dev, &mut ncm, OUT_EP, &build_ntb(2, &[&[2; 16]]));

    // Both slots busy: no third reception armed yet
    let armed = dev
        .bus()
        .port()
        .receives
        .iter()
        .filter(|(a, _)| *a == OUT_EP)
        .count();
    assert_eq!(armed, 2);

    // Draining the first slot publishes the second and re-arms
    assert_eq!(ncm.get_datagram(dev.bus()).unwrap(), &[1u8; 16][..]);
    assert!(ncm.get_datagram(dev.bus()).unwrap() == &[2u8; 16][..]);
    let armed = dev
        .bus()
        .port()
        .receives
        .iter()
        .filter(|(a, _)| *a == OUT_EP)
        .count();
    assert_eq!(armed, 3);
}

#[test]
fn disconnect_notifies_and_closes_data_endpoints() {
    let mut ncm = Ncm::new(config());
    let mut dev = device();
    bring_up(&mut dev, &mut ncm);
    connect(&mut dev, &mut ncm);

    ncm.disconnect(dev.bus()).unwrap();
    assert!(!ncm.is_connected());

    let notify = dev
        .bus()
        .port()
        .last_send_on(NOTIFY_EP)
        .unwrap()
        .to_vec();
    assert_eq!(notify.len(), 8);
    assert_eq!(notify[1], 0x00);
    assert_eq!(u16::from_le_bytes([notify[2], notify[3]]), 0);

    assert!(dev.bus().port().closed.contains(&IN_EP));
    assert!(dev.bus().port().closed.contains(&OUT_EP));

    // Frames are refused while the link is down
    assert!(ncm.alloc_datagram(64).is_none());
}

#[test]
fn mac_address_string_is_hex_digits() {
    let mut ncm = Ncm::new(config());
    let mut dev = device();
    bring_up(&mut dev, &mut ncm);

    // iMACAddress = interface string 1 of the function at interface 0
    ev_setup(
        &mut dev,
        &mut ncm,
        SetupPacket {
            bmRequestType: DEVICE_TO_HOST,
            bRequest: GET_DESCRIPTOR,
            wValue: 0x0311,
            wIndex: 0x0409,
            wLength: 255,
        },
    );
    let s = dev
        .bus()
        .port()
        .last_send_on(EpAddress::CONTROL_IN)
        .unwrap()
        .to_vec();
    assert_eq!(s.len(), 2 + 12 * 2);
    assert_eq!(&s[2..6], &[b'0', 0, b'2', 0]);
}
