use super::*;
use crate::device::UsbDevice;
use crate::function::UsbFunction;
use crate::mocks::{LoopbackFunction, RecordingPort};
use crate::types::DeviceDescription;
use crate::wire::{DEVICE_TO_HOST, GET_DESCRIPTOR, HOST_TO_DEVICE};

fn description() -> DeviceDescription<'static> {
    DeviceDescription {
        vendor_name: "ACME",
        vendor_id: 0x1234,
        product_name: "Widget",
        product_id: 0x5678,
        serial_number: SerialNumber::Bcd(&[0xDE, 0xAD]),
        config_name: "Default",
        max_current_ma: 100,
        ..Default::default()
    }
}

fn get_descriptor_setup(value: u16, length: u16) -> crate::wire::SetupPacket {
    crate::wire::SetupPacket {
        bmRequestType: DEVICE_TO_HOST,
        bRequest: GET_DESCRIPTOR,
        wValue: value,
        wIndex: 0,
        wLength: length,
    }
}

fn device_with(
    description: DeviceDescription<'static>,
) -> (UsbDevice<'static, RecordingPort>, LoopbackFunction) {
    let mut f = LoopbackFunction::new();
    let mut dev = UsbDevice::new(RecordingPort::new(), description);
    {
        let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] = [&mut f];
        dev.mount(&mut funcs).unwrap();
        dev.handle_reset(&mut funcs, UsbSpeed::Full12);
    }
    (dev, f)
}

fn fetch(
    dev: &mut UsbDevice<'static, RecordingPort>,
    f: &mut LoopbackFunction,
    value: u16,
) -> Option<Vec<u8>> {
    let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] = [f];
    dev.handle_setup(&mut funcs, get_descriptor_setup(value, 512));
    dev.bus()
        .port()
        .last_send_on(EpAddress::CONTROL_IN)
        .map(|d| d.to_vec())
}

#[test]
fn configuration_descriptor_concatenates_functions() {
    let (mut dev, mut f) = device_with(description());
    let cfg = fetch(&mut dev, &mut f, 0x0200).unwrap();

    // Header + interface + two endpoint descriptors
    assert_eq!(cfg.len(), 9 + 9 + 7 + 7);
    assert_eq!(cfg[0], 9);
    assert_eq!(cfg[1], 2);
    assert_eq!(u16::from_le_bytes([cfg[2], cfg[3]]), cfg.len() as u16);
    assert_eq!(cfg[4], 1); // bNumInterfaces
    assert_eq!(cfg[5], 1); // bConfigurationValue
    assert_eq!(cfg[6], ISTR_CONFIG);
    assert_eq!(cfg[7], 0x80); // bus powered, no remote wakeup
    assert_eq!(cfg[8], 50); // 100 mA / 2

    // Interface descriptor got the assigned interface number
    assert_eq!(cfg[9], 9);
    assert_eq!(cfg[10], 4);
    assert_eq!(cfg[11], 0);

    // Bulk endpoints clamp to 64 at Full Speed
    assert_eq!(u16::from_le_bytes([cfg[22], cfg[23]]), 64);
    assert_eq!(u16::from_le_bytes([cfg[29], cfg[30]]), 64);
}

#[test]
fn configuration_attributes_reflect_power_settings() {
    let (mut dev, mut f) = device_with(DeviceDescription {
        self_powered: true,
        remote_wakeup: true,
        max_current_ma: 500,
        ..description()
    });
    let cfg = fetch(&mut dev, &mut f, 0x0200).unwrap();
    assert_eq!(cfg[7], 0x80 | 0x40 | 0x20);
    assert_eq!(cfg[8], 250);
}

#[test]
fn truncated_configuration_request_is_honored() {
    // The standard 9-byte probe before the full read
    let (mut dev, mut f) = device_with(description());
    let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] = [&mut f];
    dev.handle_setup(&mut funcs, get_descriptor_setup(0x0200, 9));
    let reply = dev
        .bus()
        .port()
        .last_send_on(EpAddress::CONTROL_IN)
        .unwrap();
    assert_eq!(reply.len(), 9);
    // wTotalLength still advertises the full descriptor
    assert_eq!(u16::from_le_bytes([reply[2], reply[3]]), 32);
}

#[test]
fn string_descriptors() {
    let (mut dev, mut f) = device_with(description());

    let langid = fetch(&mut dev, &mut f, 0x0300).unwrap();
    assert_eq!(langid, vec![4, 3, 0x09, 0x04]);

    let vendor = fetch(&mut dev, &mut f, 0x0300 | ISTR_VENDOR as u16);
    assert_eq!(
        vendor.unwrap(),
        vec![10, 3, b'A', 0, b'C', 0, b'M', 0, b'E', 0]
    );

    let serial = fetch(&mut dev, &mut f, 0x0300 | ISTR_SERIAL as u16);
    assert_eq!(
        serial.unwrap(),
        vec![10, 3, b'D', 0, b'E', 0, b'A', 0, b'D', 0]
    );

    // Index 0x01: first interface, string 0 -> the function's name
    let if_string = fetch(&mut dev, &mut f, 0x0301).unwrap();
    assert_eq!(if_string[0] as usize, if_string.len());
    assert_eq!(&if_string[2..4], &[b'L', 0]);
}

#[test]
fn unknown_string_index_stalls() {
    let (mut dev, mut f) = device_with(description());
    let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] = [&mut f];
    dev.handle_setup(&mut funcs, get_descriptor_setup(0x0307, 255));
    assert!(dev.bus().port().is_stalled(EpAddress::CONTROL_IN));
}

#[test]
fn qualifier_only_when_high_speed() {
    let (mut dev, mut f) = device_with(DeviceDescription {
        high_speed_capable: true,
        ..description()
    });

    // At Full Speed the request stalls
    {
        let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] = [&mut f];
        dev.handle_setup(&mut funcs, get_descriptor_setup(0x0600, 10));
        assert!(dev.bus().port().is_stalled(EpAddress::CONTROL_IN));
    }

    {
        let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] = [&mut f];
        dev.handle_reset(&mut funcs, UsbSpeed::High480);
    }
    let qualifier = fetch(&mut dev, &mut f, 0x0600).unwrap();
    assert_eq!(qualifier.len(), 10);
    assert_eq!(qualifier[1], 6);
    assert_eq!(qualifier[8], 1);
}

#[test]
fn other_speed_configuration_swaps_packet_sizes() {
    let (mut dev, mut f) = device_with(DeviceDescription {
        high_speed_capable: true,
        ..description()
    });
    {
        let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] = [&mut f];
        dev.handle_reset(&mut funcs, UsbSpeed::High480);
    }

    // Running at High Speed, the normal configuration uses 512
    let cfg = fetch(&mut dev, &mut f, 0x0200).unwrap();
    assert_eq!(u16::from_le_bytes([cfg[22], cfg[23]]), 512);

    // The other-speed variant describes the Full Speed fallback
    let other = fetch(&mut dev, &mut f, 0x0700).unwrap();
    assert_eq!(other[1], 7);
    assert_eq!(u16::from_le_bytes([other[22], other[23]]), 64);
}

#[test]
fn bos_descriptor_with_lpm() {
    let (mut dev, mut f) = device_with(DeviceDescription {
        lpm: true,
        ..description()
    });
    let bos = fetch(&mut dev, &mut f, 0x0F00).unwrap();
    assert_eq!(bos.len(), 12);
    assert_eq!(bos[1], 0x0F);
    assert_eq!(u16::from_le_bytes([bos[2], bos[3]]), 12);
    assert_eq!(bos[4], 1); // one capability
    assert_eq!(bos[7], 0x02); // USB 2.0 extension
    assert_eq!(bos[8] & 0x06, 0x06); // LPM + BESL

    // With a BOS present the device reports USB 2.1
    let device = fetch(&mut dev, &mut f, 0x0100).unwrap();
    assert_eq!(u16::from_le_bytes([device[2], device[3]]), 0x0201);
}

#[test]
fn bos_descriptor_absent_without_capabilities() {
    let (mut dev, mut f) = device_with(description());
    let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] = [&mut f];
    dev.handle_setup(&mut funcs, get_descriptor_setup(0x0F00, 255));
    assert!(dev.bus().port().is_stalled(EpAddress::CONTROL_IN));
}

#[test]
fn set_configuration_beyond_range_stalls() {
    let (mut dev, mut f) = device_with(description());
    let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] = [&mut f];
    dev.handle_setup(
        &mut funcs,
        crate::wire::SetupPacket {
            bmRequestType: HOST_TO_DEVICE,
            bRequest: crate::wire::SET_CONFIGURATION,
            wValue: 2,
            wIndex: 0,
            wLength: 0,
        },
    );
    assert!(dev.bus().port().is_stalled(EpAddress::CONTROL_IN));
}
