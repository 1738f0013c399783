use super::*;
use skua_usb_device::device::UsbDevice;
use skua_usb_device::mocks::RecordingPort;
use skua_usb_device::types::DeviceDescription;
use skua_usb_device::wire::{
    SetupPacket, DEVICE_TO_HOST, HOST_TO_DEVICE, RECIPIENT_INTERFACE,
    SET_CONFIGURATION,
};

const IN_EP: EpAddress = EpAddress::new_in(1);
const OUT_EP: EpAddress = EpAddress::new_out(1);

// A boot keyboard report descriptor (shortened)
const REPORT_DESCRIPTOR: &[u8] = &[
    0x05, 0x01, 0x09, 0x06, 0xA1, 0x01, 0x05, 0x07, 0x19, 0xE0, 0x29,
    0xE7, 0x15, 0x00, 0x25, 0x01, 0x75, 0x01, 0x95, 0x08, 0x81, 0x02,
    0x95, 0x06, 0x75, 0x08, 0x81, 0x00, 0xC0,
];

#[derive(Default)]
struct KeyboardApp {
    input_report: [u8; 8],
    set_reports: Vec<(ReportKind, u8, Vec<u8>)>,
    idles: Vec<(u16, u8)>,
    protocols: Vec<bool>,
    sent: Vec<usize>,
}

impl HidApplication for KeyboardApp {
    fn get_report(
        &mut self,
        kind: ReportKind,
        _id: u8,
        buf: &mut [u8],
    ) -> usize {
        if kind == ReportKind::Input {
            buf[..8].copy_from_slice(&self.input_report);
            8
        } else {
            0
        }
    }

    fn set_report(&mut self, kind: ReportKind, id: u8, data: &[u8]) {
        self.set_reports.push((kind, id, data.to_vec()));
    }

    fn set_idle(&mut self, idle_ms: u16, report_id: u8) {
        self.idles.push((idle_ms, report_id));
    }

    fn set_protocol(&mut self, boot: bool) {
        self.protocols.push(boot);
    }

    fn report_sent(&mut self, len: usize) {
        self.sent.push(len);
    }
}

fn config() -> HidConfig {
    HidConfig {
        in_ep: IN_EP,
        out_ep: Some(OUT_EP),
        boot: BootProtocol::Keyboard,
        name: "Skua Keyboard",
    }
}

fn report_config() -> HidReportConfig {
    HidReportConfig {
        descriptor: REPORT_DESCRIPTOR,
        input_max: 8,
        input_interval_ms: 10,
        output_max: 1,
        feature_max: 0,
    }
}

fn bring_up(dev: &mut UsbDevice<'_, RecordingPort>, hid: &mut Hid<'_>) {
    let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] = [hid];
    dev.mount(&mut funcs).unwrap();
    dev.handle_reset(&mut funcs, UsbSpeed::Full12);
    dev.handle_setup(
        &mut funcs,
        SetupPacket {
            bmRequestType: HOST_TO_DEVICE,
            bRequest: SET_CONFIGURATION,
            wValue: 1,
            wIndex: 0,
            wLength: 0,
        },
    );
    dev.handle_ep_in(&mut funcs, EpAddress::CONTROL_IN);
}

fn class_request(
    bm_request_type: u8,
    request: u8,
    value: u16,
    length: u16,
) -> SetupPacket {
    SetupPacket {
        bmRequestType: bm_request_type | 0x20 | RECIPIENT_INTERFACE,
        bRequest: request,
        wValue: value,
        wIndex: 0,
        wLength: length,
    }
}

#[test]
fn descriptor_includes_hid_class_descriptor() {
    let mut app = KeyboardApp::default();
    let mut hid = Hid::new(config(), report_config(), &mut app);
    let mut dev =
        UsbDevice::new(RecordingPort::new(), DeviceDescription::default());
    bring_up(&mut dev, &mut hid);

    let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] = [&mut hid];
    dev.handle_setup(
        &mut funcs,
        SetupPacket {
            bmRequestType: DEVICE_TO_HOST,
            bRequest: skua_usb_device::wire::GET_DESCRIPTOR,
            wValue: 0x0200,
            wIndex: 0,
            wLength: 255,
        },
    );
    let cfg = dev
        .bus()
        .port()
        .last_send_on(EpAddress::CONTROL_IN)
        .unwrap()
        .to_vec();

    // config + interface + HID descriptor + 2 interrupt endpoints
    assert_eq!(cfg.len(), 9 + 9 + 9 + 7 + 7);
    assert_eq!(cfg[9 + 5], 0x03); // HID class
    assert_eq!(cfg[9 + 6], 0x01); // boot subclass
    assert_eq!(cfg[9 + 7], 0x01); // keyboard

    // The HID descriptor advertises the report descriptor length
    let hid_at = 18;
    assert_eq!(cfg[hid_at], 9);
    assert_eq!(cfg[hid_at + 1], 0x21);
    assert_eq!(
        u16::from_le_bytes([cfg[hid_at + 7], cfg[hid_at + 8]]),
        REPORT_DESCRIPTOR.len() as u16
    );
}

#[test]
fn report_descriptor_is_served_on_ep0() {
    let mut app = KeyboardApp::default();
    let mut hid = Hid::new(config(), report_config(), &mut app);
    let mut dev =
        UsbDevice::new(RecordingPort::new(), DeviceDescription::default());
    bring_up(&mut dev, &mut hid);

    // Standard GET_DESCRIPTOR with interface recipient
    let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] = [&mut hid];
    dev.handle_setup(
        &mut funcs,
        SetupPacket {
            bmRequestType: DEVICE_TO_HOST | RECIPIENT_INTERFACE,
            bRequest: skua_usb_device::wire::GET_DESCRIPTOR,
            wValue: 0x2200,
            wIndex: 0,
            wLength: 255,
        },
    );
    assert_eq!(
        dev.bus().port().last_send_on(EpAddress::CONTROL_IN),
        Some(REPORT_DESCRIPTOR)
    );
}

#[test]
fn get_report_over_ep0() {
    let mut app = KeyboardApp::default();
    app.input_report = [0, 0, 0x04, 0, 0, 0, 0, 0]; // 'a' pressed
    let mut hid = Hid::new(config(), report_config(), &mut app);
    let mut dev =
        UsbDevice::new(RecordingPort::new(), DeviceDescription::default());
    bring_up(&mut dev, &mut hid);

    let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] = [&mut hid];
    dev.handle_setup(
        &mut funcs,
        class_request(DEVICE_TO_HOST, 0x01, 0x0100, 8),
    );
    assert_eq!(
        dev.bus().port().last_send_on(EpAddress::CONTROL_IN),
        Some(&[0, 0, 0x04, 0, 0, 0, 0, 0][..])
    );
}

#[test]
fn unsupported_get_report_stalls() {
    let mut app = KeyboardApp::default();
    let mut hid = Hid::new(config(), report_config(), &mut app);
    let mut dev =
        UsbDevice::new(RecordingPort::new(), DeviceDescription::default());
    bring_up(&mut dev, &mut hid);

    let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] = [&mut hid];
    // Feature report: the application provides none
    dev.handle_setup(
        &mut funcs,
        class_request(DEVICE_TO_HOST, 0x01, 0x0300, 8),
    );
    assert!(dev.bus().port().is_stalled(EpAddress::CONTROL_IN));
}

#[test]
fn set_report_over_ep0() {
    let mut app = KeyboardApp::default();
    let mut hid = Hid::new(config(), report_config(), &mut app);
    let mut dev =
        UsbDevice::new(RecordingPort::new(), DeviceDescription::default());
    bring_up(&mut dev, &mut hid);

    {
        let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] =
            [&mut hid];
        dev.handle_setup(
            &mut funcs,
            class_request(HOST_TO_DEVICE, 0x09, 0x0200, 1),
        );
        // LED state byte
        dev.handle_ep_out(&mut funcs, EpAddress::CONTROL_OUT, &[0x02]);
    }
    assert_eq!(
        app.set_reports,
        vec![(ReportKind::Output, 0, vec![0x02])]
    );
}

#[test]
fn set_report_over_the_interrupt_endpoint() {
    let mut app = KeyboardApp::default();
    let mut hid = Hid::new(config(), report_config(), &mut app);
    let mut dev =
        UsbDevice::new(RecordingPort::new(), DeviceDescription::default());
    bring_up(&mut dev, &mut hid);

    hid.report_out(dev.bus()).unwrap();
    assert_eq!(dev.bus().port().last_receive_on(OUT_EP), Some(1));
    {
        let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] =
            [&mut hid];
        dev.handle_ep_out(&mut funcs, OUT_EP, &[0x01]);
    }
    assert_eq!(
        app.set_reports,
        vec![(ReportKind::Output, 0, vec![0x01])]
    );
}

#[test]
fn set_idle_indefinite() {
    // SET_IDLE with duration 0 for every report
    let mut app = KeyboardApp::default();
    let mut hid = Hid::new(config(), report_config(), &mut app);
    let mut dev =
        UsbDevice::new(RecordingPort::new(), DeviceDescription::default());
    bring_up(&mut dev, &mut hid);

    {
        let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] =
            [&mut hid];
        dev.handle_setup(
            &mut funcs,
            class_request(HOST_TO_DEVICE, 0x0A, 0x0000, 0),
        );
        // Status ZLP answers the request
        assert_eq!(
            dev.bus().port().last_send_on(EpAddress::CONTROL_IN),
            Some(&[][..])
        );

        // GET_IDLE reflects it
        dev.handle_setup(
            &mut funcs,
            class_request(DEVICE_TO_HOST, 0x02, 0, 1),
        );
        assert_eq!(
            dev.bus().port().last_send_on(EpAddress::CONTROL_IN),
            Some(&[0][..])
        );
    }
    assert_eq!(hid.idle_rate_ms(), 0);
    assert_eq!(app.idles, vec![(IDLE_RATE_INDEFINITE, 0)]);
}

#[test]
fn set_idle_with_duration() {
    let mut app = KeyboardApp::default();
    let mut hid = Hid::new(config(), report_config(), &mut app);
    let mut dev =
        UsbDevice::new(RecordingPort::new(), DeviceDescription::default());
    bring_up(&mut dev, &mut hid);

    {
        let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] =
            [&mut hid];
        // Duration 16 ms (4 * 4 ms units)
        dev.handle_setup(
            &mut funcs,
            class_request(HOST_TO_DEVICE, 0x0A, 0x0400, 0),
        );
    }
    assert_eq!(hid.idle_rate_ms(), 16);
    assert_eq!(app.idles, vec![(16, 0)]);
}

#[test]
fn protocol_switching() {
    let mut app = KeyboardApp::default();
    let mut hid = Hid::new(config(), report_config(), &mut app);
    let mut dev =
        UsbDevice::new(RecordingPort::new(), DeviceDescription::default());
    bring_up(&mut dev, &mut hid);

    {
        let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] =
            [&mut hid];
        // Default is report protocol
        dev.handle_setup(
            &mut funcs,
            class_request(DEVICE_TO_HOST, 0x03, 0, 1),
        );
        assert_eq!(
            dev.bus().port().last_send_on(EpAddress::CONTROL_IN),
            Some(&[1][..])
        );

        // Switch to boot protocol
        dev.handle_setup(
            &mut funcs,
            class_request(HOST_TO_DEVICE, 0x0B, 0, 0),
        );
        dev.handle_setup(
            &mut funcs,
            class_request(DEVICE_TO_HOST, 0x03, 0, 1),
        );
        assert_eq!(
            dev.bus().port().last_send_on(EpAddress::CONTROL_IN),
            Some(&[0][..])
        );
    }
    assert_eq!(app.protocols, vec![true]);
}

#[test]
fn input_reports_ride_the_interrupt_endpoint() {
    let mut app = KeyboardApp::default();
    let mut hid = Hid::new(config(), report_config(), &mut app);
    let mut dev =
        UsbDevice::new(RecordingPort::new(), DeviceDescription::default());
    bring_up(&mut dev, &mut hid);

    hid.report_in(dev.bus(), &[0, 0, 0x05, 0, 0, 0, 0, 0]).unwrap();
    assert_eq!(
        dev.bus().port().last_send_on(IN_EP),
        Some(&[0, 0, 0x05, 0, 0, 0, 0, 0][..])
    );

    {
        let mut funcs: [&mut dyn UsbFunction<RecordingPort>; 1] =
            [&mut hid];
        dev.handle_ep_in(&mut funcs, IN_EP);
    }
    assert_eq!(app.sent, vec![8]);
}

#[test]
fn interrupt_endpoint_opened_with_report_size() {
    let mut app = KeyboardApp::default();
    let mut hid = Hid::new(config(), report_config(), &mut app);
    let mut dev =
        UsbDevice::new(RecordingPort::new(), DeviceDescription::default());
    bring_up(&mut dev, &mut hid);

    assert!(dev
        .bus()
        .port()
        .opened
        .iter()
        .any(|(a, k, m)| *a == IN_EP
            && *k == EpKind::Interrupt
            && *m == 8));
}
