use super::*;
use crate::{Cbw, Csw, CswStatus, InquiryData};

#[test]
fn cbw_parses_little_endian_fields() {
    // The READ(10) wrapper from the MSC BOT spec example
    let raw: [u8; 30] = [
        0x55, 0x53, 0x42, 0x43, // "USBC"
        0x78, 0x56, 0x34, 0x12, // tag
        0x00, 0x02, 0x00, 0x00, // 512 bytes
        0x80, // data in
        0x00, // LUN 0
        0x0A, // 10-byte command block
        0x28, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
    ];
    let cbw = Cbw::parse(&raw);
    assert_eq!(cbw.signature, Cbw::SIGNATURE);
    assert_eq!(cbw.tag, 0x1234_5678);
    assert_eq!(cbw.data_length, 512);
    assert!(cbw.is_data_in());
    assert_eq!(cbw.lun, 0);
    assert_eq!(cbw.cb_len, 10);
    assert_eq!(cbw.cb[0], 0x28);
    assert_eq!(u16::from_be_bytes([cbw.cb[7], cbw.cb[8]]), 1);
}

#[test]
fn cbw_tolerates_short_packets() {
    let cbw = Cbw::parse(&[0x55, 0x53]);
    assert_ne!(cbw.signature, Cbw::SIGNATURE);
    assert_eq!(cbw.cb_len, 0);
}

#[test]
fn csw_serializes_to_thirteen_bytes() {
    let csw = Csw {
        tag: 0xAABBCCDD,
        residue: 0x100,
        status: CswStatus::Failed,
    };
    let raw = csw.to_bytes();
    assert_eq!(&raw[0..4], &[0x55, 0x53, 0x42, 0x53]); // "USBS"
    assert_eq!(u32::from_le_bytes(raw[4..8].try_into().unwrap()), 0xAABBCCDD);
    assert_eq!(u32::from_le_bytes(raw[8..12].try_into().unwrap()), 0x100);
    assert_eq!(raw[12], 1);
}

#[test]
fn inquiry_data_pads_with_spaces() {
    let inquiry = InquiryData {
        vendor_id: "AB",
        product_id: "DISK",
        revision: "1",
        removable: true,
    };
    let data = inquiry.to_bytes();
    assert_eq!(data[1], 0x80);
    assert_eq!(data[4], 32);
    assert_eq!(&data[8..16], b"AB      ");
    assert_eq!(&data[16..20], b"DISK");
    assert!(data[20..32].iter().all(|b| *b == b' '));
    assert_eq!(&data[32..36], b"1   ");
}

#[test]
fn sense_defaults_to_no_sense() {
    let sense = ScsiSense::default();
    assert_eq!(sense.key, SenseKey::NoSense);
    assert_eq!(sense.additional, AdditionalSense::None);
}
