use super::*;
use crate::types::EpAddress;

#[test]
fn table_addressing_is_per_direction() {
    let mut table = EndpointTable::new();
    table.get_mut(EpAddress::new_in(3)).max_packet = 512;
    assert_eq!(table.get(EpAddress::new_in(3)).max_packet, 512);
    assert_eq!(table.get(EpAddress::new_out(3)).max_packet, 0);
    assert!(table.get(EpAddress::new_in(3)).is_claimed());
    assert!(!table.get(EpAddress::new_out(3)).is_claimed());
}

#[test]
fn endpoints_start_closed() {
    let table = EndpointTable::new();
    assert_eq!(table.get(EpAddress::new_in(1)).state, EpState::Closed);
    assert_eq!(table.get(EpAddress::new_out(15)).state, EpState::Closed);
}

#[test]
fn reset_claims_spares_ep0() {
    let mut table = EndpointTable::new();
    table.get_mut(EpAddress::CONTROL_IN).max_packet = 64;
    table.get_mut(EpAddress::new_in(2)).max_packet = 512;
    table.reset_claims();
    assert_eq!(table.get(EpAddress::CONTROL_IN).max_packet, 64);
    assert!(!table.get(EpAddress::new_in(2)).is_claimed());
}

#[test]
fn data_endpoints_iterates_both_directions() {
    let mut table = EndpointTable::new();
    let count = table.data_endpoints_mut().count();
    assert_eq!(count, 2 * (crate::MAX_EP_COUNT - 1));
}
