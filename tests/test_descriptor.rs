// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dataplane contributors
//
// Wire-codec tests for the port descriptor: round-trips in both byte
// orders, and hard failures on every malformed input.

use dataplane::descriptor::{Descriptor, DescriptorKind, WireOrder};
use dataplane::role::PortRole;

fn sample() -> Descriptor {
    let mut d = Descriptor::new(DescriptorKind::Consumer);
    d.role = PortRole::ActiveFlowControl;
    d.options = 0x2a;
    d.n_buffers = 4;
    d.data_buffer_base = 0x1000;
    d.data_buffer_pitch = 4096;
    d.data_buffer_size = 4096;
    d.metadata_base = 0x5000;
    d.metadata_pitch = 8;
    d.full_flag_base = 0x5100;
    d.full_flag_size = 8;
    d.full_flag_pitch = 8;
    d.full_flag_value = 1;
    d.empty_flag_base = 0x5200;
    d.empty_flag_size = 8;
    d.empty_flag_pitch = 8;
    d.empty_flag_value = 42;
    d.oob.port_id = 7;
    d.oob.oep = "mem:p1234.0;1048576.2.16".to_string();
    d.oob.cookie = 0xdead_beef;
    d.oob.address = 0x7fff_0000;
    d
}

#[test]
fn round_trip_native_order() {
    let d = sample();
    let bytes = d.encode();
    assert_eq!(Descriptor::decode(&bytes).unwrap(), d);
}

#[test]
fn round_trip_foreign_order() {
    let d = sample();
    for order in [WireOrder::Little, WireOrder::Big] {
        let bytes = d.encode_in(order);
        assert_eq!(Descriptor::decode(&bytes).unwrap(), d, "order {order:?}");
    }
}

#[test]
fn round_trip_producer_kind() {
    let mut d = sample();
    d.kind = DescriptorKind::Producer;
    d.role = PortRole::ActiveMessage;
    let bytes = d.encode();
    assert_eq!(Descriptor::decode(&bytes).unwrap(), d);
}

#[test]
fn empty_endpoint_name_survives() {
    let mut d = sample();
    d.oob.oep.clear();
    let bytes = d.encode();
    assert_eq!(Descriptor::decode(&bytes).unwrap(), d);
}

#[test]
fn every_truncation_fails() {
    let bytes = sample().encode();
    for len in 0..bytes.len() {
        assert!(
            Descriptor::decode(&bytes[..len]).is_err(),
            "prefix of {len} bytes decoded"
        );
    }
}

#[test]
fn wrong_length_prefix_fails() {
    let mut bytes = sample().encode();
    bytes.push(0); // record longer than its declared length
    assert!(Descriptor::decode(&bytes).is_err());
}

#[test]
fn bad_byte_order_tag_fails() {
    let mut bytes = sample().encode();
    bytes[4] = 7;
    assert!(Descriptor::decode(&bytes).is_err());
}

#[test]
fn bad_role_fails() {
    let mut d = sample();
    d.role = PortRole::NoRole; // legal on the wire
    let good = d.encode();
    assert_eq!(Descriptor::decode(&good).unwrap().role, PortRole::NoRole);

    // An out-of-range role value is not.
    let mut bytes = sample().encode();
    // role is the third u32 field (length, tag+pad, kind, role).
    let role_off = 12;
    bytes[role_off..role_off + 4].copy_from_slice(&99i32.to_ne_bytes());
    assert!(Descriptor::decode(&bytes).is_err());
}

#[test]
fn oversized_name_fails() {
    let mut d = sample();
    d.oob.oep = "x".repeat(300);
    let bytes = d.encode();
    assert!(Descriptor::decode(&bytes).is_err());
}

#[test]
fn decode_failure_is_total() {
    // A failed decode never yields a partial object; decoding the same
    // buffer after repair works.
    let d = sample();
    let good = d.encode();
    let mut bad = good.clone();
    bad.truncate(good.len() - 4);
    assert!(Descriptor::decode(&bad).is_err());
    assert_eq!(Descriptor::decode(&good).unwrap(), d);
}
