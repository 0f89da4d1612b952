// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dataplane contributors
//
// Scaled-port bridge tests: cyclic fan-out, broadcast with back-off,
// directed and hashed routing, fan-in collection, and setup-time
// rejection of unsupported distribution pairs.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use dataplane::bridge::{Distribution, OpDef, PortMeta, ScaledPort};
use dataplane::{Connection, Params, Port};

fn attach_all(
    sp: &mut ScaledPort,
    members: &mut [Port],
    out_meta: &PortMeta,
    in_meta: &PortMeta,
    out_scale: usize,
    in_scale: usize,
) {
    for (i, m) in members.iter_mut().enumerate() {
        let mut c = Connection::new(4096);
        if sp.crew_size() == in_scale {
            // Output side scaled against an input crew.
            c.output.scale = out_scale;
            c.input.scale = in_scale;
            c.input.index = i;
        } else {
            // Input side scaled against an output crew.
            c.output.scale = out_scale;
            c.output.index = i;
            c.input.scale = in_scale;
        }
        sp.attach_in_process(i, m, &mut c, out_meta, in_meta).unwrap();
    }
    assert!(sp.fully_connected());
}

// --- scenario: 1 output, 4 inputs, cyclic ---

#[test]
fn cyclic_fan_out_delivers_two_per_input_in_order() {
    let params = Params::new().with_buffer_count(2);
    let mut sp = ScaledPort::new_output("dist", 4, &params);
    let mut members: Vec<Port> = (0..4)
        .map(|i| Port::new_input(&format!("m{i}"), &params))
        .collect();
    let out_meta = PortMeta::single("dist", Distribution::Cyclic);
    let in_meta = PortMeta::single("member", Distribution::Cyclic);
    attach_all(&mut sp, &mut members, &out_meta, &in_meta, 1, 4);

    for k in 0..8u8 {
        let data = sp.worker().get_buffer().unwrap().expect("slot free");
        data[0] = k;
        sp.worker().put(1, 0, false, 0).unwrap();
        sp.run_bridge().unwrap();
    }

    for (i, m) in members.iter_mut().enumerate() {
        for expect in [i as u8, i as u8 + 4] {
            let (h, body) = m.get_full().unwrap().expect("two messages per member");
            assert_eq!(h.length, 1);
            assert_eq!(body[0], expect, "member {i} out of order");
            m.release().unwrap();
        }
        assert!(m.get_full().unwrap().is_none(), "member {i} got extra messages");
    }
}

// --- broadcast with back-off ---

#[test]
fn all_mode_replicates_and_backs_off_without_releasing() {
    let params = Params::new().with_buffer_count(1);
    let mut sp = ScaledPort::new_output("bcast", 3, &params);
    let mut members: Vec<Port> = (0..3)
        .map(|i| Port::new_input(&format!("m{i}"), &params))
        .collect();
    let out_meta = PortMeta::single("bcast", Distribution::All);
    let in_meta = PortMeta::single("member", Distribution::All);
    attach_all(&mut sp, &mut members, &out_meta, &in_meta, 1, 3);

    // First message reaches every member.
    sp.worker().get_buffer().unwrap().unwrap()[0] = 1;
    sp.worker().put(1, 0, false, 0).unwrap();
    sp.run_bridge().unwrap();
    for m in members.iter_mut() {
        let (_, body) = m.get_full().unwrap().expect("replica expected");
        assert_eq!(body[0], 1);
        // Deliberately not released yet.
    }

    // Second message cannot replicate anywhere; the local buffer stays
    // held, so the single-slot worker ring stays full.
    sp.worker().get_buffer().unwrap().unwrap()[0] = 2;
    sp.worker().put(1, 0, false, 0).unwrap();
    sp.run_bridge().unwrap();
    assert!(sp.worker().get_buffer().unwrap().is_none(), "local buffer still held");

    // Free members one at a time; replication resumes where it stopped.
    members[0].release().unwrap();
    sp.run_bridge().unwrap();
    assert!(sp.worker().get_buffer().unwrap().is_none());

    members[1].release().unwrap();
    members[2].release().unwrap();
    sp.run_bridge().unwrap();
    assert!(
        sp.worker().get_buffer().unwrap().is_some(),
        "local buffer released after full replication"
    );

    for (i, m) in members.iter_mut().enumerate() {
        let (_, body) = m.get_full().unwrap().unwrap_or_else(|| panic!("member {i} missed the retry"));
        assert_eq!(body[0], 2);
        m.release().unwrap();
    }
}

// --- directed routing ---

#[test]
fn directed_routing_follows_the_header_hint() {
    let params = Params::new().with_buffer_count(2);
    let mut sp = ScaledPort::new_output("route", 3, &params);
    let mut members: Vec<Port> = (0..3)
        .map(|i| Port::new_input(&format!("m{i}"), &params))
        .collect();
    let out_meta = PortMeta::single("route", Distribution::Directed);
    let in_meta = PortMeta::single("member", Distribution::Cyclic);
    attach_all(&mut sp, &mut members, &out_meta, &in_meta, 1, 3);

    for target in [2u8, 0, 1] {
        sp.worker().get_buffer().unwrap().unwrap()[0] = target;
        sp.worker().put(1, 0, false, target).unwrap();
        sp.run_bridge().unwrap();
    }
    for (i, m) in members.iter_mut().enumerate() {
        let (h, body) = m.get_full().unwrap().expect("one directed message");
        assert_eq!(h.direct as usize, i);
        assert_eq!(body[0], i as u8);
        m.release().unwrap();
        assert!(m.get_full().unwrap().is_none());
    }
}

// --- hashed routing ---

#[test]
fn hashed_routing_is_deterministic_on_the_field() {
    let params = Params::new().with_buffer_count(2);
    let mut sp = ScaledPort::new_output("shard", 4, &params);
    let mut members: Vec<Port> = (0..4)
        .map(|i| Port::new_input(&format!("m{i}"), &params))
        .collect();
    let out_meta = PortMeta::single("shard", Distribution::Cyclic);
    let mut in_meta = PortMeta::single("member", Distribution::Hashed);
    in_meta.ops[0].hash_field = Some((0, 1));
    attach_all(&mut sp, &mut members, &out_meta, &in_meta, 1, 4);

    let expected_member = |b: u8| {
        let mut h = DefaultHasher::new();
        h.write(&[b]);
        (h.finish() % 4) as usize
    };

    for b in [7u8, 7, 9] {
        sp.worker().get_buffer().unwrap().unwrap()[0] = b;
        sp.worker().put(1, 0, false, 0).unwrap();
        sp.run_bridge().unwrap();
    }
    // Equal keys land on the same member, in order.
    let m7 = expected_member(7);
    for _ in 0..2 {
        let (_, body) = members[m7].get_full().unwrap().expect("hashed target");
        assert_eq!(body[0], 7);
        members[m7].release().unwrap();
    }
    let m9 = expected_member(9);
    if m9 != m7 {
        let (_, body) = members[m9].get_full().unwrap().unwrap();
        assert_eq!(body[0], 9);
        members[m9].release().unwrap();
    }
}

// --- fan-in collection ---

#[test]
fn cyclic_fan_in_collects_in_member_order() {
    let params = Params::new().with_buffer_count(2);
    let mut sp = ScaledPort::new_input("gather", 2, &params);
    let mut members: Vec<Port> = (0..2)
        .map(|i| Port::new_output(&format!("w{i}"), &params))
        .collect();
    let out_meta = PortMeta::single("worker", Distribution::Cyclic);
    let in_meta = PortMeta::single("gather", Distribution::Cyclic);
    attach_all(&mut sp, &mut members, &out_meta, &in_meta, 2, 1);

    // Each member sends two messages tagged with its index.
    for (i, m) in members.iter_mut().enumerate() {
        for seq in 0..2u8 {
            m.get_buffer().unwrap().unwrap()[0] = (i as u8) * 10 + seq;
            m.put(1, 0, false, 0).unwrap();
        }
    }
    sp.run_bridge().unwrap();

    // Collection alternates member 0, 1, 0, 1.
    for expect in [0u8, 10, 1, 11] {
        let (_, body) = sp.worker().get_full().unwrap().expect("collected message");
        assert_eq!(body[0], expect);
        sp.worker().release().unwrap();
        sp.run_bridge().unwrap();
    }
    assert!(sp.worker().get_full().unwrap().is_none());
}

// --- configuration errors ---

#[test]
fn unsupported_distribution_pairs_fail_at_setup() {
    let params = Params::new();
    for (out_d, in_d) in [
        (Distribution::Balanced, Distribution::Cyclic),
        (Distribution::Hashed, Distribution::All),
        (Distribution::Cyclic, Distribution::Directed),
    ] {
        let mut sp = ScaledPort::new_output("bad", 2, &params);
        let mut member = Port::new_input("m0", &params);
        let mut c = Connection::new(4096);
        c.output.scale = 1;
        c.input.scale = 2;
        let out_meta = PortMeta {
            name: "bad".to_string(),
            ops: vec![OpDef::new(out_d)],
        };
        let in_meta = PortMeta {
            name: "m".to_string(),
            ops: vec![OpDef::new(in_d)],
        };
        assert!(
            sp.attach_in_process(0, &mut member, &mut c, &out_meta, &in_meta)
                .is_err(),
            "({out_d:?},{in_d:?}) should be rejected"
        );
    }
}
