// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dataplane contributors
//
// Cross-address-space tests: two Transport instances on one fabric,
// descriptor exchange driven by start_remote/finish_remote, the mailbox
// NewConnection round with a dropped first reply, data flow through the
// copy engine, and the offset/protocol-metadata requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use dataplane::endpoint::EndPoint;
use dataplane::{Connection, Error, Fabric, Params, Port, Transport};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

// --- endpoint strings ---

#[test]
fn endpoint_string_parsing() {
    let p = EndPoint::parse("mem:p100.0;1048576.2.16").unwrap();
    assert_eq!(p.protocol, "mem");
    assert_eq!(p.detail, "p100.0");
    assert_eq!(p.size, 1048576);
    assert_eq!(p.mailbox, 2);
    assert_eq!(p.max_count, 16);

    assert_eq!(
        EndPoint::format_name("mem", "p100.0", 1048576, 2, 16),
        "mem:p100.0;1048576.2.16"
    );

    assert!(EndPoint::parse("no-protocol-here").is_err());
    assert!(EndPoint::parse("mem:noresources").is_err());
    assert!(EndPoint::parse("mem:x;12.3").is_err());
    assert!(EndPoint::parse("mem:x;12.3.4.5").is_err());
    assert!(EndPoint::parse("mem:x;a.b.c").is_err());
}

#[test]
fn unknown_protocol_is_rejected() {
    let fabric = Fabric::new();
    assert!(Transport::new(&fabric, Some("pcie:dev0;4096.1.4")).is_err());
}

// --- full remote handshake + data ---

#[test]
fn remote_handshake_moves_data_after_dispatch() {
    let _ = env_logger::builder().is_test(true).try_init();
    let fabric = Fabric::new();
    let mut t_in = Transport::new(&fabric, None).unwrap();
    let t_out = Transport::new(&fabric, None).unwrap();

    let params = Params::new().with_buffer_count(2);
    let mut inp = Port::new_input("rx", &params);
    let mut out = Port::new_output("tx", &params);
    out.set_request_timeout(Duration::from_secs(5));
    out.set_protocol_info(b"stream-v1".to_vec());

    let c = Arc::new(Mutex::new(Connection::new(4096)));
    {
        let mut g = c.lock().unwrap();
        assert!(inp.start_remote(&mut g, &mut t_in).unwrap());
        assert!(!g.input.done);
        assert!(!g.input.initial_info.is_empty());
    }

    let sent_all = Arc::new(AtomicBool::new(false));
    let client = {
        let c = Arc::clone(&c);
        let sent_all = Arc::clone(&sent_all);
        let mut t_out = t_out;
        thread::spawn(move || {
            loop {
                let mut g = c.lock().unwrap();
                if g.output.done {
                    break;
                }
                out.start_remote(&mut g, &mut t_out).unwrap();
                drop(g);
                thread::sleep(ms(1));
            }
            let mut sent = 0u8;
            while sent < 3 {
                match out.get_buffer().unwrap() {
                    Some(data) => {
                        data[0] = sent;
                        out.put(1, sent, sent == 2, 0).unwrap();
                        sent += 1;
                    }
                    None => {
                        t_out.dispatch();
                        thread::sleep(ms(1));
                    }
                }
            }
            sent_all.store(true, Ordering::Release);
            (out, t_out)
        })
    };

    let mut in_done = false;
    let mut received = 0u8;
    let deadline = Instant::now() + Duration::from_secs(20);
    while received < 3 {
        assert!(Instant::now() < deadline, "remote exchange stalled");
        t_in.dispatch();
        if !in_done {
            if let Ok(mut g) = c.try_lock() {
                if g.input.done || !inp.finish_remote(&mut g, &mut t_in).unwrap() {
                    in_done = true;
                }
            }
            continue;
        }
        if let Some((h, body)) = inp.get_full().unwrap() {
            assert_eq!(h.op_code, received);
            assert_eq!(body, &[received]);
            assert_eq!(h.end, received == 2);
            inp.release().unwrap();
            received += 1;
        }
    }
    let (out, _t_out) = client.join().unwrap();

    // The server created its half of the circuit under the client's id
    // and allocated space for the announced protocol blob.
    let cid = out.circuit_id().unwrap();
    let circuit = t_in.circuit(cid).expect("server should know the circuit");
    let (psize, _poff) = circuit.protocol.expect("protocol space allocated");
    assert_eq!(psize, b"stream-v1".len() as u32);
}

// --- scenario: dropped first reply, retried request ---

#[test]
fn retried_request_after_dropped_reply_makes_one_circuit() {
    let fabric = Fabric::new();
    let mut t_in = Transport::new(&fabric, None).unwrap();
    let mut t_out = Transport::new(&fabric, None).unwrap();

    let params = Params::new().with_buffer_count(2);
    let mut inp = Port::new_input("rx", &params);
    let mut out = Port::new_output("tx", &params);
    out.set_request_timeout(ms(50));

    let c = Arc::new(Mutex::new(Connection::new(4096)));
    {
        let mut g = c.lock().unwrap();
        inp.start_remote(&mut g, &mut t_in).unwrap();
    }

    // First attempt: the server never polls, so the reply never comes
    // back and the request times out. The request itself did land.
    {
        let mut g = c.lock().unwrap();
        let err = out.start_remote(&mut g, &mut t_out).unwrap_err();
        assert!(matches!(err, Error::NotResponding(_)), "got {err}");
        assert!(!g.output.done);
    }
    let cid = out.circuit_id().expect("client keeps its half-made circuit");

    // The server catches up and serves the stale request; its reply is
    // the one the client already gave up on.
    t_in.dispatch();
    assert!(t_in.circuit(cid).is_some());
    let server_circuits = t_in.circuit_count();

    // Retry with the server polling concurrently. The same circuit id is
    // re-requested and replaces, not duplicates, the server's circuit.
    out.set_request_timeout(Duration::from_secs(5));
    let finished = Arc::new(AtomicBool::new(false));
    let client = {
        let c = Arc::clone(&c);
        let finished = Arc::clone(&finished);
        thread::spawn(move || {
            loop {
                let mut g = c.lock().unwrap();
                if g.output.done {
                    break;
                }
                out.start_remote(&mut g, &mut t_out).unwrap();
                drop(g);
                thread::sleep(ms(1));
            }
            finished.store(true, Ordering::Release);
            (out, t_out)
        })
    };

    let deadline = Instant::now() + Duration::from_secs(20);
    let mut in_done = false;
    while !(finished.load(Ordering::Acquire) && in_done) {
        assert!(Instant::now() < deadline, "retry stalled");
        t_in.dispatch();
        if let Ok(mut g) = c.try_lock() {
            if g.input.done || !inp.finish_remote(&mut g, &mut t_in).unwrap() {
                in_done = true;
            }
        }
    }
    let (out, mut t_out) = client.join().unwrap();

    assert_eq!(out.circuit_id().unwrap(), cid, "client reused its circuit");
    assert!(t_in.circuit(cid).is_some());
    assert_eq!(
        t_in.circuit_count(),
        server_circuits,
        "retried request must not duplicate the circuit"
    );

    // The connection is live: one message end to end.
    out_send_one(&mut t_out, &mut t_in, out, &mut inp);
}

fn out_send_one(t_out: &mut Transport, t_in: &mut Transport, mut out: Port, inp: &mut Port) {
    let data = out.get_buffer().unwrap().unwrap();
    data[..2].copy_from_slice(b"ok");
    out.put(2, 1, false, 0).unwrap();
    t_out.dispatch();
    t_in.dispatch();
    let (h, body) = inp.get_full().unwrap().expect("message should arrive");
    assert_eq!(h.op_code, 1);
    assert_eq!(body, b"ok");
    inp.release().unwrap();
}

// --- mailbox offset requests + protocol blob shipping ---

#[test]
fn offset_requests_ship_state_and_protocol_blob() {
    let fabric = Fabric::new();
    let mut t_in = Transport::new(&fabric, None).unwrap();
    let t_out = Transport::new(&fabric, None).unwrap();

    let params = Params::new().with_buffer_count(2);
    let mut inp = Port::new_input("rx", &params);
    let mut out = Port::new_output("tx", &params);
    out.set_request_timeout(Duration::from_secs(5));
    out.set_protocol_info(b"blob-0123".to_vec());

    // Establish the connection (client on a thread, as usual).
    let c = Arc::new(Mutex::new(Connection::new(1024)));
    {
        let mut g = c.lock().unwrap();
        inp.start_remote(&mut g, &mut t_in).unwrap();
    }
    let stop = Arc::new(AtomicBool::new(false));
    let client = {
        let c = Arc::clone(&c);
        let stop = Arc::clone(&stop);
        let mut t_out = t_out;
        thread::spawn(move || {
            loop {
                let mut g = c.lock().unwrap();
                if g.output.done {
                    break;
                }
                out.start_remote(&mut g, &mut t_out).unwrap();
                drop(g);
                thread::sleep(ms(1));
            }
            // Keep serving mailbox requests until told to stop.
            while !stop.load(Ordering::Acquire) {
                t_out.dispatch();
                thread::sleep(ms(1));
            }
            (out, t_out)
        })
    };
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        assert!(Instant::now() < deadline, "handshake stalled");
        t_in.dispatch();
        let mut done = false;
        if let Ok(mut g) = c.try_lock() {
            done = g.input.done || !inp.finish_remote(&mut g, &mut t_in).unwrap();
        }
        if done {
            break;
        }
    }

    // The input side knows the output's identity from its descriptor.
    let peer = inp
        .remote_port()
        .unwrap()
        .peer_descriptor()
        .expect("peer descriptor consumed during finalize");
    let client_ep = peer.oob.oep.clone();
    let out_cid = peer.oob.cookie as u32;
    let out_port_id = peer.oob.port_id;
    let n = peer.n_buffers;

    // Ask the output side for its flow-control words and tell it where
    // to land the protocol blob it announced.
    let mem = fabric.lookup(&t_in.endpoint().name).unwrap();
    let ret_off = mem.alloc(n * 8, "return area").unwrap();
    let proto_off = mem.alloc(16, "protocol area").unwrap();
    t_in.request_output_offsets(
        &client_ep,
        out_cid,
        out_port_id,
        ret_off,
        n * 8,
        proto_off,
        Duration::from_secs(5),
    )
    .unwrap();
    // The shipped copies are posted; drain them.
    t_in.dispatch();

    let blob = mem.read(proto_off, b"blob-0123".len() as u32);
    assert_eq!(&blob, b"blob-0123");
    for i in 0..n {
        // Idle output: every shadow flag shows "empty".
        assert_eq!(mem.read_flag(ret_off + (i * 8) as u64), 1, "flag {i}");
    }

    // Symmetric request against the input side's own circuit, which the
    // output learned from the feedback descriptor's cookie.
    stop.store(true, Ordering::Release);
    let (out, mut t_out) = client.join().unwrap();
    let in_desc = out
        .remote_port()
        .unwrap()
        .peer_descriptor()
        .expect("output holds the input descriptor");
    let in_cid = in_desc.oob.cookie as u32;
    let in_port_id = in_desc.oob.port_id;

    let out_mem = fabric.lookup(&t_out.endpoint().name).unwrap();
    let ret2 = out_mem.alloc(n * 8, "return area").unwrap();
    let stop2 = Arc::new(AtomicBool::new(false));
    let server = {
        let stop2 = Arc::clone(&stop2);
        let mut t_in = t_in;
        thread::spawn(move || {
            while !stop2.load(Ordering::Acquire) {
                t_in.dispatch();
                thread::sleep(ms(1));
            }
            t_in
        })
    };
    t_out
        .request_input_offsets(
            &in_desc.oob.oep,
            in_cid,
            in_port_id,
            ret2,
            n * 8,
            Duration::from_secs(5),
        )
        .unwrap();
    t_out.dispatch();
    stop2.store(true, Ordering::Release);
    let _t_in = server.join().unwrap();

    for i in 0..n {
        // Idle input: every full flag shows "no message".
        assert_eq!(out_mem.read_flag(ret2 + (i * 8) as u64), 0, "flag {i}");
    }
}

#[test]
fn update_circuit_closes_the_server_circuit() {
    let fabric = Fabric::new();
    let mut t_in = Transport::new(&fabric, None).unwrap();
    let mut t_out = Transport::new(&fabric, None).unwrap();
    let server_ep = t_in.endpoint().name.clone();

    let cid = t_in.create_circuit(0x55);
    assert!(t_in.circuit(cid).unwrap().open);

    let stop = Arc::new(AtomicBool::new(false));
    let server = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                t_in.dispatch();
                thread::sleep(ms(1));
            }
            t_in
        })
    };
    t_out
        .request_update_circuit(cid, &server_ep, 1, Duration::from_secs(5))
        .unwrap();
    stop.store(true, Ordering::Release);
    let t_in = server.join().unwrap();
    assert!(!t_in.circuit(cid).unwrap().open);
}

// --- unknown circuits ---

#[test]
fn offset_request_for_unknown_circuit_reports_peer_error() {
    let fabric = Fabric::new();
    let t_in = Transport::new(&fabric, None).unwrap();
    let mut t_out = Transport::new(&fabric, None).unwrap();
    let server_ep = t_in.endpoint().name.clone();

    let stop = Arc::new(AtomicBool::new(false));
    let server = {
        let stop = Arc::clone(&stop);
        let mut t_in = t_in;
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                t_in.dispatch();
                thread::sleep(ms(1));
            }
            t_in
        })
    };
    let err = t_out
        .request_input_offsets(&server_ep, 0x77, 1, 64, 8, Duration::from_secs(5))
        .unwrap_err();
    assert!(matches!(err, Error::PeerError(_)), "got {err}");
    stop.store(true, Ordering::Release);
    server.join().unwrap();
}
