// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dataplane contributors
//
// Buffer-ring throughput: the full get/put/get/release cycle through a
// shim pair, with and without payload touching.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use dataplane::{Connection, Params, Port};

fn shim_pair(n_buffers: u32, buffer_size: u32) -> (Port, Port) {
    let params = Params {
        buffer_count: Some(n_buffers),
        buffer_size: Some(buffer_size),
        ..Params::default()
    };
    let mut out = Port::new_output("bench.out", &params);
    let mut inp = Port::new_input("bench.in", &params);
    let mut c = Connection::new(buffer_size);
    out.connect_in_process(&mut inp, &mut c);
    (out, inp)
}

fn bench_cycle(c: &mut Criterion) {
    let mut g = c.benchmark_group("ring_cycle");
    g.throughput(Throughput::Elements(1));
    g.bench_function("header_only", |b| {
        let (mut out, mut inp) = shim_pair(4, 4096);
        b.iter(|| {
            out.get_buffer().unwrap().unwrap();
            out.put(0, 0, false, 0).unwrap();
            let _ = black_box(inp.get_full().unwrap().unwrap());
            inp.release().unwrap();
        });
    });
    g.finish();
}

fn bench_payload(c: &mut Criterion) {
    let mut g = c.benchmark_group("ring_payload");
    for size in [64usize, 1024, 4096] {
        g.throughput(Throughput::Bytes(size as u64));
        g.bench_function(format!("copy_{size}"), |b| {
            let (mut out, mut inp) = shim_pair(4, 4096);
            let src = vec![0xa5u8; size];
            b.iter(|| {
                let data = out.get_buffer().unwrap().unwrap();
                data[..size].copy_from_slice(&src);
                out.put(size as u32, 0, false, 0).unwrap();
                let (_, body) = inp.get_full().unwrap().unwrap();
                black_box(body);
                inp.release().unwrap();
            });
        });
    }
    g.finish();
}

criterion_group!(benches, bench_cycle, bench_payload);
criterion_main!(benches);
