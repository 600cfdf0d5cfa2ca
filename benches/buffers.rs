//! Benchmarks for the receive window and send allocator hot paths.
//!
//! Run with: cargo bench --bench buffers

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use servercore::{
    framing::{encode_frame, next_frame, HeaderWidth},
    RecvWindow, SendAllocator,
};

/// Many small framed packets arriving in reads that split them arbitrarily
fn bench_window_reassembly(c: &mut Criterion) {
    let body = [7u8; 30];
    let mut packet = ((body.len() + 2) as u16).to_le_bytes().to_vec();
    packet.extend_from_slice(&body);
    let stream: Vec<u8> = packet.iter().copied().cycle().take(64 * 1024).collect();

    let mut group = c.benchmark_group("window_reassembly");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    for read_size in [100usize, 1460, 8192] {
        group.bench_with_input(BenchmarkId::from_parameter(read_size), &read_size, |b, &n| {
            b.iter(|| {
                let mut window = RecvWindow::new(16 * 1024);
                let mut packets = 0;
                for read in stream.chunks(n) {
                    window.compact();
                    window.writable()[..read.len()].copy_from_slice(read);
                    window.commit_write(read.len()).unwrap();
                    let mut consumed = 0;
                    while let Ok(Some(size)) =
                        next_frame(&window.readable()[consumed..], HeaderWidth::U16, 1024)
                    {
                        consumed += size;
                        packets += 1;
                    }
                    window.commit_read(consumed).unwrap();
                }
                black_box(packets)
            })
        });
    }
    group.finish();
}

/// Encoding packets through the allocator, including periodic rebinds
fn bench_allocator_encode(c: &mut Criterion) {
    let body = [3u8; 100];
    let mut group = c.benchmark_group("allocator_encode");
    for capacity in [4096usize, 65535 * 16] {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, &cap| {
            let mut allocator = SendAllocator::with_capacity(cap);
            b.iter(|| black_box(encode_frame(&mut allocator, HeaderWidth::U16, &body).unwrap()))
        });
    }
    group.finish();
}

/// Baseline: one fresh allocation per packet
fn bench_vec_per_packet(c: &mut Criterion) {
    let body = [3u8; 100];
    c.bench_function("vec_per_packet", |b| {
        b.iter(|| {
            let mut packet = Vec::with_capacity(body.len() + 2);
            packet.extend_from_slice(&((body.len() + 2) as u16).to_le_bytes());
            packet.extend_from_slice(&body);
            black_box(packet)
        })
    });
}

criterion_group!(
    benches,
    bench_window_reassembly,
    bench_allocator_encode,
    bench_vec_per_packet
);
criterion_main!(benches);
