//! Codec and dispatch throughput

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use voltage_rtu::frame::{crc16, decode, encode, response_frame_len};
use voltage_rtu::{BlockKind, LoopbackLink, RtuServer, SerialConfig, Transport};

fn bench_crc(c: &mut Criterion) {
    let frame: Vec<u8> = (0..254u16).map(|i| i as u8).collect();
    c.bench_function("crc16_254_bytes", |b| b.iter(|| crc16(black_box(&frame))));
}

fn bench_codec(c: &mut Criterion) {
    let registers: Vec<u8> = std::iter::once(250u8).chain((0..250).map(|i| i as u8)).collect();
    let encoded = encode(0x11, 0x03, &registers);

    let mut group = c.benchmark_group("rtu_codec");
    group.bench_function("encode_read_response", |b| {
        b.iter(|| encode(black_box(0x11), black_box(0x03), black_box(&registers)))
    });
    group.bench_function("decode_read_response", |b| {
        b.iter(|| decode(black_box(&encoded)).unwrap())
    });
    group.bench_function("response_frame_len", |b| {
        b.iter(|| response_frame_len(black_box(&encoded)))
    });
    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let (port, _peer) = LoopbackLink::pair("BENCH", "PEER");
    let server = RtuServer::new(Transport::new(port, SerialConfig::new("BENCH", 115_200)));
    let slave = server.add_slave(1).unwrap();
    slave
        .add_block("holding", BlockKind::HoldingRegisters, 0, 125)
        .unwrap();
    let request = encode(1, 0x03, &[0x00, 0x00, 0x00, 0x7D]);

    c.bench_function("slave_read_125_registers", |b| {
        b.iter(|| server.process_frame(black_box(&request)).unwrap())
    });
}

criterion_group!(benches, bench_crc, bench_codec, bench_dispatch);
criterion_main!(benches);
