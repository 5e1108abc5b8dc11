use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use wsmux::frame::Frame;
use wsmux::window::{update_threshold, RecvWindow, SendWindow};

/// Encode and decode of a full-size DATA frame.
fn bench_frame_codec(c: &mut Criterion) {
    let payload = Bytes::from(vec![0xABu8; 16 * 1024]);
    let frame = Frame::data(7, payload.clone());
    let encoded = frame.encode();

    let mut group = c.benchmark_group("frame");
    group.throughput(Throughput::Bytes(encoded.len() as u64));

    group.bench_function("encode_data_16k", |b| {
        b.iter(|| black_box(&frame).encode());
    });

    group.bench_function("decode_data_16k", |b| {
        b.iter(|| Frame::decode(black_box(encoded.clone()), 16 * 1024));
    });

    let update = Frame::window_update(7, 65_536).encode();
    group.throughput(Throughput::Elements(1));
    group.bench_function("decode_window_update", |b| {
        b.iter(|| Frame::decode(black_box(update.clone()), 16 * 1024));
    });

    group.finish();
}

/// Credit bookkeeping for one 1000-byte chunk through a 256 KiB window.
fn bench_window(c: &mut Criterion) {
    let initial = 256 * 1024;
    let mut group = c.benchmark_group("window");
    group.throughput(Throughput::Elements(1));

    group.bench_function("send_admit_consume_grant", |b| {
        let mut send = SendWindow::new(initial);
        let mut recv = RecvWindow::new(initial, update_threshold(initial, 25));
        b.iter(|| {
            let n = send.reserve(black_box(1000));
            let _ = recv.admit(n);
            if let Some(credit) = recv.consume(n) {
                send.grant(credit);
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_frame_codec, bench_window);
criterion_main!(benches);
