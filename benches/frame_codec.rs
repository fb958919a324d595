//! 프레임 인코딩/디코딩 처리량

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use mtpipe::frame::{self, FrameEncoder};
use mtpipe::{DEFAULT_SCRATCH_SIZE, MAX_CHUNK_SIZE, SMALL_CHUNK_SIZE};

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for size in [4 * 1024, SMALL_CHUNK_SIZE, MAX_CHUNK_SIZE, MAX_CHUNK_SIZE * 2] {
        let payload = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes(size as u64));

        // 스크래치 버퍼 재사용 (큰 페이로드는 별도 할당 경로)
        group.bench_with_input(BenchmarkId::new("scratch", size), &payload, |b, payload| {
            let mut encoder = FrameEncoder::new(DEFAULT_SCRATCH_SIZE);
            b.iter(|| black_box(encoder.encode_next(payload).len()));
        });

        group.bench_with_input(BenchmarkId::new("alloc", size), &payload, |b, payload| {
            b.iter(|| black_box(frame::encode(0, payload)));
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for size in [4 * 1024, MAX_CHUNK_SIZE] {
        let encoded = frame::encode(7, &vec![0xA5u8; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| black_box(frame::decode(encoded).map(|f| f.payload.len())));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
