use bacnet_core::encoding::*;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn encode_benchmark(c: &mut Criterion) {
    c.bench_function("encode_application_unsigned", |b| {
        let mut buffer = Vec::with_capacity(8);
        b.iter(|| {
            buffer.clear();
            encode_application_unsigned(&mut buffer, black_box(0x12345)).unwrap();
            black_box(&buffer);
        })
    });

    c.bench_function("encode_application_real", |b| {
        let mut buffer = Vec::with_capacity(8);
        b.iter(|| {
            buffer.clear();
            encode_application_real(&mut buffer, black_box(23.5)).unwrap();
            black_box(&buffer);
        })
    });

    c.bench_function("encode_application_object_id", |b| {
        let object_id = ObjectIdentifier::new(ObjectType::AnalogInput, 42);
        let mut buffer = Vec::with_capacity(8);
        b.iter(|| {
            buffer.clear();
            encode_application_object_id(&mut buffer, black_box(&object_id)).unwrap();
            black_box(&buffer);
        })
    });
}

fn decode_benchmark(c: &mut Criterion) {
    c.bench_function("decode_application_unsigned", |b| {
        let mut buffer = Vec::new();
        encode_application_unsigned(&mut buffer, 0x12345).unwrap();
        b.iter(|| black_box(decode_application_unsigned(black_box(&buffer)).unwrap()))
    });

    c.bench_function("decode_application_real", |b| {
        let mut buffer = Vec::new();
        encode_application_real(&mut buffer, 23.5).unwrap();
        b.iter(|| black_box(decode_application_real(black_box(&buffer)).unwrap()))
    });
}

criterion_group!(benches, encode_benchmark, decode_benchmark);
criterion_main!(benches);
