use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rulox_bridge::codec;
use rulox_bridge::memory::MemoryViews;
use rulox_bridge::{BridgeConfig, GuestAllocator, GuestProgram, NativeModule, StringEncoding};
use serde_json::Value;
use std::hint::black_box;

/// Guest that never gets called; the benchmark only exercises the allocator
struct Idle;

impl GuestProgram for Idle {
    type Instance = ();

    fn construct(&mut self, _source: String) {}

    fn tokens(&mut self, _instance: &mut ()) -> Result<Value, String> {
        Ok(Value::Null)
    }

    fn parse_tree(&mut self, _instance: &mut ()) -> Result<Value, String> {
        Ok(Value::Null)
    }

    fn interpret(&mut self, _instance: &mut ()) -> Result<Value, String> {
        Ok(Value::Null)
    }

    fn had_errors(&self, _instance: &()) -> bool {
        false
    }

    fn environment(&self, _instance: &()) -> String {
        String::new()
    }
}

fn bench_encode(c: &mut Criterion) {
    let samples = [
        ("ascii", "var total = (1 + 2) * 3;\nprint total;\n".repeat(64)),
        ("latin1", "var café = \"crème brûlée\";\n".repeat(64)),
        ("cjk", "print \"東京 → 大阪\";\n".repeat(64)),
        ("emoji", "print \"🎉🦀\";\n".repeat(64)),
    ];

    let mut group = c.benchmark_group("encode");
    for (name, text) in &samples {
        group.throughput(Throughput::Bytes(text.len() as u64));

        for encoding in [StringEncoding::Streaming, StringEncoding::Exact] {
            let id = BenchmarkId::new(format!("{:?}", encoding), name);
            group.bench_with_input(id, &text.as_str(), |b, &text| {
                let mut module = NativeModule::new(Idle, &BridgeConfig::default()).unwrap();
                let mut views = MemoryViews::new();
                b.iter(|| {
                    let encoded =
                        codec::encode(&mut module, &mut views, black_box(text), encoding).unwrap();
                    module.free(encoded.ptr, encoded.len).unwrap();
                });
            });
        }
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let text = "var café = \"東京\";\n".repeat(256);
    let mut module = NativeModule::new(Idle, &BridgeConfig::default()).unwrap();
    let mut views = MemoryViews::new();
    let encoded = codec::encode(&mut module, &mut views, &text, StringEncoding::Exact).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("mixed", |b| {
        b.iter(|| {
            let decoded =
                codec::decode_from(&module, &mut views, black_box(encoded.ptr), encoded.len).unwrap();
            black_box(decoded);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
