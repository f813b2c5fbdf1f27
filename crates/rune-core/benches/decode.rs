//! Benchmarks for incremental decoding.
//!
//! Compares generating `n` tokens with the KV cache (one `step` per token)
//! against recomputing the full sequence for every new token. The cached
//! path should scale linearly in `n`, the recompute path quadratically.

use candle_core::Device;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rune_core::generation::{argmax, GenerationConfig, Generator};
use rune_core::model::{ModelConfig, Transformer};

fn bench_model() -> Transformer {
    let config = ModelConfig {
        layer_count: 2,
        embed_dim: 128,
        head_count: 4,
        ffn_dim: 512,
        vocab_size: 1024,
        max_seq_len: 256,
        ..ModelConfig::default()
    };
    Transformer::random(config, 0, &Device::Cpu).unwrap()
}

/// Decode `n` tokens after an 8-token prompt using the cache.
fn cached_decode(model: &Transformer, n: usize) -> u32 {
    let prompt: Vec<u32> = (4..12).collect();
    let mut cache = model.new_cache();
    let mut logits = model.prefill(&prompt, &mut cache).unwrap();
    let mut token = 0;
    for _ in 0..n {
        token = argmax(&logits.to_vec1::<f32>().unwrap()).unwrap();
        logits = model.step(token, &mut cache).unwrap();
    }
    token
}

/// Decode `n` tokens by re-running the whole sequence each time.
fn recompute_decode(model: &Transformer, n: usize) -> u32 {
    let mut tokens: Vec<u32> = (4..12).collect();
    let mut token = 0;
    for _ in 0..n {
        let logits = model.forward_all(&tokens).unwrap();
        let last = logits.get(tokens.len() - 1).unwrap();
        token = argmax(&last.to_vec1::<f32>().unwrap()).unwrap();
        tokens.push(token);
    }
    token
}

/// Benchmark: cached steps vs full recompute.
fn bench_decode(c: &mut Criterion) {
    let model = bench_model();
    let mut group = c.benchmark_group("decode");
    group.sample_size(10);

    for n in [16usize, 64, 128] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("kv_cache", n), &n, |b, &n| {
            b.iter(|| black_box(cached_decode(&model, n)))
        });
        group.bench_with_input(BenchmarkId::new("recompute", n), &n, |b, &n| {
            b.iter(|| black_box(recompute_decode(&model, n)))
        });
    }

    group.finish();
}

/// Benchmark: prompt encoding at several lengths.
fn bench_prefill(c: &mut Criterion) {
    let model = bench_model();
    let mut group = c.benchmark_group("prefill");

    for len in [8usize, 32, 128] {
        let prompt: Vec<u32> = (0..len).map(|i| 4 + (i as u32 % 1000)).collect();
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &prompt, |b, prompt| {
            b.iter(|| {
                let mut cache = model.new_cache();
                black_box(model.prefill(prompt, &mut cache).unwrap())
            })
        });
    }

    group.finish();
}

/// Benchmark: a full generation session, state machine included.
fn bench_session(c: &mut Criterion) {
    let model = bench_model();
    let command: Vec<u32> = (10..20).collect();

    c.bench_function("session_greedy_64", |b| {
        b.iter(|| {
            let config = GenerationConfig::greedy().with_max_seq_len(64);
            black_box(Generator::new(&model, &command, config).unwrap().run().unwrap())
        })
    });
}

criterion_group!(benches, bench_decode, bench_prefill, bench_session);
criterion_main!(benches);
