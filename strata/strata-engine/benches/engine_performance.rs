//! Benchmarks for chunk generation, cache lookups and end-to-end processing
//!
//! Run with: cargo bench --bench engine_performance

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::fs;
use std::hint::black_box;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strata_core::StrataConfig;
use strata_engine::cache::ContentHashCache;
use strata_engine::chunked::{ChunkGenerator, ChunkedParser, ChunkingPlan};
use strata_engine::memory::MemoryMonitor;
use strata_engine::progress::ProgressTracker;
use strata_engine::scheduler::ParallelProcessor;
use strata_engine::ShallowExtractor;
use tempfile::TempDir;

/// Source text with `classes` classes of four methods each
fn synthetic_source(classes: usize) -> String {
    let mut source = String::from("import os\nfrom typing import List\n\n");
    for i in 0..classes {
        source.push_str(&format!("class Handler{}(Base):\n", i));
        for m in 0..4 {
            source.push_str(&format!(
                "    def method_{}(self, items: List[int]) -> int:\n        return sum(\n            items\n        )\n\n",
                m
            ));
        }
        source.push('\n');
    }
    source
}

/// Create test files of various sizes
fn create_test_files(count: usize) -> (TempDir, Vec<PathBuf>) {
    let temp = TempDir::new().unwrap();
    let mut files = Vec::new();

    for i in 0..count {
        let file = temp.path().join(format!("module_{}.py", i));
        fs::write(&file, synthetic_source(1 + i % 5)).unwrap();
        files.push(file);
    }

    (temp, files)
}

fn bench_chunk_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_generation");

    for classes in [100, 500, 2000].iter() {
        let source = synthetic_source(*classes);
        group.throughput(Throughput::Bytes(source.len() as u64));

        group.bench_with_input(BenchmarkId::from_parameter(classes), &source, |b, source| {
            b.iter(|| {
                let generator = ChunkGenerator::new(Cursor::new(source.as_bytes()), ChunkingPlan::default());
                let chunks = generator.filter_map(|chunk| chunk.ok()).count();
                black_box(chunks)
            });
        });
    }

    group.finish();
}

fn bench_cache_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_lookup");

    for size in [10, 100].iter() {
        let (temp, files) = create_test_files(*size);
        let cache = ContentHashCache::open(&temp.path().join("cache"), "bench", 256).unwrap();
        let extractor = ShallowExtractor::new();
        for file in &files {
            let module = extractor.parse_file(file).unwrap();
            cache
                .store_result(file, &module, &[], Duration::from_millis(1))
                .unwrap();
        }

        group.throughput(Throughput::Elements(*size as u64));

        group.bench_with_input(BenchmarkId::new("changed_files", size), &files, |b, files| {
            b.iter(|| black_box(cache.get_changed_files(files)));
        });

        group.bench_with_input(BenchmarkId::new("bulk_load", size), &files, |b, files| {
            b.iter(|| black_box(cache.bulk_load_cached_results(files).len()));
        });
    }

    group.finish();
}

fn bench_parallel_processing(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_processing");
    group.sample_size(20);

    let config = StrataConfig::default();
    let (_temp, files) = create_test_files(200);
    group.throughput(Throughput::Elements(files.len() as u64));

    group.bench_function("shallow_200_files", |b| {
        b.iter(|| {
            let monitor = Arc::new(MemoryMonitor::with_probe(f64::MAX, Box::new(|| 0.0)));
            let chunked = Arc::new(ChunkedParser::from_config(&config, monitor));
            let processor = ParallelProcessor::new(&config, chunked, ProgressTracker::new(0));
            let outcome = processor
                .process_files(&files, ShallowExtractor::parse_fn())
                .unwrap();
            black_box(outcome.modules.len())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_chunk_generation,
    bench_cache_lookup,
    bench_parallel_processing
);
criterion_main!(benches);
