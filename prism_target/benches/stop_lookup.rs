//! Compiled-Method Metadata Benchmarks
//!
//! Benchmarks for the lookups a stack walker and the exception dispatcher
//! perform on every frame.
//!
//! # Benchmark Categories
//!
//! 1. **Stop Lookup**: return address to stop index, by table size
//! 2. **Catch Dispatch**: throw position to handler, by table size
//! 3. **Next Call**: forward scan for the next (native) call
//! 4. **Bundle Layout**: laying out and re-laying out a bundle
//!
//! # Performance Targets
//!
//! - Stop lookup, 64 stops: < 100ns
//! - Catch dispatch, 16 ranges: < 20ns

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use prism_target::stops;
use prism_target::{
    ArrayField, BundleLayout, CatchRangeTable, CodeRegion, CompiledMethod, GeneratedCode,
    MethodFlavor, StopTable, TargetConfig,
};

// =============================================================================
// Benchmark Helpers
// =============================================================================

/// Stop entries spaced 8 bytes apart: half direct calls, a quarter indirect
/// calls, the rest safepoints. Every fourth call is native.
fn stop_entries(count: usize) -> (Vec<u32>, usize, usize) {
    let entries = (0..count)
        .map(|i| stops::encode(i * 8 + 3, i % 4 == 0).unwrap())
        .collect();
    (entries, count / 2, count / 4)
}

fn catch_table(count: usize) -> (Vec<u32>, Vec<u32>) {
    let positions = (0..count as u32).map(|i| i * 32).collect();
    let targets = (0..count as u32)
        .map(|i| if i % 3 == 0 { 0 } else { 0x4000 + i })
        .collect();
    (positions, targets)
}

/// A method whose stops are all calls, installed in a test region.
fn installed_method(calls: usize) -> CompiledMethod {
    let region = CodeRegion::new(&TargetConfig::for_testing()).unwrap();
    let mut generated = GeneratedCode::new(vec![0x90; calls * 8 + 16]);
    for i in 0..calls {
        generated = generated.with_indirect_call((i * 8 + 3) as u32, i % 2 == 0);
    }
    let method = CompiledMethod::new("bench", MethodFlavor::Compiled);
    method.set_generated(&region, generated).unwrap();
    method
}

// =============================================================================
// Stop Lookup Benchmarks
// =============================================================================

fn bench_stop_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("stop_lookup");

    for count in [4, 16, 64, 256] {
        let (entries, direct, indirect) = stop_entries(count);
        let table = StopTable::new(&entries, direct, indirect, count - direct - indirect).unwrap();
        // Return address just past the last call.
        let probe = ((direct + indirect - 1) * 8 + 3 + 5) as u32;

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("return_address", count), &probe, |b, &p| {
            b.iter(|| black_box(table.find_stop_index(black_box(p))))
        });

        let safepoint = ((count - 1) * 8 + 3) as u32;
        group.bench_with_input(BenchmarkId::new("safepoint", count), &safepoint, |b, &p| {
            b.iter(|| black_box(table.find_stop_index(black_box(p))))
        });
    }

    let method = installed_method(64);
    let ip = method.code_start() + 63 * 8 + 3 + 5;
    group.bench_function("compiled_method_64", |b| {
        b.iter(|| black_box(method.find_stop_index(black_box(ip))))
    });

    group.finish();
}

// =============================================================================
// Catch Dispatch Benchmarks
// =============================================================================

fn bench_catch_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("catch_dispatch");

    for count in [1, 4, 16, 64] {
        let (positions, targets) = catch_table(count);
        let table = CatchRangeTable::new(&positions, &targets).unwrap();
        let first = 1u32;
        let last = (count as u32 - 1) * 32 + 1;

        group.bench_with_input(BenchmarkId::new("first_range", count), &first, |b, &p| {
            b.iter(|| black_box(table.resolve(black_box(p))))
        });
        group.bench_with_input(BenchmarkId::new("last_range", count), &last, |b, &p| {
            b.iter(|| black_box(table.resolve(black_box(p))))
        });
    }

    group.finish();
}

// =============================================================================
// Next Call Benchmarks
// =============================================================================

fn bench_next_call(c: &mut Criterion) {
    let mut group = c.benchmark_group("next_call");

    let (entries, direct, indirect) = stop_entries(256);
    let table = StopTable::new(&entries, direct, indirect, 256 - direct - indirect).unwrap();

    group.bench_function("any_call", |b| {
        b.iter(|| black_box(table.find_next_call(black_box(512), false)))
    });
    group.bench_function("native_only", |b| {
        b.iter(|| black_box(table.find_next_call(black_box(512), true)))
    });

    group.finish();
}

// =============================================================================
// Bundle Layout Benchmarks
// =============================================================================

fn bench_bundle_layout(c: &mut Criterion) {
    let mut group = c.benchmark_group("bundle_layout");

    let lengths = [
        (ArrayField::CatchRangePositions, 4),
        (ArrayField::CatchBlockPositions, 4),
        (ArrayField::StopPositions, 24),
        (ArrayField::DirectCallees, 12),
        (ArrayField::ReferenceMaps, 96),
        (ArrayField::ScalarLiterals, 40),
        (ArrayField::ReferenceLiterals, 6),
        (ArrayField::Code, 1500),
    ];

    group.bench_function("layout", |b| {
        b.iter(|| black_box(BundleLayout::layout(black_box(lengths))))
    });

    group.bench_function("update_code", |b| {
        let mut layout = BundleLayout::layout(lengths);
        let mut length = 1500;
        b.iter(|| {
            length ^= 64;
            layout.update(ArrayField::Code, length);
            black_box(layout.size())
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_stop_lookup,
    bench_catch_dispatch,
    bench_next_call,
    bench_bundle_layout,
);
criterion_main!(benches);
