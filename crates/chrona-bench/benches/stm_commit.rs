//! Benchmarks for transaction commit

use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrona_bench::{transfer_plan, StmFixture};
use chrona_core::ReversibleOp;
use chrona_stm::RetryPolicy;

fn bench_single_increment(c: &mut Criterion) {
    let fixture = StmFixture::new(1).expect("fixture");
    let policy = RetryPolicy::default();

    c.bench_function("stm_single_increment", |b| {
        b.iter(|| {
            fixture
                .stm
                .atomically(&policy, |tx| tx.apply(&fixture.vars[0], [ReversibleOp::Add(1)]))
                .expect("commit")
        })
    });
}

fn bench_read_only_audit(c: &mut Criterion) {
    let mut group = c.benchmark_group("stm_read_only_audit");
    for size in [1usize, 8, 64] {
        let fixture = StmFixture::new(size).expect("fixture");
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(fixture.audit().expect("audit")))
        });
    }
    group.finish();
}

fn bench_transfers(c: &mut Criterion) {
    let fixture = StmFixture::new(16).expect("fixture");
    let plan = transfer_plan(42, 1_000, 16);

    c.bench_function("stm_transfer_1000", |b| {
        b.iter(|| {
            for &(from, to, amount) in &plan {
                fixture.transfer(from, to, amount).expect("transfer");
            }
        })
    });
}

fn bench_contended_transfers(c: &mut Criterion) {
    let mut group = c.benchmark_group("stm_contended_transfers");
    group.sample_size(20);
    for threads in [2usize, 4, 8] {
        let fixture = Arc::new(StmFixture::new(4).expect("fixture"));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let handles: Vec<_> = (0..threads)
                    .map(|seed| {
                        let fixture = Arc::clone(&fixture);
                        thread::spawn(move || {
                            for (from, to, amount) in transfer_plan(seed as u64, 100, 4) {
                                fixture.transfer(from, to, amount).expect("transfer");
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().expect("worker");
                }
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_single_increment,
    bench_read_only_audit,
    bench_transfers,
    bench_contended_transfers,
);
criterion_main!(benches);
