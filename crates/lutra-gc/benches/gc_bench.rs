//! Collector benchmarks
//!
//! Measures allocation throughput and full-cycle reclamation cost.
//!
//! Run with: `cargo bench -p lutra-gc`

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use lutra_gc::{Gc, Trace, Visitor, gc_collect, gc_new, gc_new_vec};

struct Node {
    next: Option<Gc<Node>>,
    value: i64,
}

impl Trace for Node {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        visitor.visit_opt(&self.next);
    }
}

/// Drain the heap completely between measurements.
fn drain_heap() {
    loop {
        gc_collect(1_000_000);
        if lutra_gc::gc_stats().headers == 0 {
            break;
        }
    }
}

fn allocation_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation_throughput");

    group.bench_function("scalar_1000", |b| {
        b.iter(|| {
            for i in 0..1000 {
                let node = gc_new(Node {
                    next: None,
                    value: i,
                });
                black_box(&node);
            }
            drain_heap();
        });
    });

    group.finish();
}

fn full_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_cycle");

    for n in [100usize, 1000, 5000] {
        group.bench_with_input(BenchmarkId::new("garbage_objects", n), &n, |b, &n| {
            b.iter(|| {
                // Half the objects stay rooted, half become garbage.
                let mut live = Vec::with_capacity(n / 2);
                for i in 0..n {
                    let node = gc_new(Node {
                        next: None,
                        value: i as i64,
                    });
                    if i % 2 == 0 {
                        live.push(node);
                    }
                }
                gc_collect(16 * n + 1024);
                black_box(&live);
                drop(live);
                drain_heap();
            });
        });
    }

    group.finish();
}

fn mark_deep_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("mark_deep_chain");

    group.bench_function("chain_1000", |b| {
        b.iter(|| {
            let mut head = gc_new(Node {
                next: None,
                value: 0,
            });
            for value in 1..1000 {
                head = gc_new(Node {
                    next: Some(head),
                    value,
                });
            }
            gc_collect(16_384);
            black_box(&head);
            drop(head);
            drain_heap();
        });
    });

    group.finish();
}

fn container_tracing(c: &mut Criterion) {
    let mut group = c.benchmark_group("container_tracing");

    group.bench_function("vec_1000", |b| {
        b.iter(|| {
            let vec = gc_new_vec::<Node>();
            for i in 0..1000 {
                vec.push(gc_new(Node {
                    next: None,
                    value: i,
                }));
            }
            gc_collect(16_384);
            black_box(&vec);
            drop(vec);
            drain_heap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    allocation_throughput,
    full_cycle,
    mark_deep_chain,
    container_tracing,
);

criterion_main!(benches);
