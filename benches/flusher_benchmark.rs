//! Flusher Benchmarks
//!
//! Measures the cost of the Worker's hot-path operations: payload
//! serialization and a full flush iteration against the in-memory buffer.
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

use span_flusher::buffer::{FlushedSegment, InMemorySegmentBuffer};
use span_flusher::shared::SharedState;
use span_flusher::sink::ChannelSink;
use span_flusher::worker::{build_payload, FlusherWorker};

fn bench_build_payload(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_payload");

    for span_count in [1usize, 10, 100].iter() {
        let segment = FlushedSegment {
            spans: (0..*span_count)
                .map(|i| format!("{{\"span_id\":{i}}}").into_bytes())
                .collect(),
        };

        group.throughput(Throughput::Elements(*span_count as u64));
        group.bench_with_input(format!("{span_count}_spans"), &segment, |b, segment| {
            b.iter(|| black_box(build_payload(segment).unwrap()));
        });
    }

    group.finish();
}

fn bench_flush_iteration(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("flush_iteration");
    group.sample_size(20);

    for segment_count in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*segment_count as u64));
        group.bench_with_input(
            format!("{segment_count}_segments"),
            segment_count,
            |b, &segment_count| {
                b.iter(|| {
                    rt.block_on(async {
                        let buffer = Arc::new(InMemorySegmentBuffer::new(vec![0]));
                        for i in 0..segment_count {
                            buffer.insert_ready(
                                format!("trace-{i}"),
                                vec![format!("{{\"span_id\":{i}}}").into_bytes()],
                            );
                        }
                        let (sink, mut rx) = ChannelSink::new();
                        let sink = Arc::new(sink);
                        let shared = SharedState::new();

                        let drain = tokio::spawn(async move {
                            let mut count = 0usize;
                            while rx.recv().await.is_some() {
                                count += 1;
                            }
                            count
                        });

                        let worker = FlusherWorker::new(
                            buffer,
                            sink,
                            "bench-topic".to_string(),
                            shared,
                            segment_count + 1,
                            Duration::from_millis(1),
                        );

                        black_box(worker.run_iteration().await.unwrap());
                        drain.abort();
                    })
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_build_payload, bench_flush_iteration);
criterion_main!(benches);
