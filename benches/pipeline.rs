//! Benchmark for the notification → snapshot → publication pipeline.
//!
//! Mirrors the work done per notification and per relay tick: decode, merge
//! into the aggregator, snapshot, build the publication and write it through
//! the JSON lines sink.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use chrono::Utc;
use hrm_relay::protocol::HEART_RATE_MEASUREMENT;
use hrm_relay::sink::stdout::JsonLinesSink;
use hrm_relay::{HeartRateMeasurement, Publication, Sink, TelemetryAggregator, decode};
use tokio::runtime::Runtime;

fn notifications(count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| {
            HeartRateMeasurement {
                bpm: 60 + (i % 40) as u16,
                energy_expended: None,
                rr_intervals: vec![0.75, 0.8],
            }
            .encode()
        })
        .collect()
}

/// Decode and merge a batch of notifications
fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_merge");

    for batch_size in [1, 10, 100] {
        let payloads = notifications(batch_size);
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &payloads,
            |b, payloads| {
                let aggregator = TelemetryAggregator::default();
                b.iter(|| {
                    for payload in payloads {
                        if let Ok(measurement) = decode(HEART_RATE_MEASUREMENT, payload) {
                            aggregator.merge(measurement);
                        }
                    }
                    black_box(aggregator.snapshot())
                })
            },
        );
    }

    group.finish();
}

/// One relay tick: snapshot, publication, JSON line
fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("relay_tick");
    let rt = Runtime::new().unwrap();

    let aggregator = TelemetryAggregator::default();
    for payload in notifications(5) {
        if let Ok(measurement) = decode(HEART_RATE_MEASUREMENT, &payload) {
            aggregator.merge(measurement);
        }
    }
    let sink = JsonLinesSink::new(std::io::sink());

    group.throughput(Throughput::Elements(1));
    group.bench_function("snapshot_to_json_line", |b| {
        b.iter(|| {
            let publication = Publication::from_snapshot(&aggregator.snapshot(), Utc::now());
            rt.block_on(async { sink.publish(&publication).await.unwrap() });
            black_box(publication)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_merge, bench_publish);
criterion_main!(benches);
