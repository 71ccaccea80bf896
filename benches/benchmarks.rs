use chrono::{Duration, TimeZone, Utc};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use sessionflow::event::Event;
use sessionflow::ingest::{ingest_chain, Stage};
use sessionflow::session::SessionStateManager;
use sessionflow::PipelineConfig;

fn events(entities: usize, count: usize) -> Vec<Event> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    (0..count)
        .map(|i| Event {
            event_type: "view".to_string(),
            entity_id: format!("u{}", i % entities),
            timestamp: start + Duration::seconds(i as i64),
            processed_at: start,
            payload: Default::default(),
        })
        .collect()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_state");
    for entities in [10, 10_000] {
        let batch = events(entities, 10_000);
        group.bench_with_input(
            BenchmarkId::new("process", entities),
            &batch,
            |b, batch| {
                b.iter(|| {
                    let mut manager = SessionStateManager::new(Duration::minutes(30));
                    for event in batch {
                        criterion::black_box(manager.process(event));
                    }
                })
            },
        );
    }
    group.finish();

    let chain = ingest_chain(&PipelineConfig::default());
    let raw = br#"{"event_type": "click", "user_id": "u1", "timestamp": "2024-01-01T10:00:00Z", "page": "/home"}"#;
    c.bench_function("ingest_chain", |b| {
        b.iter(|| criterion::black_box(chain.apply(raw.to_vec())))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
