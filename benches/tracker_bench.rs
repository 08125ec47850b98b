use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use perftrack::{ExportFormat, PerformanceTracker, Threshold, TrackOptions, TrackerConfig};

fn tracker_with_thresholds(count: usize) -> PerformanceTracker {
    let tracker = PerformanceTracker::new(TrackerConfig::default()).unwrap();
    for i in 0..count {
        tracker
            .set_threshold(Threshold::new(format!("service{i}.*")).max_duration_ms(1_000.0))
            .unwrap();
    }
    tracker
}

fn bench_track(c: &mut Criterion) {
    let mut group = c.benchmark_group("track");

    for thresholds in [0usize, 10, 100] {
        let tracker = tracker_with_thresholds(thresholds);
        group.bench_with_input(BenchmarkId::new("sync", thresholds), &tracker, |b, tracker| {
            b.iter(|| {
                tracker
                    .track("service1.handler", TrackOptions::new(), || Ok::<_, String>(black_box(42)))
                    .unwrap()
            })
        });
    }

    let tracker = tracker_with_thresholds(0);
    group.bench_function("manual", |b| {
        b.iter(|| {
            let id = tracker.start_tracking("manual.op").unwrap();
            tracker.end_tracking(black_box(id), true, None)
        })
    });

    group.finish();
}

fn bench_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("queries");
    let tracker = tracker_with_thresholds(0);
    for i in 0..5_000 {
        let operation = format!("op{}", i % 50);
        tracker
            .track(&operation, TrackOptions::new(), || Ok::<_, String>(()))
            .unwrap()
            .unwrap();
    }

    group.bench_function("get_stats", |b| b.iter(|| tracker.get_stats(black_box("op7"))));
    group.bench_function("dashboard", |b| b.iter(|| tracker.get_dashboard_data()));
    group.bench_function("export_prometheus", |b| {
        b.iter(|| tracker.export_metrics(ExportFormat::Prometheus).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_track, bench_queries);
criterion_main!(benches);
