//! Scheduler Benchmarks
//!
//! Per-frame cost of the streaming scheduler and its scorer

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use mipstream_cache::backend::GpuDevice;
use mipstream_cache::resource::DiscardLadder;
use mipstream_cache::scorer::{Footprint, PriorityScorer, SurfaceFlags};
use mipstream_cache::sim::{RecordingGpu, SyntheticCodec, SyntheticTransport};
use mipstream_cache::{BoostClass, ConsumerId, Scheduler, StreamingConfig, TextureKey};

fn populated(count: usize) -> Scheduler {
    let transport = SyntheticTransport::new();
    let gpu: Box<dyn GpuDevice> = Box::new(RecordingGpu::new());
    let mut scheduler = Scheduler::new(
        StreamingConfig::single_threaded(),
        Arc::new(transport.clone()),
        Arc::new(SyntheticCodec),
        gpu,
    )
    .unwrap();

    for i in 0..count {
        let key = TextureKey::from_u128(i as u128 + 1);
        transport.insert(key, 64, 64, 4);
        scheduler.reference(key, ConsumerId::Face(i as u64));
        scheduler.report_footprint(key, &Footprint::square(64.0));
    }
    // Two ticks per fetch wave of 32
    for _ in 0..count / 16 + 8 {
        scheduler.tick(Duration::from_millis(16));
    }
    scheduler
}

fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_tick");

    for count in [100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let mut scheduler = populated(count);
            let keys: Vec<TextureKey> = (0..count)
                .map(|i| TextureKey::from_u128(i as u128 + 1))
                .collect();

            b.iter(|| {
                for key in keys.iter().step_by(4) {
                    scheduler.report_footprint(*key, &Footprint::square(64.0));
                }
                black_box(scheduler.tick(Duration::from_millis(4)))
            });
        });
    }

    group.finish();
}

fn bench_scorer(c: &mut Criterion) {
    let scorer = PriorityScorer::default();
    let ladder = DiscardLadder::new(2048, 2048, 5);
    let footprints: Vec<Footprint> = (0..1024)
        .map(|i| {
            Footprint::new((i * 37 % 4096) as f32 * 64.0, (i % 200) as f32)
                .with_visibility((i % 10) as f32 / 10.0)
                .with_flags(if i % 16 == 0 { SurfaceFlags::ANIMATED } else { SurfaceFlags::empty() })
        })
        .collect();

    c.bench_function("score_and_level", |b| {
        b.iter(|| {
            let mut total = 0u32;
            for footprint in &footprints {
                let score = scorer.score(black_box(footprint));
                total += scorer.desired_level(
                    score.virtual_size,
                    &ladder,
                    2.0,
                    BoostClass::Scene,
                    score.importance,
                ) as u32;
            }
            black_box(total)
        });
    });
}

fn bench_stats(c: &mut Criterion) {
    let scheduler = populated(5000);
    c.bench_function("stats_5000", |b| b.iter(|| black_box(scheduler.stats())));
}

criterion_group!(benches, bench_tick, bench_scorer, bench_stats);
criterion_main!(benches);
