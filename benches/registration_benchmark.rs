use criterion::{black_box, criterion_group, criterion_main, Criterion};
use criterion::BenchmarkId;
use ndarray::prelude::*;
use rand;

use corrosuite::config::{DetectionConfig, RigidConfig};
use corrosuite::data::dimensions::Dimensions;
use corrosuite::detection;
use corrosuite::fourier::{CorrelationOptions, FftEngine};
use corrosuite::registration::rigid::{self, RigidContext};
use corrosuite::CancelToken;

const YDIM : usize = 256;
const XDIM : usize = 256;

/// Noisy frame with a handful of bright structures, the kind of
/// content phase correlation sees in practice.
fn synthetic_frame() -> Array2<f32> {
    let mut frame = Array2::<f32>::from_shape_fn((YDIM, XDIM), |_| {
        rand::random::<f32>()
    });
    for blob in 0..12 {
        let cy = (blob * 41 + 30) % YDIM;
        let cx = (blob * 67 + 50) % XDIM;
        for y in cy.saturating_sub(6)..(cy + 7).min(YDIM) {
            for x in cx.saturating_sub(6)..(cx + 7).min(XDIM) {
                let d2 = (y as f32 - cy as f32).powi(2) + (x as f32 - cx as f32).powi(2);
                frame[[y, x]] += 20.0 * (-d2 / 10.0).exp();
            }
        }
    }
    frame
}

fn synthetic_stack(n_frames : usize) -> Array3<f32> {
    let base = synthetic_frame();
    let mut stack = Array3::<f32>::zeros((n_frames, YDIM, XDIM));
    for t in 0..n_frames {
        let dy = (t % 7) as i32 - 3;
        let dx = (t % 5) as i32 - 2;
        let shifted = corrosuite::registration::shifted(
            base.view(), dy, dx, corrosuite::registration::EdgeFill::Wrap);
        stack.index_axis_mut(Axis(0), t).assign(&shifted);
    }
    stack
}

fn criterion_benchmark_phasecorr(c : &mut Criterion) {
    let mut bench_group = c.benchmark_group("Phase correlation benchmarks");

    let dims = Dimensions::new(XDIM, YDIM);
    let engine = FftEngine::new(dims, &CorrelationOptions::default());
    let reference = synthetic_frame();
    let ctx = RigidContext::new(&engine, reference.view(), &RigidConfig::default()).unwrap();
    let frame = synthetic_frame();

    bench_group.bench_with_input(
        BenchmarkId::new("Single frame shift estimate, 256x256", 1),
        &frame,
        |bench, frame| {
            bench.iter(|| black_box(rigid::phasecorr(&engine, &ctx, frame.view())))
        },
    );
    bench_group.finish();
}

fn criterion_benchmark_rigid_stack(c : &mut Criterion) {
    let mut bench_group = c.benchmark_group("Rigid stack registration benchmarks");
    bench_group.sample_size(10);

    let dims = Dimensions::new(XDIM, YDIM);
    let engine = FftEngine::new(dims, &CorrelationOptions::default());
    let reference = synthetic_frame();
    let cfg = RigidConfig::default();
    let cancel = CancelToken::new();

    for n_frames in [40usize, 200] {
        bench_group.bench_with_input(
            BenchmarkId::new("Register stack in place, 256x256", n_frames),
            &n_frames,
            |bench, &n_frames| {
                bench.iter_batched(
                    || synthetic_stack(n_frames),
                    |mut stack| {
                        black_box(rigid::register_stack(
                            &mut stack, reference.view(), &engine,
                            &cfg, 20, &cancel,
                        ).unwrap())
                    },
                    criterion::BatchSize::LargeInput,
                )
            },
        );
    }
    bench_group.finish();
}

fn criterion_benchmark_detection(c : &mut Criterion) {
    let mut bench_group = c.benchmark_group("Detection benchmarks");
    bench_group.sample_size(10);

    let stack = synthetic_stack(40);
    let cfg = DetectionConfig::default();
    let cancel = CancelToken::new();

    bench_group.bench_with_input(
        BenchmarkId::new("Detect ROIs, 40 frames 256x256", 40),
        &stack,
        |bench, stack| {
            bench.iter(|| {
                black_box(detection::detect_rois(stack.view(), &cfg, &cancel).unwrap())
            })
        },
    );
    bench_group.finish();
}

criterion_group!(
    benches,
    criterion_benchmark_phasecorr,
    criterion_benchmark_rigid_stack,
    criterion_benchmark_detection,
);
criterion_main!(benches);
