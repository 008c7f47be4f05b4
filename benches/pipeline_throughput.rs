//! Pipeline Throughput Benchmarks
//!
//! Measures the software backend on its own and the full capture → encode →
//! drain round trip through the encode thread.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use lamco_encode_pipeline::backend::software::{SoftwareBackend, SoftwareCodec, SoftwareFactory};
use lamco_encode_pipeline::backend::{EncoderBackend, PollStatus, SubmitParams};
use lamco_encode_pipeline::config::{EncoderConfig, PipelineSettings};
use lamco_encode_pipeline::encoder::{Encoder, FrameCookie, Resolution, VideoFrame};

const RESOLUTIONS: [(u32, u32, &str); 2] = [(640, 480, "480p"), (1280, 720, "720p")];

fn config(width: u32, height: u32) -> EncoderConfig {
    EncoderConfig {
        width,
        height,
        ..Default::default()
    }
}

/// Benchmark backend submit + poll without the pipeline around it
fn bench_backend_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("software_backend");
    group.sample_size(30);

    for codec in [SoftwareCodec::Raw, SoftwareCodec::Rle] {
        for (width, height, name) in RESOLUTIONS {
            let resolution = Resolution::new(width, height);
            // Alternate two frames so rle produces delta frames
            let frames = [
                VideoFrame::test_pattern(resolution, 0),
                VideoFrame::test_pattern(resolution, 1),
            ];
            group.throughput(Throughput::Elements(resolution.pixels()));

            group.bench_function(BenchmarkId::new(codec.name(), name), |b| {
                let mut backend = SoftwareBackend::new(codec, 0);
                backend.initialize(&config(width, height)).unwrap();
                let mut output = BytesMut::new();
                let mut n = 0usize;

                b.iter(|| {
                    let params = SubmitParams {
                        timestamp: Duration::ZERO,
                        duration: Duration::from_millis(33),
                        force_keyframe: false,
                        resolution,
                    };
                    backend.submit(&frames[n % 2], &params).unwrap();
                    n += 1;
                    output.clear();
                    let status = backend.poll_output(&mut output).unwrap();
                    assert!(matches!(status, PollStatus::Ready(_)));
                    black_box(output.len())
                })
            });
        }
    }

    group.finish();
}

/// Benchmark one frame through the encode thread and back
fn bench_pipeline_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_round_trip");
    group.sample_size(30);

    for (width, height, name) in RESOLUTIONS {
        let resolution = Resolution::new(width, height);
        let frame = VideoFrame::test_pattern(resolution, 0);
        group.throughput(Throughput::Elements(resolution.pixels()));

        group.bench_function(BenchmarkId::new("rle", name), |b| {
            let encoder = Encoder::new(
                Arc::new(SoftwareFactory::new()),
                "rle",
                config(width, height),
                PipelineSettings::manual_drain("rle", 3),
            )
            .unwrap();

            b.iter(|| {
                // Cloning shares the pixel buffer
                let slot = encoder
                    .capture(frame.clone(), Duration::ZERO, Duration::from_millis(33), None)
                    .unwrap();
                encoder.encode(slot, false, None, FrameCookie::empty()).unwrap();
                black_box(encoder.process_output().unwrap())
            })
        });
    }

    group.finish();
}

/// Benchmark slot acquisition when the pool is exhausted
fn bench_pool_exhaustion(c: &mut Criterion) {
    let encoder = Encoder::new(
        Arc::new(SoftwareFactory::with_latency(u32::MAX)),
        "raw",
        config(64, 64),
        PipelineSettings::manual_drain("raw", 3),
    )
    .unwrap();
    let frame = VideoFrame::test_pattern(Resolution::new(64, 64), 0);
    for _ in 0..3 {
        let slot = encoder
            .capture(frame.clone(), Duration::ZERO, Duration::ZERO, None)
            .unwrap();
        encoder.encode(slot, false, None, FrameCookie::empty()).unwrap();
    }

    c.bench_function("capture_exhausted", |b| {
        b.iter(|| {
            black_box(
                encoder
                    .capture(frame.clone(), Duration::ZERO, Duration::ZERO, None)
                    .is_err(),
            )
        })
    });
}

criterion_group!(
    benches,
    bench_backend_encode,
    bench_pipeline_round_trip,
    bench_pool_exhaustion
);
criterion_main!(benches);
