//! Benchmark the jitter buffer and the render callback hot path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use rtp_pcm_receiver::audio::buffer::{create_shared_buffer, PacketBuffer};
use rtp_pcm_receiver::audio::channel::ChannelMap;
use rtp_pcm_receiver::audio::render::{AudioRenderer, RenderEngine, RenderSettings};
use rtp_pcm_receiver::audio::stream::{ClampedStream, SharingMode, StreamInfo};
use rtp_pcm_receiver::audio::tuner::FixedLatency;
use rtp_pcm_receiver::config::LatencyMode;

const FRAMES: usize = 320;

fn bench_write_read_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_read_cycle");
    let bytes: Vec<u8> = (0..FRAMES * 2)
        .flat_map(|i| (i as i16).to_le_bytes())
        .collect();

    for capacity in [4usize, 15, 64].iter() {
        let buffer = PacketBuffer::new(*capacity, FRAMES * 2);
        group.bench_with_input(BenchmarkId::from_parameter(capacity), capacity, |b, _| {
            b.iter(|| {
                buffer.acquire_write_tail().fill_from_le_bytes(black_box(&bytes));
                buffer.commit_write_tail();
                let first = buffer.peek_read_head().map(|p| p.sample(0));
                buffer.advance_read_head();
                black_box(first)
            })
        });
    }

    group.finish();
}

fn bench_overflow_commit(c: &mut Criterion) {
    let buffer = PacketBuffer::new(15, FRAMES * 2);
    c.bench_function("overflow_commit", |b| {
        b.iter(|| black_box(buffer.commit_write_tail()))
    });
}

fn bench_render_callback(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_callback");

    for (name, mask, out_channels) in [("stereo", 0b11u32, 2usize), ("downmix_mono", 0b11, 1)] {
        let buffer = create_shared_buffer(15, FRAMES * 2);
        let stream = ClampedStream::new(
            StreamInfo {
                sharing_mode: SharingMode::Shared,
                performance_mode: LatencyMode::Normal,
                frames_per_burst: 96,
                buffer_capacity_in_frames: 4800,
                channels: out_channels as u16,
                sample_rate: 48000,
            },
            480,
        );
        let mut renderer = RenderEngine::new(
            buffer.clone(),
            RenderSettings {
                channels: ChannelMap::new(2, mask),
                target_packets: 8,
                fade_callbacks: 4,
            },
            Box::new(FixedLatency),
            Box::new(stream),
        );
        let mut out = vec![0i16; FRAMES * out_channels];

        group.bench_function(name, |b| {
            b.iter(|| {
                let slot = buffer.acquire_write_tail();
                for i in 0..slot.len() {
                    slot.set_sample(i, i as i16);
                }
                buffer.commit_write_tail();
                renderer.render(black_box(&mut out), out_channels);
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_write_read_cycle,
    bench_overflow_commit,
    bench_render_callback
);
criterion_main!(benches);
