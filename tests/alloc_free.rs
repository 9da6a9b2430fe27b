//! Allocation-free render path tests.
//!
//! Everything the render thread does once per period (stream pulls, the
//! mixer graph, a full engine period on an offline sink) must run without
//! touching the heap. Setup happens outside the checked closures.
//!
//! Just run `cargo test`; no feature flags needed.

use assert_no_alloc::{assert_no_alloc, AllocDisabler};

#[cfg(debug_assertions)]
#[global_allocator]
static A: AllocDisabler = AllocDisabler;

use rp_engine::{Engine, EngineSettings, SinkTiming, SoundEffect, Stream, StreamConfig};
use rp_format::{AudioFormat, ChannelLayout, DataFormat, StandardLayout};
use rp_sink::{GraphSource, MixerGraph, NullDriver, SinkRegistry};
use std::sync::Arc;

fn pcm(frames: usize, channels: usize, value: f32) -> Vec<u8> {
    std::iter::repeat(value.to_ne_bytes())
        .take(frames * channels)
        .flatten()
        .collect()
}

fn stream(format: AudioFormat, hw: &AudioFormat) -> Arc<Stream> {
    let s = Stream::new(1, format, StreamConfig::default(), Arc::new(SinkTiming::default())).unwrap();
    s.initialize(hw).unwrap();
    Arc::new(s)
}

#[test]
fn stream_get_frames_alloc_free() {
    let hw = AudioFormat::float(48000, StandardLayout::L5_1.layout());
    let s = stream(AudioFormat::float(48000, StandardLayout::L5_1.layout()), &hw);
    s.add_data(&pcm(4800, 6, 0.25));
    s.fade_volume(0.0, 1.0, 50);
    let mut out = vec![0.0f32; 480 * 6];

    assert_no_alloc(|| {
        for _ in 0..12 {
            s.get_frames(&mut out);
        }
    });
}

#[test]
fn mixer_graph_render_alloc_free() {
    let hw = AudioFormat::float(48000, ChannelLayout::stereo());
    let mut graph = MixerGraph::new(2);
    graph.set_max_frames(256);
    let mut sources = Vec::new();
    for _ in 0..4 {
        let s = stream(AudioFormat::new(DataFormat::S16LE, 48000, ChannelLayout::stereo()), &hw);
        s.add_data(&vec![0u8; 48000 * 4 / 2]);
        let bus = graph.attach(s.clone() as Arc<dyn GraphSource>).unwrap();
        graph.set_input_gain(bus, 0.5);
        sources.push(s);
    }
    let mut out = vec![0.0f32; 960 * 2];

    assert_no_alloc(|| {
        for _ in 0..10 {
            graph.render(&mut out);
        }
    });
}

#[test]
fn engine_render_period_alloc_free() {
    let mut registry = SinkRegistry::new();
    registry.register(Arc::new(NullDriver::offline()));
    let engine = Engine::with_registry(EngineSettings::default(), registry);
    let s = engine.make_stream(AudioFormat::float(48000, ChannelLayout::stereo())).unwrap();
    s.add_data(&pcm(9600, 2, 0.1));
    let sound = SoundEffect::from_samples(vec![0.1; 4800], ChannelLayout::stereo(), 48000).unwrap();
    engine.play_sound(&sound).unwrap();
    // First period starts the sink clock.
    engine.render_period().unwrap();

    assert_no_alloc(|| {
        for _ in 0..5 {
            engine.render_period().unwrap();
        }
    });
}
