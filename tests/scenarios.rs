//! End-to-end pipeline scenarios against the offline null sink.

use rp_engine::{Engine, EngineSettings, RenderStatus, StreamState};
use rp_format::{AudioFormat, ChannelLayout, DataFormat, StandardLayout, StreamType};
use rp_sink::{NullControl, NullDriver, Sink, SinkDriver, SinkRegistry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

fn engine(settings: EngineSettings) -> (Engine, NullControl) {
    let control = NullControl::new();
    control.set_capture(true);
    let mut registry = SinkRegistry::new();
    registry.register(Arc::new(NullDriver::with_control(control.clone())));
    (Engine::with_registry(settings, registry), control)
}

fn float_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_ne_bytes()).collect()
}

fn floats(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// 2ch/48k float in, 2ch/48k float out: nothing runs and bytes are untouched.
#[test]
fn matching_float_stream_is_bit_exact() {
    let (engine, control) = engine(EngineSettings::default());
    let stream = engine
        .make_stream(AudioFormat::float(48000, ChannelLayout::stereo()))
        .unwrap();
    let hw = engine.format().unwrap();
    assert_eq!(hw.data_format, DataFormat::Float);
    assert_eq!(hw.sample_rate, 48000);
    assert_eq!(hw.channel_count(), 2);

    let info = stream.chain_info();
    assert!(!info.convert && !info.remap && !info.upmix && !info.resample);

    let samples: Vec<f32> = (0..hw.frames as usize * 2)
        .map(|i| ((i % 200) as f32 / 100.0) - 1.0)
        .collect();
    let input = float_bytes(&samples);
    assert_eq!(stream.add_data(&input), input.len());
    engine.render_period().unwrap();
    assert_eq!(control.take_captured(), input);
}

/// 6ch/48k S16 in, 2ch float out: convert and downmix, never upmix.
#[test]
fn surround_s16_is_converted_and_downmixed() {
    let (engine, control) = engine(EngineSettings::default());
    let stream = engine
        .make_stream(AudioFormat::new(
            DataFormat::S16LE,
            48000,
            StandardLayout::L5_1.layout(),
        ))
        .unwrap();
    assert_eq!(engine.format().unwrap().channel_count(), 2);
    let info = stream.chain_info();
    assert!(info.convert);
    assert!(info.remap);
    assert!(!info.upmix);

    // FL = 0.5, everything else silent.
    let mut frame = [0i16; 6];
    frame[0] = 16384;
    let input: Vec<u8> = std::iter::repeat(frame)
        .take(960)
        .flatten()
        .flat_map(|s| s.to_le_bytes())
        .collect();
    assert_eq!(stream.add_data(&input), input.len());
    engine.render_period().unwrap();

    let out = floats(&control.take_captured());
    assert_eq!(out.len(), 960 * 2);
    assert!(out[0] > 0.0 && out[0] <= 0.5);
    assert_eq!(out[1], 0.0);
}

/// AC-3 passthrough: link format is 48k/2ch/16-bit and bytes arrive untouched.
#[test]
fn ac3_passthrough_is_bit_exact() {
    let mut settings = EngineSettings::default();
    settings.passthrough.enabled = true;
    settings.passthrough.ac3 = true;
    settings.sample_rate_mode = rp_engine::SampleRateMode::Fixed(96000);
    let (engine, control) = engine(settings);

    let stream = engine
        .make_stream(AudioFormat::raw(StreamType::Ac3, 48000))
        .unwrap();
    assert!(engine.is_passthrough());
    let hw = engine.format().unwrap();
    assert_eq!(hw.sample_rate, 48000);
    assert_eq!(hw.channel_count(), 2);
    assert_eq!(hw.frame_size, 4);
    assert!(stream.chain_info().passthrough);

    let period = hw.frames as usize * hw.frame_size as usize;
    let input: Vec<u8> = (0..period).map(|i| (i * 7 % 251) as u8).collect();
    assert_eq!(stream.add_data(&input), input.len());
    engine.render_period().unwrap();
    assert_eq!(control.take_captured(), input);
}

/// Freeing a stream while it is being pulled yields valid audio or clean
/// silence, never anything in between.
#[test]
fn free_stream_during_render_is_clean() {
    let (engine, _control) = engine(EngineSettings::default());
    let engine = Arc::new(engine);
    engine.start().unwrap();

    for _ in 0..25 {
        let stream = engine
            .make_stream(AudioFormat::float(48000, ChannelLayout::stereo()))
            .unwrap();
        stream.add_data(&float_bytes(&vec![0.5; 48000]));

        let barrier = Arc::new(Barrier::new(2));
        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let stream = stream.clone();
            let barrier = barrier.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut out = vec![0.0f32; 256];
                barrier.wait();
                while !done.load(Ordering::Relaxed) {
                    let RenderStatus { frames, silent } = stream.get_frames(&mut out);
                    assert!(out[..frames * 2].iter().all(|&s| s == 0.5));
                    assert!(out[frames * 2..].iter().all(|&s| s == 0.0));
                    if silent {
                        assert_eq!(frames, 0);
                    }
                }
            })
        };

        barrier.wait();
        std::thread::sleep(Duration::from_micros(200));
        engine.free_stream(&stream);
        assert_eq!(stream.state(), StreamState::Destroyed);

        let mut out = vec![1.0f32; 64];
        assert!(stream.get_frames(&mut out).silent);
        assert!(out.iter().all(|&s| s == 0.0));

        done.store(true, Ordering::Relaxed);
        reader.join().unwrap();
    }
    assert_eq!(engine.stream_count(), 0);
    engine.shutdown();
}

/// A rate the device lacks is replaced by one it enumerates, and open succeeds.
#[test]
fn unsupported_rate_negotiates_to_enumerated_rate() {
    let (engine, control) = engine(EngineSettings::default());
    control.set_supported_rates(Some(vec![44100, 48000]));

    let stream = engine
        .make_stream(AudioFormat::float(96000, ChannelLayout::stereo()))
        .unwrap();
    let hw = engine.format().unwrap();
    let devices = engine.enumerate_devices(true);
    assert!(devices
        .iter()
        .any(|(_, info)| info.sample_rates.contains(&hw.sample_rate)));
    assert_eq!(hw.sample_rate, 48000);
    assert!(stream.chain_info().resample);

    // The sink contract directly.
    let mut sink = NullDriver::with_control(control.clone()).create();
    let mut format = AudioFormat::float(22050, ChannelLayout::stereo());
    let mut device = String::from("default");
    sink.initialize(&mut format, &mut device).unwrap();
    assert!([44100, 48000].contains(&format.sample_rate));
    sink.deinitialize();
}
