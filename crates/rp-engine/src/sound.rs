//! Resident sound effects.
//!
//! A [`SoundEffect`] is decoded once and kept in memory as float samples.
//! When the engine opens a sink it prepares each sound for the hardware
//! layout and rate; every play takes a [`Voice`] holding a shared handle
//! to that prepared buffer plus its own cursor, so a buffer can never be
//! released while the mixer is still reading it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rp_format::{load_wav, AudioFormat, ChannelLayout};

use crate::convert::{resample_linear, to_float};
use crate::error::{EngineError, EngineResult};
use crate::remap::Remapper;

/// A sound converted to one hardware layout and rate.
#[derive(Debug)]
pub struct PreparedSound {
    samples: Vec<f32>,
    layout: ChannelLayout,
    sample_rate: u32,
}

impl PreparedSound {
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn channels(&self) -> usize {
        self.layout.count()
    }

    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels().max(1)
    }
}

struct SoundInner {
    samples: Vec<f32>,
    layout: ChannelLayout,
    sample_rate: u32,
    volume: AtomicU32,
    prepared: Mutex<Option<Arc<PreparedSound>>>,
}

/// Shared handle to a decoded sound. Clones refer to the same sound.
#[derive(Clone)]
pub struct SoundEffect {
    inner: Arc<SoundInner>,
}

impl SoundEffect {
    /// Interleaved float samples in `layout` at `sample_rate`.
    pub fn from_samples(samples: Vec<f32>, layout: ChannelLayout, sample_rate: u32) -> EngineResult<Self> {
        if layout.is_empty() || layout.is_raw() || sample_rate == 0 {
            return Err(EngineError::InvalidFormat(format!(
                "sound effect needs a PCM layout and rate, got {} @ {} Hz",
                layout, sample_rate
            )));
        }
        let frames = samples.len() / layout.count();
        let mut samples = samples;
        samples.truncate(frames * layout.count());
        Ok(Self {
            inner: Arc::new(SoundInner {
                samples,
                layout,
                sample_rate,
                volume: AtomicU32::new(1.0f32.to_bits()),
                prepared: Mutex::new(None),
            }),
        })
    }

    /// Decode a RIFF/WAVE file.
    pub fn from_wav(bytes: &[u8]) -> EngineResult<Self> {
        let wav = load_wav(bytes)?;
        let fmt = &wav.format;
        let mut samples = vec![0.0f32; wav.frames() * fmt.channel_count()];
        let n = to_float(fmt.data_format, &wav.data, &mut samples);
        samples.truncate(n);
        Self::from_samples(samples, fmt.channel_layout.clone(), fmt.sample_rate)
    }

    /// A mono sine tone, used for beeps.
    pub fn tone(frequency: f32, duration_ms: u32, sample_rate: u32, amplitude: f32) -> EngineResult<Self> {
        let frames = (sample_rate as u64 * duration_ms as u64 / 1000) as usize;
        let w = std::f32::consts::TAU * frequency / sample_rate.max(1) as f32;
        // Short linear ramps keep the edges from clicking.
        let ramp = (sample_rate as usize / 200).min(frames / 2).max(1);
        let samples = (0..frames)
            .map(|i| {
                let edge = i.min(frames - 1 - i);
                let env = (edge as f32 / ramp as f32).min(1.0);
                (w * i as f32).sin() * amplitude * env
            })
            .collect();
        Self::from_samples(samples, ChannelLayout::from_slice(&[rp_format::Channel::FC]), sample_rate)
    }

    pub fn channel_layout(&self) -> &ChannelLayout {
        &self.inner.layout
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    pub fn frames(&self) -> usize {
        self.inner.samples.len() / self.inner.layout.count()
    }

    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.inner.sample_rate as f64
    }

    pub fn set_volume(&self, volume: f32) {
        self.inner
            .volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.inner.volume.load(Ordering::Relaxed))
    }

    /// Same underlying sound.
    pub fn ptr_eq(&self, other: &SoundEffect) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Convert for `hw`, reusing the cached result when layout and rate match.
    pub fn prepare(&self, hw: &AudioFormat, normalize: bool) -> Arc<PreparedSound> {
        let mut slot = self.inner.prepared.lock();
        if let Some(p) = slot.as_ref() {
            if p.sample_rate == hw.sample_rate && p.layout == hw.channel_layout {
                return p.clone();
            }
        }

        let src = &self.inner;
        let remapped = if src.layout == hw.channel_layout {
            src.samples.clone()
        } else {
            let remap = Remapper::new(&src.layout, &hw.channel_layout, normalize);
            let frames = src.samples.len() / src.layout.count();
            let mut out = vec![0.0f32; frames * hw.channel_count()];
            remap.process(&src.samples, &mut out, frames);
            out
        };
        let samples = resample_linear(&remapped, hw.channel_count(), src.sample_rate, hw.sample_rate);

        let prepared = Arc::new(PreparedSound {
            samples,
            layout: hw.channel_layout.clone(),
            sample_rate: hw.sample_rate,
        });
        *slot = Some(prepared.clone());
        prepared
    }

    /// The current prepared buffer, if any.
    pub fn prepared(&self) -> Option<Arc<PreparedSound>> {
        self.inner.prepared.lock().clone()
    }
}

impl std::fmt::Debug for SoundEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundEffect")
            .field("layout", &self.inner.layout)
            .field("sample_rate", &self.inner.sample_rate)
            .field("frames", &self.frames())
            .finish()
    }
}

/// One active play of a sound.
pub struct Voice {
    sound: SoundEffect,
    buffer: Arc<PreparedSound>,
    cursor: usize,
}

impl Voice {
    pub fn new(sound: SoundEffect, buffer: Arc<PreparedSound>) -> Self {
        Self {
            sound,
            buffer,
            cursor: 0,
        }
    }

    pub fn sound(&self) -> &SoundEffect {
        &self.sound
    }

    /// Start over from the first frame.
    pub fn restart(&mut self) {
        self.cursor = 0;
    }

    /// Swap in a buffer prepared for a new hardware format, keeping the
    /// position in time.
    pub fn rebind(&mut self, buffer: Arc<PreparedSound>) {
        let seconds = self.cursor as f64 / self.buffer.sample_rate.max(1) as f64;
        self.cursor = ((seconds * buffer.sample_rate as f64) as usize).min(buffer.frames());
        self.buffer = buffer;
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.buffer.frames()
    }

    /// Add the next frames into `out` (interleaved, `channels` wide).
    ///
    /// Returns `false` once the sound is exhausted.
    pub fn mix_into(&mut self, out: &mut [f32], channels: usize) -> bool {
        let ch = self.buffer.channels();
        if ch != channels || ch == 0 {
            return false;
        }
        let frames = (out.len() / ch).min(self.buffer.frames() - self.cursor.min(self.buffer.frames()));
        let gain = self.sound.volume();
        let start = self.cursor * ch;
        let src = &self.buffer.samples[start..start + frames * ch];
        for (o, s) in out[..frames * ch].iter_mut().zip(src) {
            *o += s * gain;
        }
        self.cursor += frames;
        !self.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rp_format::{DataFormat, StandardLayout};

    fn wav_bytes(samples: &[i16], channels: u16, rate: u32) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let mut v = Vec::new();
        v.extend_from_slice(b"RIFF");
        v.extend_from_slice(&(36 + data_len).to_le_bytes());
        v.extend_from_slice(b"WAVEfmt ");
        v.extend_from_slice(&16u32.to_le_bytes());
        v.extend_from_slice(&1u16.to_le_bytes());
        v.extend_from_slice(&channels.to_le_bytes());
        v.extend_from_slice(&rate.to_le_bytes());
        v.extend_from_slice(&(rate * channels as u32 * 2).to_le_bytes());
        v.extend_from_slice(&(channels * 2).to_le_bytes());
        v.extend_from_slice(&16u16.to_le_bytes());
        v.extend_from_slice(b"data");
        v.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            v.extend_from_slice(&s.to_le_bytes());
        }
        v
    }

    #[test]
    fn wav_decodes_to_float() {
        let sound = SoundEffect::from_wav(&wav_bytes(&[16384, -16384, 0, 0], 2, 22050)).unwrap();
        assert_eq!(sound.frames(), 2);
        assert_eq!(sound.sample_rate(), 22050);
        assert_eq!(sound.channel_layout(), &ChannelLayout::stereo());
    }

    #[test]
    fn raw_layout_is_rejected() {
        assert!(SoundEffect::from_samples(vec![0.0; 4], ChannelLayout::raw(2), 48000).is_err());
        assert!(SoundEffect::from_samples(vec![0.0; 4], ChannelLayout::stereo(), 0).is_err());
    }

    #[test]
    fn prepare_remaps_and_resamples_once() {
        let sound = SoundEffect::from_samples(vec![0.5; 100], StandardLayout::Mono.layout(), 24000).unwrap();
        let hw = AudioFormat::new(DataFormat::Float, 48000, ChannelLayout::stereo());
        let a = sound.prepare(&hw, true);
        assert_eq!(a.channels(), 2);
        assert!((199..=201).contains(&a.frames()), "{}", a.frames());
        assert!(a.samples().iter().all(|&s| (s - 0.5).abs() < 1e-6));
        let b = sound.prepare(&hw, true);
        assert!(Arc::ptr_eq(&a, &b));

        let hw51 = AudioFormat::float(48000, StandardLayout::L5_1.layout());
        let c = sound.prepare(&hw51, true);
        assert_eq!(c.channels(), 6);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn voice_mixes_additively_and_finishes() {
        let sound = SoundEffect::from_samples(vec![0.25; 6], ChannelLayout::stereo(), 48000).unwrap();
        sound.set_volume(0.5);
        let hw = AudioFormat::float(48000, ChannelLayout::stereo());
        let mut voice = Voice::new(sound.clone(), sound.prepare(&hw, true));

        let mut out = [0.5f32; 4];
        assert!(voice.mix_into(&mut out, 2));
        assert_eq!(out, [0.625; 4]);

        let mut out = [0.0f32; 4];
        assert!(!voice.mix_into(&mut out, 2));
        assert_eq!(out, [0.125, 0.125, 0.0, 0.0]);
        assert!(voice.is_finished());

        voice.restart();
        assert!(!voice.is_finished());
    }

    #[test]
    fn tone_has_expected_length_and_peak() {
        let tone = SoundEffect::tone(440.0, 100, 48000, 0.5).unwrap();
        assert_eq!(tone.frames(), 4800);
        let hw = AudioFormat::float(48000, StandardLayout::Mono.layout());
        let peak = tone
            .prepare(&hw, true)
            .samples()
            .iter()
            .fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak <= 0.5 && peak > 0.45);
    }

    #[test]
    fn clones_share_identity() {
        let a = SoundEffect::from_samples(vec![0.0; 2], ChannelLayout::stereo(), 48000).unwrap();
        let b = a.clone();
        let c = SoundEffect::from_samples(vec![0.0; 2], ChannelLayout::stereo(), 48000).unwrap();
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        b.set_volume(0.3);
        assert!((a.volume() - 0.3).abs() < 1e-6);
    }
}
