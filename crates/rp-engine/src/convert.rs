//! Sample format conversion and rate conversion.
//!
//! Every PCM [`DataFormat`] converts to and from interleaved `f32`. A
//! [`Converter`] picks the conversion routine once for a source format so
//! the per-call cost is a single indirect call over the whole buffer.

use rp_format::DataFormat;

const S8_SCALE: f32 = 128.0;
const S16_SCALE: f32 = 32768.0;
const S24_SCALE: f32 = 8388608.0;
const S32_SCALE: f64 = 2147483648.0;

type DecodeFn = fn(&[u8], &mut [f32]) -> usize;
type EncodeFn = fn(&[f32], &mut [u8]) -> usize;

fn decode<const N: usize>(src: &[u8], dst: &mut [f32], f: impl Fn([u8; N]) -> f32) -> usize {
    let mut n = 0;
    for (chunk, out) in src.chunks_exact(N).zip(dst.iter_mut()) {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(chunk);
        *out = f(bytes);
        n += 1;
    }
    n
}

fn encode<const N: usize>(src: &[f32], dst: &mut [u8], f: impl Fn(f32) -> [u8; N]) -> usize {
    let mut n = 0;
    for (sample, chunk) in src.iter().zip(dst.chunks_exact_mut(N)) {
        chunk.copy_from_slice(&f(sample.clamp(-1.0, 1.0)));
        n += N;
    }
    n
}

fn sign_extend_24(v: i32) -> i32 {
    (v << 8) >> 8
}

fn to_i16(x: f32) -> i16 {
    (x * S16_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

fn to_i24(x: f32) -> i32 {
    (x * S24_SCALE).round().clamp(-S24_SCALE, S24_SCALE - 1.0) as i32
}

fn to_i32(x: f32) -> i32 {
    (x as f64 * S32_SCALE).round().clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

fn decoder(format: DataFormat) -> Option<DecodeFn> {
    let f: DecodeFn = match format.to_explicit_endian() {
        DataFormat::U8 => |s, d| decode::<1>(s, d, |b| (b[0] as f32 - 128.0) / S8_SCALE),
        DataFormat::S8 => |s, d| decode::<1>(s, d, |b| b[0] as i8 as f32 / S8_SCALE),
        DataFormat::S16LE => |s, d| decode::<2>(s, d, |b| i16::from_le_bytes(b) as f32 / S16_SCALE),
        DataFormat::S16BE => |s, d| decode::<2>(s, d, |b| i16::from_be_bytes(b) as f32 / S16_SCALE),
        DataFormat::S32LE => |s, d| decode::<4>(s, d, |b| (i32::from_le_bytes(b) as f64 / S32_SCALE) as f32),
        DataFormat::S32BE => |s, d| decode::<4>(s, d, |b| (i32::from_be_bytes(b) as f64 / S32_SCALE) as f32),
        DataFormat::S24LE4 => {
            |s, d| decode::<4>(s, d, |b| sign_extend_24(i32::from_le_bytes(b)) as f32 / S24_SCALE)
        }
        DataFormat::S24BE4 => {
            |s, d| decode::<4>(s, d, |b| sign_extend_24(i32::from_be_bytes(b)) as f32 / S24_SCALE)
        }
        DataFormat::S24NE4MSB => {
            |s, d| decode::<4>(s, d, |b| (i32::from_ne_bytes(b) >> 8) as f32 / S24_SCALE)
        }
        DataFormat::S24LE3 => {
            |s, d| decode::<3>(s, d, |b| sign_extend_24(i32::from_le_bytes([b[0], b[1], b[2], 0])) as f32 / S24_SCALE)
        }
        DataFormat::S24BE3 => {
            |s, d| decode::<3>(s, d, |b| sign_extend_24(i32::from_be_bytes([0, b[0], b[1], b[2]])) as f32 / S24_SCALE)
        }
        DataFormat::Float => |s, d| decode::<4>(s, d, f32::from_ne_bytes),
        DataFormat::Double => |s, d| decode::<8>(s, d, |b| f64::from_ne_bytes(b) as f32),
        _ => return None,
    };
    Some(f)
}

fn encoder(format: DataFormat) -> Option<EncodeFn> {
    let f: EncodeFn = match format.to_explicit_endian() {
        DataFormat::U8 => |s, d| encode::<1>(s, d, |x| [((x * S8_SCALE).round() + 128.0).clamp(0.0, 255.0) as u8]),
        DataFormat::S8 => |s, d| encode::<1>(s, d, |x| [(x * S8_SCALE).round().clamp(-128.0, 127.0) as i8 as u8]),
        DataFormat::S16LE => |s, d| encode::<2>(s, d, |x| to_i16(x).to_le_bytes()),
        DataFormat::S16BE => |s, d| encode::<2>(s, d, |x| to_i16(x).to_be_bytes()),
        DataFormat::S32LE => |s, d| encode::<4>(s, d, |x| to_i32(x).to_le_bytes()),
        DataFormat::S32BE => |s, d| encode::<4>(s, d, |x| to_i32(x).to_be_bytes()),
        DataFormat::S24LE4 => |s, d| encode::<4>(s, d, |x| to_i24(x).to_le_bytes()),
        DataFormat::S24BE4 => |s, d| encode::<4>(s, d, |x| to_i24(x).to_be_bytes()),
        DataFormat::S24NE4MSB => |s, d| encode::<4>(s, d, |x| (to_i24(x) << 8).to_ne_bytes()),
        DataFormat::S24LE3 => |s, d| {
            encode::<3>(s, d, |x| {
                let b = to_i24(x).to_le_bytes();
                [b[0], b[1], b[2]]
            })
        },
        DataFormat::S24BE3 => |s, d| {
            encode::<3>(s, d, |x| {
                let b = to_i24(x).to_be_bytes();
                [b[1], b[2], b[3]]
            })
        },
        DataFormat::Float => |s, d| encode::<4>(s, d, f32::to_ne_bytes),
        DataFormat::Double => |s, d| encode::<8>(s, d, |x| (x as f64).to_ne_bytes()),
        _ => return None,
    };
    Some(f)
}

/// Convert interleaved samples in `format` to `f32`.
///
/// Converts `min(src.len() / bytes_per_sample, dst.len())` samples and
/// returns that count. Unsupported formats (`Raw`, `Invalid`) produce 0.
pub fn to_float(format: DataFormat, src: &[u8], dst: &mut [f32]) -> usize {
    decoder(format).map_or(0, |f| f(src, dst))
}

/// Convert `f32` samples to `format`, clamping to [-1, 1].
///
/// Returns the number of bytes written.
pub fn from_float(format: DataFormat, src: &[f32], dst: &mut [u8]) -> usize {
    encoder(format).map_or(0, |f| f(src, dst))
}

/// A source-format-to-float conversion, chosen once.
#[derive(Clone, Copy)]
pub struct Converter {
    format: DataFormat,
    decode: DecodeFn,
}

impl Converter {
    /// `None` for formats with no PCM meaning.
    pub fn new(format: DataFormat) -> Option<Self> {
        Some(Self {
            format,
            decode: decoder(format)?,
        })
    }

    pub fn format(&self) -> DataFormat {
        self.format
    }

    /// Converts into `dst`, returning the number of samples produced.
    pub fn convert(&self, src: &[u8], dst: &mut [f32]) -> usize {
        (self.decode)(src, dst)
    }
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter").field("format", &self.format).finish()
    }
}

/// Streaming linear-interpolation rate converter for interleaved frames.
///
/// State carries across calls, so a stream split into arbitrary chunks
/// resamples exactly like the concatenated input.
#[derive(Clone, Debug)]
pub struct LinearResampler {
    channels: usize,
    from_rate: u32,
    to_rate: u32,
    /// Input frames advanced per output frame
    step: f64,
    /// Position of the next output frame; `-1.0` is the previous frame
    pos: f64,
    prev: Vec<f32>,
    primed: bool,
}

/// Saved resampler position, used to undo a chunk that was not accepted.
#[derive(Clone, Debug)]
pub struct ResamplerState {
    pos: f64,
    prev: Vec<f32>,
    primed: bool,
}

impl LinearResampler {
    pub fn new(channels: usize, from_rate: u32, to_rate: u32) -> Self {
        Self {
            channels: channels.max(1),
            from_rate,
            to_rate,
            step: from_rate as f64 / to_rate.max(1) as f64,
            pos: 0.0,
            prev: vec![0.0; channels.max(1)],
            primed: false,
        }
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Output frames per input frame.
    pub fn ratio(&self) -> f64 {
        1.0 / self.step
    }

    pub fn reset(&mut self) {
        self.pos = 0.0;
        self.primed = false;
    }

    pub fn save(&self) -> ResamplerState {
        ResamplerState {
            pos: self.pos,
            prev: self.prev.clone(),
            primed: self.primed,
        }
    }

    pub fn restore(&mut self, state: ResamplerState) {
        self.pos = state.pos;
        self.prev = state.prev;
        self.primed = state.primed;
    }

    /// Resample `input` and append the produced frames to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        let ch = self.channels;
        let n = input.len() / ch;
        if n == 0 {
            return;
        }
        if !self.primed {
            self.prev.copy_from_slice(&input[..ch]);
            self.pos = 0.0;
            self.primed = true;
        }

        let frame = |i: isize, c: usize| -> f32 {
            if i < 0 {
                self.prev[c]
            } else {
                input[i as usize * ch + c]
            }
        };

        let last = (n - 1) as f64;
        let mut t = self.pos;
        while t < last {
            let i0 = t.floor();
            let frac = (t - i0) as f32;
            let i0 = i0 as isize;
            for c in 0..ch {
                let a = frame(i0, c);
                let b = frame(i0 + 1, c);
                out.push(a + (b - a) * frac);
            }
            t += self.step;
        }
        self.pos = t - n as f64;
        self.prev.copy_from_slice(&input[(n - 1) * ch..n * ch]);
    }
}

/// One-shot linear resample of a whole interleaved buffer.
pub fn resample_linear(input: &[f32], channels: usize, from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return input.to_vec();
    }
    let mut resampler = LinearResampler::new(channels, from_rate, to_rate);
    let frames = input.len() / channels.max(1);
    let mut out = Vec::with_capacity((frames as u64 * to_rate as u64 / from_rate as u64) as usize * channels + channels);
    resampler.process(input, &mut out);
    // Flush the final input frame.
    let tail: Vec<f32> = input[input.len() - channels.min(input.len())..].to_vec();
    resampler.process(&tail, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(format: DataFormat, samples: &[f32], tolerance: f32) {
        let bps = format.bytes_per_sample();
        let mut bytes = vec![0u8; samples.len() * bps];
        assert_eq!(from_float(format, samples, &mut bytes), bytes.len());
        let mut back = vec![0.0f32; samples.len()];
        assert_eq!(to_float(format, &bytes, &mut back), samples.len());
        for (a, b) in samples.iter().zip(&back) {
            assert!((a - b).abs() <= tolerance, "{}: {} -> {}", format, a, b);
        }
    }

    #[test]
    fn every_pcm_format_round_trips_within_quantization() {
        let samples = [0.0, 0.5, -0.5, 0.25, -1.0, 0.999, -0.123];
        for format in DataFormat::PCM {
            let tolerance = match format.bits_per_sample() {
                8 => 1.0 / 127.0,
                16 => 1.0 / 32767.0,
                24 => 1.0 / 8388607.0,
                _ => 1e-6,
            };
            round_trip(format, &samples, tolerance);
        }
    }

    #[test]
    fn integer_samples_survive_exactly() {
        let values: Vec<i16> = vec![0, 1, -1, 1000, -32768, 32767];
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut floats = vec![0.0; values.len()];
        to_float(DataFormat::S16LE, &bytes, &mut floats);
        let mut back = vec![0u8; bytes.len()];
        from_float(DataFormat::S16LE, &floats, &mut back);
        assert_eq!(back, bytes);
    }

    #[test]
    fn known_values() {
        let mut out = [0.0f32; 3];
        to_float(DataFormat::U8, &[128, 0, 192], &mut out);
        assert_eq!(out, [0.0, -1.0, 0.5]);

        to_float(DataFormat::S24LE3, &[0, 0, 0x80, 0xff, 0xff, 0x7f, 0, 0, 0x40], &mut out);
        assert_eq!(out[0], -1.0);
        assert!((out[1] - 1.0).abs() < 1e-6);
        assert_eq!(out[2], 0.5);

        to_float(DataFormat::S16BE, &[0x40, 0x00, 0xc0, 0x00], &mut out[..2]);
        assert_eq!(&out[..2], &[0.5, -0.5]);
    }

    #[test]
    fn s24_in_4_bytes_sign_extends() {
        let bytes = 0x00ff_ffffu32.to_le_bytes();
        let mut out = [0.0f32; 1];
        to_float(DataFormat::S24LE4, &bytes, &mut out);
        assert!((out[0] + 1.0 / S24_SCALE).abs() < 1e-9);
    }

    #[test]
    fn from_float_clamps() {
        let mut out = [0u8; 4];
        from_float(DataFormat::S16LE, &[2.0, -2.0], &mut out);
        assert_eq!(i16::from_le_bytes([out[0], out[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([out[2], out[3]]), i16::MIN);
    }

    #[test]
    fn raw_and_invalid_have_no_converter() {
        assert!(Converter::new(DataFormat::Raw).is_none());
        assert!(Converter::new(DataFormat::Invalid).is_none());
        assert_eq!(to_float(DataFormat::Raw, &[0; 4], &mut [0.0; 2]), 0);
        let c = Converter::new(DataFormat::S16NE).unwrap();
        let mut out = [0.0f32; 2];
        assert_eq!(c.convert(&[0; 4], &mut out), 2);
    }

    #[test]
    fn conversion_stops_at_shorter_buffer() {
        let mut out = [0.0f32; 1];
        assert_eq!(to_float(DataFormat::S16LE, &[0; 8], &mut out), 1);
        let mut bytes = [0u8; 3];
        assert_eq!(from_float(DataFormat::S16LE, &[0.0; 4], &mut bytes), 2);
    }

    #[test]
    fn resampler_identity_rate_copies() {
        let mut r = LinearResampler::new(1, 48000, 48000);
        let mut out = Vec::new();
        r.process(&[0.0, 1.0, 2.0, 3.0], &mut out);
        r.process(&[4.0, 5.0], &mut out);
        // The last frame of each chunk is emitted with the next one.
        assert_eq!(out, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn resampler_upsamples_by_interpolation() {
        let mut r = LinearResampler::new(1, 1, 2);
        let mut out = Vec::new();
        r.process(&[0.0, 1.0, 2.0], &mut out);
        assert_eq!(out, vec![0.0, 0.5, 1.0, 1.5]);
    }

    #[test]
    fn resampler_chunking_is_transparent() {
        let input: Vec<f32> = (0..100).map(|i| (i as f32 * 0.1).sin()).collect();
        let mut whole = Vec::new();
        LinearResampler::new(1, 44100, 48000).process(&input, &mut whole);

        let mut chunked = Vec::new();
        let mut r = LinearResampler::new(1, 44100, 48000);
        for chunk in input.chunks(7) {
            r.process(chunk, &mut chunked);
        }
        assert_eq!(whole.len(), chunked.len());
        for (a, b) in whole.iter().zip(&chunked) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn resampler_save_restore() {
        let mut r = LinearResampler::new(2, 44100, 48000);
        let mut out = Vec::new();
        r.process(&[0.1, 0.2, 0.3, 0.4], &mut out);
        let saved = r.save();
        let mut a = Vec::new();
        r.process(&[0.5, 0.6, 0.7, 0.8], &mut a);
        r.restore(saved);
        let mut b = Vec::new();
        r.process(&[0.5, 0.6, 0.7, 0.8], &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn one_shot_resample_length() {
        let input = vec![0.0f32; 2 * 441];
        let out = resample_linear(&input, 2, 44100, 48000);
        let frames = out.len() / 2;
        assert!((479..=484).contains(&frames), "{} frames", frames);
        assert_eq!(resample_linear(&input, 2, 48000, 48000).len(), input.len());
    }
}
