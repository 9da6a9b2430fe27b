//! RIFF/WAVE reading and writing for interleaved PCM.

use alloc::vec::Vec;

use crate::{AudioFormat, ChannelLayout, DataFormat, FormatError};

const WAVE_FORMAT_PCM: u16 = 1;
const WAVE_FORMAT_IEEE_FLOAT: u16 = 3;
const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// Size of the canonical header written by [`write_wav`].
const CANONICAL_HEADER: usize = 44;

/// Decoded WAV file: interleaved sample bytes in `format`.
#[derive(Clone, Debug, PartialEq)]
pub struct WavData {
    pub format: AudioFormat,
    pub data: Vec<u8>,
}

impl WavData {
    pub fn frames(&self) -> usize {
        self.format.bytes_to_frames(self.data.len())
    }
}

/// Contents of the `fmt ` chunk that matter for decoding.
#[derive(Clone, Copy, Debug)]
struct FmtChunk {
    tag: u16,
    channels: u16,
    rate: u32,
    bits: u16,
    mask: u32,
}

impl FmtChunk {
    fn parse(body: &[u8]) -> Option<Self> {
        if body.len() < 16 {
            return None;
        }
        let mut fmt = FmtChunk {
            tag: le16(body, 0),
            channels: le16(body, 2),
            rate: le32(body, 4),
            bits: le16(body, 14),
            mask: 0,
        };
        if fmt.tag == WAVE_FORMAT_EXTENSIBLE && body.len() >= 26 {
            fmt.mask = le32(body, 20);
            // The sub-format GUID starts with the real format tag.
            fmt.tag = le16(body, 24);
        }
        Some(fmt)
    }

    fn data_format(&self) -> Result<DataFormat, FormatError> {
        Ok(match (self.tag, self.bits) {
            (WAVE_FORMAT_PCM, 8) => DataFormat::U8,
            (WAVE_FORMAT_PCM, 16) => DataFormat::S16LE,
            (WAVE_FORMAT_PCM, 24) => DataFormat::S24LE3,
            (WAVE_FORMAT_PCM, 32) => DataFormat::S32LE,
            (WAVE_FORMAT_IEEE_FLOAT, 32) => DataFormat::Float,
            (WAVE_FORMAT_IEEE_FLOAT, 64) => DataFormat::Double,
            (tag, bits) => return Err(FormatError::UnsupportedEncoding(tag, bits)),
        })
    }

    /// Speaker mask when it agrees with the channel count, else the default order.
    fn layout(&self) -> ChannelLayout {
        let count = self.channels as usize;
        let from_mask = ChannelLayout::from_speaker_mask(self.mask);
        if self.mask != 0 && from_mask.count() == count {
            from_mask
        } else {
            ChannelLayout::default_for_count(count)
        }
    }
}

/// Walks RIFF sub-chunks as `(id, body)`, honouring the pad byte after odd sizes.
/// A body that runs past the end of the buffer is truncated.
struct Chunks<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = ([u8; 4], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let head = self.bytes.get(self.at..self.at + 8)?;
        let id = [head[0], head[1], head[2], head[3]];
        let len = le32(head, 4) as usize;
        let start = self.at + 8;
        let end = start.saturating_add(len).min(self.bytes.len());
        self.at = start.saturating_add(len).saturating_add(len & 1);
        Some((id, &self.bytes[start..end]))
    }
}

/// Parse a WAV file from raw bytes.
///
/// Supports PCM 8/16/24/32-bit, IEEE float 32/64-bit and the extensible
/// header (whose speaker mask, when consistent, gives the channel layout).
pub fn load_wav(bytes: &[u8]) -> Result<WavData, FormatError> {
    if bytes.len() < CANONICAL_HEADER {
        return Err(FormatError::UnexpectedEof);
    }
    if bytes[0..4] != *b"RIFF" || bytes[8..12] != *b"WAVE" {
        return Err(FormatError::InvalidHeader("missing RIFF/WAVE magic"));
    }

    let mut fmt = None;
    let mut body = None;
    for (id, chunk) in (Chunks { bytes, at: 12 }) {
        match &id {
            b"fmt " => fmt = FmtChunk::parse(chunk).or(fmt),
            b"data" => body = Some(chunk),
            _ => {}
        }
    }

    let fmt = fmt.ok_or(FormatError::InvalidHeader("no fmt chunk"))?;
    let body = body.ok_or(FormatError::InvalidHeader("no data chunk"))?;
    if fmt.channels == 0 || fmt.channels as usize > crate::MAX_CHANNELS {
        return Err(FormatError::InvalidHeader("bad channel count"));
    }
    if fmt.rate == 0 {
        return Err(FormatError::InvalidHeader("zero sample rate"));
    }

    let format = AudioFormat::new(fmt.data_format()?, fmt.rate, fmt.layout());
    let whole = format.frames_to_bytes(format.bytes_to_frames(body.len()));
    Ok(WavData {
        format,
        data: body[..whole].to_vec(),
    })
}

fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

#[cfg(any(feature = "std", test))]
/// Canonical 44-byte header for `data_len` bytes of sample data.
fn canonical_header(tag: u16, channels: u16, rate: u32, bits: u16, data_len: u32) -> [u8; CANONICAL_HEADER] {
    let block_align = channels * (bits / 8);
    let fields: [&[u8]; 13] = [
        b"RIFF",
        &(data_len + 36).to_le_bytes(),
        b"WAVE",
        b"fmt ",
        &16u32.to_le_bytes(),
        &tag.to_le_bytes(),
        &channels.to_le_bytes(),
        &rate.to_le_bytes(),
        &(rate * u32::from(block_align)).to_le_bytes(),
        &block_align.to_le_bytes(),
        &bits.to_le_bytes(),
        b"data",
        &data_len.to_le_bytes(),
    ];
    let mut header = [0u8; CANONICAL_HEADER];
    let mut at = 0;
    for field in fields {
        header[at..at + field.len()].copy_from_slice(field);
        at += field.len();
    }
    header
}

/// Write interleaved little-endian PCM or float `data` as a WAV file.
#[cfg(feature = "std")]
pub fn write_wav(w: &mut impl std::io::Write, format: &AudioFormat, data: &[u8]) -> std::io::Result<()> {
    let (tag, bits) = match format.data_format.to_explicit_endian() {
        DataFormat::U8 => (WAVE_FORMAT_PCM, 8u16),
        DataFormat::S16LE => (WAVE_FORMAT_PCM, 16),
        DataFormat::S24LE3 => (WAVE_FORMAT_PCM, 24),
        DataFormat::S32LE => (WAVE_FORMAT_PCM, 32),
        DataFormat::Float => (WAVE_FORMAT_IEEE_FLOAT, 32),
        DataFormat::Double => (WAVE_FORMAT_IEEE_FLOAT, 64),
        _ => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "sample format has no WAV encoding",
            ))
        }
    };
    let header = canonical_header(
        tag,
        format.channel_count() as u16,
        format.sample_rate,
        bits,
        data.len() as u32,
    );
    w.write_all(&header)?;
    w.write_all(data)
}
