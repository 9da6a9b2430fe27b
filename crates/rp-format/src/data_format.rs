//! Sample data formats.

use core::fmt;

/// Sample encoding of a PCM buffer, or `Raw` for framed compressed data.
///
/// `NE` variants resolve to the host byte order; `S24*4` variants carry
/// 24 valid bits in a 32-bit container (`MSB` = left-justified) and
/// `S24*3` variants are packed three bytes per sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataFormat {
    #[default]
    Invalid,
    U8,
    S8,
    S16BE,
    S16LE,
    S16NE,
    S32BE,
    S32LE,
    S32NE,
    S24BE4,
    S24LE4,
    S24NE4,
    S24NE4MSB,
    S24BE3,
    S24LE3,
    S24NE3,
    Double,
    Float,
    /// IEC 61937 framed bitstream, carried as 16-bit words
    Raw,
}

impl DataFormat {
    /// All PCM formats, in the order used for display and enumeration.
    pub const PCM: [DataFormat; 17] = [
        DataFormat::U8,
        DataFormat::S8,
        DataFormat::S16BE,
        DataFormat::S16LE,
        DataFormat::S16NE,
        DataFormat::S32BE,
        DataFormat::S32LE,
        DataFormat::S32NE,
        DataFormat::S24BE4,
        DataFormat::S24LE4,
        DataFormat::S24NE4,
        DataFormat::S24NE4MSB,
        DataFormat::S24BE3,
        DataFormat::S24LE3,
        DataFormat::S24NE3,
        DataFormat::Double,
        DataFormat::Float,
    ];

    /// Size of one sample in bytes (0 for `Invalid`).
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            DataFormat::Invalid => 0,
            DataFormat::U8 | DataFormat::S8 => 1,
            DataFormat::S16BE | DataFormat::S16LE | DataFormat::S16NE | DataFormat::Raw => 2,
            DataFormat::S24BE3 | DataFormat::S24LE3 | DataFormat::S24NE3 => 3,
            DataFormat::S32BE
            | DataFormat::S32LE
            | DataFormat::S32NE
            | DataFormat::S24BE4
            | DataFormat::S24LE4
            | DataFormat::S24NE4
            | DataFormat::S24NE4MSB
            | DataFormat::Float => 4,
            DataFormat::Double => 8,
        }
    }

    /// Number of significant bits per sample.
    pub const fn bits_per_sample(self) -> u32 {
        match self {
            DataFormat::S24BE4
            | DataFormat::S24LE4
            | DataFormat::S24NE4
            | DataFormat::S24NE4MSB
            | DataFormat::S24BE3
            | DataFormat::S24LE3
            | DataFormat::S24NE3 => 24,
            other => other.bytes_per_sample() as u32 * 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, DataFormat::Float | DataFormat::Double)
    }

    pub const fn is_raw(self) -> bool {
        matches!(self, DataFormat::Raw)
    }

    pub const fn is_valid(self) -> bool {
        !matches!(self, DataFormat::Invalid)
    }

    /// Resolve a native-endian variant to the concrete byte order of this host.
    pub const fn to_explicit_endian(self) -> DataFormat {
        #[cfg(target_endian = "little")]
        {
            match self {
                DataFormat::S16NE => DataFormat::S16LE,
                DataFormat::S32NE => DataFormat::S32LE,
                DataFormat::S24NE4 => DataFormat::S24LE4,
                DataFormat::S24NE3 => DataFormat::S24LE3,
                other => other,
            }
        }
        #[cfg(target_endian = "big")]
        {
            match self {
                DataFormat::S16NE => DataFormat::S16BE,
                DataFormat::S32NE => DataFormat::S32BE,
                DataFormat::S24NE4 => DataFormat::S24BE4,
                DataFormat::S24NE3 => DataFormat::S24BE3,
                other => other,
            }
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            DataFormat::Invalid => "invalid",
            DataFormat::U8 => "u8",
            DataFormat::S8 => "s8",
            DataFormat::S16BE => "s16be",
            DataFormat::S16LE => "s16le",
            DataFormat::S16NE => "s16ne",
            DataFormat::S32BE => "s32be",
            DataFormat::S32LE => "s32le",
            DataFormat::S32NE => "s32ne",
            DataFormat::S24BE4 => "s24be4",
            DataFormat::S24LE4 => "s24le4",
            DataFormat::S24NE4 => "s24ne4",
            DataFormat::S24NE4MSB => "s24ne4msb",
            DataFormat::S24BE3 => "s24be3",
            DataFormat::S24LE3 => "s24le3",
            DataFormat::S24NE3 => "s24ne3",
            DataFormat::Double => "double",
            DataFormat::Float => "float",
            DataFormat::Raw => "raw",
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
