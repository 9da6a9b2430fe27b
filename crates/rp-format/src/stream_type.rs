//! Compressed bitstream types eligible for passthrough.

use core::fmt;

/// A compressed audio codec carried to the receiver without decoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamType {
    Ac3,
    Eac3,
    DtsCore,
    Dts512,
    Dts1024,
    Dts2048,
    DtsHd,
    DtsHdMa,
    TrueHd,
}

impl StreamType {
    pub const ALL: [StreamType; 9] = [
        StreamType::Ac3,
        StreamType::Eac3,
        StreamType::DtsCore,
        StreamType::Dts512,
        StreamType::Dts1024,
        StreamType::Dts2048,
        StreamType::DtsHd,
        StreamType::DtsHdMa,
        StreamType::TrueHd,
    ];

    /// Channel count of the IEC 61937 link carrying this stream.
    pub const fn link_channels(self) -> usize {
        match self {
            StreamType::DtsHdMa | StreamType::TrueHd => 8,
            _ => 2,
        }
    }

    /// Sample rate of the IEC 61937 link for a stream encoded at `encoded_rate`.
    ///
    /// Core codecs keep their own rate (32/44.1/48 kHz, anything else is
    /// carried at 48 kHz). High bit-rate codecs need the 4x link, and the
    /// lossless ones need the 8-channel 192 kHz HBR link.
    pub const fn link_rate(self, encoded_rate: u32) -> u32 {
        match self {
            StreamType::Ac3
            | StreamType::DtsCore
            | StreamType::Dts512
            | StreamType::Dts1024
            | StreamType::Dts2048 => match encoded_rate {
                32000 | 44100 | 48000 => encoded_rate,
                _ => 48000,
            },
            StreamType::Eac3 => match encoded_rate {
                44100 => 176400,
                _ => 192000,
            },
            StreamType::DtsHd | StreamType::DtsHdMa | StreamType::TrueHd => 192000,
        }
    }

    /// True for the DTS family (core, fixed-frame and HD variants).
    pub const fn is_dts(self) -> bool {
        matches!(
            self,
            StreamType::DtsCore
                | StreamType::Dts512
                | StreamType::Dts1024
                | StreamType::Dts2048
                | StreamType::DtsHd
                | StreamType::DtsHdMa
        )
    }

    pub const fn name(self) -> &'static str {
        match self {
            StreamType::Ac3 => "ac3",
            StreamType::Eac3 => "eac3",
            StreamType::DtsCore => "dts",
            StreamType::Dts512 => "dts-512",
            StreamType::Dts1024 => "dts-1024",
            StreamType::Dts2048 => "dts-2048",
            StreamType::DtsHd => "dtshd",
            StreamType::DtsHdMa => "dtshd-ma",
            StreamType::TrueHd => "truehd",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_codecs_ride_a_stereo_link() {
        assert_eq!(StreamType::Ac3.link_channels(), 2);
        assert_eq!(StreamType::Ac3.link_rate(48000), 48000);
        assert_eq!(StreamType::Ac3.link_rate(44100), 44100);
        assert_eq!(StreamType::DtsCore.link_rate(96000), 48000);
    }

    #[test]
    fn lossless_codecs_need_hbr_link() {
        assert_eq!(StreamType::TrueHd.link_channels(), 8);
        assert_eq!(StreamType::TrueHd.link_rate(48000), 192000);
        assert_eq!(StreamType::DtsHdMa.link_channels(), 8);
        assert_eq!(StreamType::DtsHd.link_channels(), 2);
        assert_eq!(StreamType::Eac3.link_rate(48000), 192000);
    }
}
