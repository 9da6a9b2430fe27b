//! Channel identifiers and ordered channel layouts.

use arrayvec::ArrayVec;
use core::fmt;

use crate::FormatError;

/// Maximum number of channels in a layout.
pub const MAX_CHANNELS: usize = 20;

/// A speaker position (or an opaque passthrough slot).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// Front left
    FL,
    /// Front right
    FR,
    /// Front center
    FC,
    /// Low frequency effects
    LFE,
    /// Back left
    BL,
    /// Back right
    BR,
    /// Front left of center
    FLOC,
    /// Front right of center
    FROC,
    /// Back center
    BC,
    /// Side left
    SL,
    /// Side right
    SR,
    /// Top front left
    TFL,
    /// Top front right
    TFR,
    /// Top front center
    TFC,
    /// Top center
    TC,
    /// Top back left
    TBL,
    /// Top back right
    TBR,
    /// Top back center
    TBC,
    /// Back left of center
    BLOC,
    /// Back right of center
    BROC,
    /// Opaque slot of a compressed passthrough link
    RAW,
    UNKNOWN1,
    UNKNOWN2,
    UNKNOWN3,
    UNKNOWN4,
}

impl Channel {
    pub const fn name(self) -> &'static str {
        match self {
            Channel::FL => "FL",
            Channel::FR => "FR",
            Channel::FC => "FC",
            Channel::LFE => "LFE",
            Channel::BL => "BL",
            Channel::BR => "BR",
            Channel::FLOC => "FLOC",
            Channel::FROC => "FROC",
            Channel::BC => "BC",
            Channel::SL => "SL",
            Channel::SR => "SR",
            Channel::TFL => "TFL",
            Channel::TFR => "TFR",
            Channel::TFC => "TFC",
            Channel::TC => "TC",
            Channel::TBL => "TBL",
            Channel::TBR => "TBR",
            Channel::TBC => "TBC",
            Channel::BLOC => "BLOC",
            Channel::BROC => "BROC",
            Channel::RAW => "RAW",
            Channel::UNKNOWN1 => "UNKNOWN1",
            Channel::UNKNOWN2 => "UNKNOWN2",
            Channel::UNKNOWN3 => "UNKNOWN3",
            Channel::UNKNOWN4 => "UNKNOWN4",
        }
    }

    /// Parse a short channel name such as `"FL"` or `"LFE"`.
    pub fn from_name(name: &str) -> Result<Self, FormatError> {
        const ALL: [Channel; 25] = [
            Channel::FL,
            Channel::FR,
            Channel::FC,
            Channel::LFE,
            Channel::BL,
            Channel::BR,
            Channel::FLOC,
            Channel::FROC,
            Channel::BC,
            Channel::SL,
            Channel::SR,
            Channel::TFL,
            Channel::TFR,
            Channel::TFC,
            Channel::TC,
            Channel::TBL,
            Channel::TBR,
            Channel::TBC,
            Channel::BLOC,
            Channel::BROC,
            Channel::RAW,
            Channel::UNKNOWN1,
            Channel::UNKNOWN2,
            Channel::UNKNOWN3,
            Channel::UNKNOWN4,
        ];
        ALL.iter()
            .copied()
            .find(|c| c.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| FormatError::UnknownName(name.into()))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Named speaker configurations, smallest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StandardLayout {
    Mono,
    Stereo,
    L2_1,
    L3_0,
    L4_0,
    L4_1,
    L5_0,
    L5_1,
    L7_0,
    L7_1,
}

impl StandardLayout {
    pub const ALL: [StandardLayout; 10] = [
        StandardLayout::Mono,
        StandardLayout::Stereo,
        StandardLayout::L2_1,
        StandardLayout::L3_0,
        StandardLayout::L4_0,
        StandardLayout::L4_1,
        StandardLayout::L5_0,
        StandardLayout::L5_1,
        StandardLayout::L7_0,
        StandardLayout::L7_1,
    ];

    pub const fn channels(self) -> &'static [Channel] {
        use Channel::*;
        match self {
            StandardLayout::Mono => &[FC],
            StandardLayout::Stereo => &[FL, FR],
            StandardLayout::L2_1 => &[FL, FR, LFE],
            StandardLayout::L3_0 => &[FL, FR, FC],
            StandardLayout::L4_0 => &[FL, FR, BL, BR],
            StandardLayout::L4_1 => &[FL, FR, BL, BR, LFE],
            StandardLayout::L5_0 => &[FL, FR, FC, BL, BR],
            StandardLayout::L5_1 => &[FL, FR, FC, LFE, BL, BR],
            StandardLayout::L7_0 => &[FL, FR, FC, BL, BR, SL, SR],
            StandardLayout::L7_1 => &[FL, FR, FC, LFE, BL, BR, SL, SR],
        }
    }

    pub fn layout(self) -> ChannelLayout {
        ChannelLayout::from_slice(self.channels())
    }
}

/// An ordered list of channels.
///
/// Equality is order-sensitive; [`ChannelLayout::contains`] and
/// [`ChannelLayout::is_superset_of`] ignore order.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ChannelLayout {
    channels: ArrayVec<Channel, MAX_CHANNELS>,
}

impl ChannelLayout {
    /// An empty (unresolved) layout.
    pub const fn new() -> Self {
        Self {
            channels: ArrayVec::new_const(),
        }
    }

    /// Build a layout from a slice, ignoring entries past [`MAX_CHANNELS`].
    pub fn from_slice(channels: &[Channel]) -> Self {
        let mut layout = Self::new();
        for &ch in channels.iter().take(MAX_CHANNELS) {
            layout.channels.push(ch);
        }
        layout
    }

    pub fn stereo() -> Self {
        StandardLayout::Stereo.layout()
    }

    /// `count` opaque passthrough channels.
    pub fn raw(count: usize) -> Self {
        let mut layout = Self::new();
        for _ in 0..count.min(MAX_CHANNELS) {
            layout.channels.push(Channel::RAW);
        }
        layout
    }

    pub fn push(&mut self, channel: Channel) -> Result<(), FormatError> {
        self.channels
            .try_push(channel)
            .map_err(|_| FormatError::LayoutOverflow)
    }

    pub fn count(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn as_slice(&self) -> &[Channel] {
        &self.channels
    }

    pub fn iter(&self) -> impl Iterator<Item = Channel> + '_ {
        self.channels.iter().copied()
    }

    pub fn get(&self, index: usize) -> Option<Channel> {
        self.channels.get(index).copied()
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.channels.contains(&channel)
    }

    /// Position of `channel` in this layout.
    pub fn index_of(&self, channel: Channel) -> Option<usize> {
        self.channels.iter().position(|&c| c == channel)
    }

    /// True when every channel of `other` is present here (any order).
    pub fn is_superset_of(&self, other: &ChannelLayout) -> bool {
        other.iter().all(|c| self.contains(c))
    }

    /// True when `self` equals the first `self.count()` channels of `other`.
    pub fn is_prefix_of(&self, other: &ChannelLayout) -> bool {
        self.count() <= other.count() && other.as_slice()[..self.count()] == self.as_slice()[..]
    }

    pub fn is_raw(&self) -> bool {
        !self.is_empty() && self.channels.iter().all(|&c| c == Channel::RAW)
    }

    /// The first `count` channels.
    pub fn truncated(&self, count: usize) -> ChannelLayout {
        Self::from_slice(&self.channels[..count.min(self.count())])
    }

    /// Keep only the channels that also appear in `other`, preserving this order.
    pub fn intersect(&self, other: &ChannelLayout) -> ChannelLayout {
        let mut out = ChannelLayout::new();
        for ch in self.iter().filter(|&c| other.contains(c)) {
            out.channels.push(ch);
        }
        out
    }

    /// The smallest standard layout holding every channel of `self`.
    ///
    /// Falls back to `self` when no standard layout is large enough.
    pub fn best_match(&self) -> ChannelLayout {
        StandardLayout::ALL
            .iter()
            .map(|l| l.layout())
            .find(|l| l.is_superset_of(self))
            .unwrap_or_else(|| self.clone())
    }

    /// Channel order an ALSA device uses when it cannot report a channel map.
    pub fn alsa_legacy(count: usize) -> ChannelLayout {
        use Channel::*;
        const ORDER: [Channel; 8] = [FL, FR, BL, BR, FC, LFE, SL, SR];
        match count {
            0 => ChannelLayout::new(),
            1 => ChannelLayout::from_slice(&[FC]),
            n if n <= ORDER.len() => ChannelLayout::from_slice(&ORDER[..n]),
            n => {
                let mut layout = ChannelLayout::from_slice(&ORDER);
                let extra = [UNKNOWN1, UNKNOWN2, UNKNOWN3, UNKNOWN4];
                for &ch in extra.iter().take(n - ORDER.len()) {
                    layout.channels.push(ch);
                }
                layout
            }
        }
    }

    /// Channel order implied by a WAVE_FORMAT_EXTENSIBLE speaker mask.
    pub fn from_speaker_mask(mask: u32) -> ChannelLayout {
        use Channel::*;
        const BITS: [Channel; 18] = [
            FL, FR, FC, LFE, BL, BR, FLOC, FROC, BC, SL, SR, TC, TFL, TFC, TFR, TBL, TBC, TBR,
        ];
        let mut layout = ChannelLayout::new();
        for (bit, &ch) in BITS.iter().enumerate() {
            if mask & (1 << bit) != 0 {
                layout.channels.push(ch);
            }
        }
        layout
    }

    /// Speaker mask for this layout; channels with no mask bit are ignored.
    pub fn speaker_mask(&self) -> u32 {
        use Channel::*;
        self.iter()
            .map(|c| match c {
                FL => 1 << 0,
                FR => 1 << 1,
                FC => 1 << 2,
                LFE => 1 << 3,
                BL => 1 << 4,
                BR => 1 << 5,
                FLOC => 1 << 6,
                FROC => 1 << 7,
                BC => 1 << 8,
                SL => 1 << 9,
                SR => 1 << 10,
                TC => 1 << 11,
                TFL => 1 << 12,
                TFC => 1 << 13,
                TFR => 1 << 14,
                TBL => 1 << 15,
                TBC => 1 << 16,
                TBR => 1 << 17,
                _ => 0,
            })
            .fold(0, |acc, bit| acc | bit)
    }

    /// Default layout for a bare channel count (speaker-mask ordering).
    pub fn default_for_count(count: usize) -> ChannelLayout {
        match count {
            0 => ChannelLayout::new(),
            1 => StandardLayout::Mono.layout(),
            2 => StandardLayout::Stereo.layout(),
            3 => StandardLayout::L2_1.layout(),
            4 => StandardLayout::L4_0.layout(),
            5 => StandardLayout::L4_1.layout(),
            6 => StandardLayout::L5_1.layout(),
            7 => StandardLayout::L7_0.layout(),
            8 => StandardLayout::L7_1.layout(),
            n => ChannelLayout::alsa_legacy(n),
        }
    }
}

impl From<StandardLayout> for ChannelLayout {
    fn from(layout: StandardLayout) -> Self {
        layout.layout()
    }
}

impl fmt::Display for ChannelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ch) in self.channels.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(ch.name())?;
        }
        Ok(())
    }
}

impl fmt::Debug for ChannelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelLayout[{}]", self)
    }
}
