//! Hardware format negotiation ladders.
//!
//! Native APIs disagree on how a format is agreed, but the search strategies
//! are the same few shapes. They are expressed here as pure functions over a
//! probe trait so every backend (and every test) can drive them:
//!
//! - [`search_exclusive`]: exclusive-mode format search across layouts,
//!   sample formats and rates, exact match first, closest rate otherwise.
//! - [`initialize_aligned`]: buffer duration aligned to the device period,
//!   retried once with the size the device reports after an alignment error.
//! - [`negotiate_period`]: the period/buffer fallback ladder.
//! - [`resolve_channel_map`]: queried channel map or the legacy table.

use rp_format::{AudioFormat, Channel, ChannelLayout, DataFormat, StandardLayout};
use tracing::{debug, warn};

use crate::error::{SinkError, SinkResult};

/// Rates tried by the exclusive search, highest first.
pub const SEARCH_RATES: [u32; 10] = [
    384000, 192000, 176400, 96000, 88200, 48000, 44100, 32000, 22050, 11025,
];

/// Sample formats tried by the exclusive search, best first.
pub const SEARCH_FORMATS: [DataFormat; 5] = [
    DataFormat::Float,
    DataFormat::S32NE,
    DataFormat::S24NE4MSB,
    DataFormat::S24NE3,
    DataFormat::S16NE,
];

/// One exclusive-mode format candidate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub layout: ChannelLayout,
    pub data_format: DataFormat,
    pub sample_rate: u32,
}

impl Candidate {
    pub fn from_format(format: &AudioFormat) -> Self {
        Self {
            layout: format.channel_layout.clone(),
            data_format: format.data_format,
            sample_rate: format.sample_rate,
        }
    }

    /// Write this candidate into `format`, keeping RAW link formats as S16.
    pub fn apply_to(&self, format: &mut AudioFormat) {
        if !format.is_raw() {
            format.data_format = self.data_format;
            format.channel_layout = self.layout.clone();
        }
        format.sample_rate = self.sample_rate;
        format.update_frame_size();
    }
}

/// Outcome of asking the device about one candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Probe {
    Supported,
    Unsupported,
    /// The query failed for a reason unrelated to the format
    Failed,
}

/// Answers "would the device open this format exclusively?".
pub trait FormatProbe {
    fn probe(&self, candidate: &Candidate) -> Probe;
}

/// Rank used when comparing a candidate to the requested sample format.
fn format_rank(format: DataFormat) -> u8 {
    match format.to_explicit_endian() {
        DataFormat::U8 | DataFormat::S8 => 0,
        DataFormat::S16BE | DataFormat::S16LE | DataFormat::Raw => 1,
        DataFormat::S24BE3 | DataFormat::S24LE3 => 2,
        DataFormat::S24BE4 | DataFormat::S24LE4 | DataFormat::S24NE4MSB => 3,
        DataFormat::S32BE | DataFormat::S32LE => 4,
        DataFormat::Float | DataFormat::Double => 5,
        _ => 0,
    }
}

/// Find a format the device accepts, as close as possible to `requested`.
///
/// Order of attempts:
/// 1. the request itself (incomplete requests become stereo/44.1k/S16);
/// 2. for the requested layout, then each standard layout with at least as
///    many channels, then plain stereo: for each sample format in
///    [`SEARCH_FORMATS`], every rate in [`SEARCH_RATES`]. A supported
///    candidate at the requested rate whose format is not better than the
///    requested one wins at once; otherwise the closest supported rate for
///    that sample format wins.
///
/// Passthrough requests are never altered: if the link format itself is
/// refused there is nothing sensible to fall back to.
pub fn search_exclusive(requested: &AudioFormat, probe: &impl FormatProbe) -> SinkResult<Candidate> {
    let mut first = Candidate::from_format(requested);
    if first.data_format.is_raw() {
        first.data_format = DataFormat::S16NE;
    } else if !first.data_format.is_valid() || first.sample_rate == 0 || first.layout.is_empty() {
        first = Candidate {
            layout: ChannelLayout::stereo(),
            data_format: DataFormat::S16NE,
            sample_rate: 44100,
        };
    }

    match probe.probe(&first) {
        Probe::Supported => {
            debug!("exclusive format supported as requested: {:?}", first);
            return Ok(first);
        }
        Probe::Failed => {
            return Err(SinkError::DeviceInit("format query failed".into()));
        }
        Probe::Unsupported if requested.is_raw() => {
            return Err(SinkError::unsupported(requested));
        }
        Probe::Unsupported => {}
    }

    debug!("requested format {} not supported, searching", requested);

    let wanted_rank = format_rank(first.data_format);
    let wanted_rate = first.sample_rate;
    let mut layouts = vec![first.layout.clone()];
    layouts.extend(
        StandardLayout::ALL
            .iter()
            .map(|l| l.layout())
            .filter(|l| l.count() >= first.layout.count() && *l != first.layout),
    );
    layouts.push(ChannelLayout::stereo());

    for layout in layouts {
        for &data_format in &SEARCH_FORMATS {
            let mut closest: Option<u32> = None;
            for &rate in &SEARCH_RATES {
                let candidate = Candidate {
                    layout: layout.clone(),
                    data_format,
                    sample_rate: rate,
                };
                match probe.probe(&candidate) {
                    Probe::Supported => {
                        if rate == wanted_rate && format_rank(data_format) <= wanted_rank {
                            return Ok(candidate);
                        }
                        let better = closest.map_or(true, |c| {
                            rate.abs_diff(wanted_rate) < c.abs_diff(wanted_rate)
                        });
                        if better {
                            closest = Some(rate);
                        }
                    }
                    Probe::Failed => warn!("format query failed for {:?}", candidate),
                    Probe::Unsupported => {}
                }
            }
            if let Some(rate) = closest {
                return Ok(Candidate {
                    layout,
                    data_format,
                    sample_rate: rate,
                });
            }
        }
    }

    Err(SinkError::unsupported(requested))
}

/// 100-nanosecond units per second (the unit of exclusive-mode durations).
pub const HNS_PER_SECOND: i64 = 10_000_000;

/// Round `requested` up to a whole number of device periods (at least one).
pub fn align_to_period(requested_hns: i64, period_hns: i64) -> i64 {
    if period_hns <= 0 {
        return requested_hns;
    }
    let periods = ((requested_hns + period_hns - 1) / period_hns).max(1);
    periods * period_hns
}

/// Duration of `frames` frames at `rate`, rounded to the nearest 100 ns.
pub fn frames_to_hns(frames: u32, rate: u32) -> i64 {
    ((HNS_PER_SECOND as f64 * frames as f64 / rate as f64) + 0.5) as i64
}

/// Why an exclusive-mode open attempt failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpenFailure {
    /// Device wants a buffer of exactly this many frames
    NotAligned { buffer_frames: u32 },
    Other(String),
}

/// Open with a period-aligned buffer duration, retrying once on alignment errors.
///
/// Returns the duration the device finally accepted.
pub fn initialize_aligned<F>(
    requested_hns: i64,
    default_period_hns: i64,
    sample_rate: u32,
    mut open: F,
) -> SinkResult<i64>
where
    F: FnMut(i64) -> Result<(), OpenFailure>,
{
    let duration = align_to_period(requested_hns, default_period_hns);
    match open(duration) {
        Ok(()) => Ok(duration),
        Err(OpenFailure::NotAligned { buffer_frames }) => {
            let retry = frames_to_hns(buffer_frames, sample_rate);
            debug!("buffer not aligned, retrying with {} frames ({} hns)", buffer_frames, retry);
            match open(retry) {
                Ok(()) => Ok(retry),
                Err(OpenFailure::NotAligned { .. }) => {
                    Err(SinkError::DeviceInit("buffer size still not aligned".into()))
                }
                Err(OpenFailure::Other(e)) => Err(SinkError::DeviceInit(e)),
            }
        }
        Err(OpenFailure::Other(e)) => Err(SinkError::DeviceInit(e)),
    }
}

/// Rungs of the period/buffer ladder, tried in this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeriodStep {
    BufferThenPeriod,
    PeriodThenBuffer,
    PeriodOnly,
    BufferOnly,
    HardwareDefault,
}

impl PeriodStep {
    pub const LADDER: [PeriodStep; 5] = [
        PeriodStep::BufferThenPeriod,
        PeriodStep::PeriodThenBuffer,
        PeriodStep::PeriodOnly,
        PeriodStep::BufferOnly,
        PeriodStep::HardwareDefault,
    ];
}

/// Buffer and period sizes in frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferRequest {
    pub buffer_frames: u32,
    pub period_frames: u32,
}

impl BufferRequest {
    /// The usual request: `periods` periods of `period_frames`.
    pub fn with_periods(period_frames: u32, periods: u32) -> Self {
        Self {
            buffer_frames: period_frames * periods,
            period_frames,
        }
    }
}

/// Hardware parameter space the ladder negotiates against.
pub trait HwParams {
    /// Try one rung. `None` means the hardware refused it.
    fn apply(&mut self, step: PeriodStep, request: BufferRequest) -> Option<BufferRequest>;
}

/// Walk [`PeriodStep::LADDER`] until the hardware accepts a rung.
pub fn negotiate_period(
    hw: &mut impl HwParams,
    request: BufferRequest,
) -> SinkResult<(PeriodStep, BufferRequest)> {
    for step in PeriodStep::LADDER {
        if let Some(accepted) = hw.apply(step, request) {
            debug!("period negotiation settled at {:?}: {:?}", step, accepted);
            return Ok((step, accepted));
        }
        debug!("period negotiation step {:?} refused", step);
    }
    Err(SinkError::DeviceInit("no period/buffer configuration accepted".into()))
}

/// Hardware described by allowed ranges, with `near`-style clamping.
///
/// A `None` range means the hardware does not let that parameter be set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeHwParams {
    pub period_range: Option<(u32, u32)>,
    pub buffer_range: Option<(u32, u32)>,
    pub default: BufferRequest,
}

fn in_range(value: u32, range: (u32, u32)) -> bool {
    value >= range.0 && value <= range.1
}

impl HwParams for RangeHwParams {
    fn apply(&mut self, step: PeriodStep, req: BufferRequest) -> Option<BufferRequest> {
        match step {
            PeriodStep::BufferThenPeriod => {
                let buffer_range = self.buffer_range?;
                let period_range = self.period_range?;
                if !in_range(req.buffer_frames, buffer_range) {
                    return None;
                }
                let period = req.period_frames.clamp(period_range.0, period_range.1);
                (period * 2 <= req.buffer_frames).then_some(BufferRequest {
                    buffer_frames: req.buffer_frames,
                    period_frames: period,
                })
            }
            PeriodStep::PeriodThenBuffer => {
                let period_range = self.period_range?;
                if !in_range(req.period_frames, period_range) {
                    return None;
                }
                let periods = (req.buffer_frames / req.period_frames.max(1)).max(2);
                let mut buffer = req.period_frames * periods;
                if let Some(range) = self.buffer_range {
                    buffer = buffer.clamp(range.0, range.1);
                }
                (req.period_frames * 2 <= buffer).then_some(BufferRequest {
                    buffer_frames: buffer,
                    period_frames: req.period_frames,
                })
            }
            PeriodStep::PeriodOnly => {
                let range = self.period_range?;
                let period = req.period_frames.clamp(range.0, range.1);
                Some(BufferRequest {
                    buffer_frames: self.default.buffer_frames.max(period * 2),
                    period_frames: period,
                })
            }
            PeriodStep::BufferOnly => {
                let range = self.buffer_range?;
                let buffer = req.buffer_frames.clamp(range.0, range.1);
                Some(BufferRequest {
                    buffer_frames: buffer,
                    period_frames: self.default.period_frames.min(buffer / 2).max(1),
                })
            }
            PeriodStep::HardwareDefault => Some(self.default),
        }
    }
}

/// Layout for a device with `count` channels.
///
/// Uses the channel map the device reported when it is usable (right
/// length, at least one real speaker position); otherwise the fixed legacy
/// table.
pub fn resolve_channel_map(queried: Option<&[Channel]>, count: usize) -> ChannelLayout {
    if let Some(map) = queried {
        let usable = map.len() == count
            && map.iter().any(|c| {
                !matches!(
                    c,
                    Channel::UNKNOWN1 | Channel::UNKNOWN2 | Channel::UNKNOWN3 | Channel::UNKNOWN4
                )
            });
        if usable {
            return ChannelLayout::from_slice(map);
        }
        debug!("channel map query unusable ({} entries for {} channels)", map.len(), count);
    }
    ChannelLayout::alsa_legacy(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rp_format::StreamType;
    use std::cell::RefCell;

    /// Device accepting a fixed set of (channels, format, rate) triples.
    struct TableProbe {
        supported: Vec<(usize, DataFormat, u32)>,
        calls: RefCell<usize>,
    }

    impl TableProbe {
        fn new(supported: Vec<(usize, DataFormat, u32)>) -> Self {
            Self {
                supported,
                calls: RefCell::new(0),
            }
        }
    }

    impl FormatProbe for TableProbe {
        fn probe(&self, c: &Candidate) -> Probe {
            *self.calls.borrow_mut() += 1;
            let hit = self.supported.iter().any(|&(ch, fmt, rate)| {
                ch == c.layout.count() && fmt == c.data_format && rate == c.sample_rate
            });
            if hit {
                Probe::Supported
            } else {
                Probe::Unsupported
            }
        }
    }

    fn stereo_float(rate: u32) -> AudioFormat {
        AudioFormat::float(rate, ChannelLayout::stereo())
    }

    #[test]
    fn exact_request_is_accepted_without_search() {
        let probe = TableProbe::new(vec![(2, DataFormat::Float, 48000)]);
        let c = search_exclusive(&stereo_float(48000), &probe).unwrap();
        assert_eq!(c.sample_rate, 48000);
        assert_eq!(*probe.calls.borrow(), 1);
    }

    #[test]
    fn unsupported_rate_falls_back_to_closest_supported_rate() {
        let probe = TableProbe::new(vec![(2, DataFormat::Float, 44100), (2, DataFormat::Float, 96000)]);
        let c = search_exclusive(&stereo_float(48000), &probe).unwrap();
        assert_eq!(c.sample_rate, 44100);
        assert_eq!(c.data_format, DataFormat::Float);
    }

    #[test]
    fn format_downgrade_when_float_refused() {
        let probe = TableProbe::new(vec![(2, DataFormat::S16NE, 48000)]);
        let c = search_exclusive(&stereo_float(48000), &probe).unwrap();
        assert_eq!(c.data_format, DataFormat::S16NE);
        assert_eq!(c.sample_rate, 48000);
    }

    #[test]
    fn multichannel_request_tries_larger_layouts_then_stereo() {
        let probe = TableProbe::new(vec![(2, DataFormat::Float, 48000)]);
        let req = AudioFormat::float(48000, StandardLayout::L5_1.layout());
        let c = search_exclusive(&req, &probe).unwrap();
        assert_eq!(c.layout, ChannelLayout::stereo());

        let probe = TableProbe::new(vec![(8, DataFormat::S32NE, 48000)]);
        let c = search_exclusive(&req, &probe).unwrap();
        assert_eq!(c.layout, StandardLayout::L7_1.layout());
        assert_eq!(c.data_format, DataFormat::S32NE);
    }

    #[test]
    fn raw_request_is_never_altered() {
        let probe = TableProbe::new(vec![(2, DataFormat::Float, 48000)]);
        let req = AudioFormat::raw(StreamType::Ac3, 48000);
        assert!(search_exclusive(&req, &probe).is_err());

        let probe = TableProbe::new(vec![(2, DataFormat::S16NE, 48000)]);
        let c = search_exclusive(&req, &probe).unwrap();
        assert_eq!(c.sample_rate, 48000);
    }

    #[test]
    fn nothing_supported_fails_cleanly() {
        let probe = TableProbe::new(vec![]);
        assert!(matches!(
            search_exclusive(&stereo_float(48000), &probe),
            Err(SinkError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn failing_query_aborts() {
        struct Broken;
        impl FormatProbe for Broken {
            fn probe(&self, _: &Candidate) -> Probe {
                Probe::Failed
            }
        }
        assert!(matches!(
            search_exclusive(&stereo_float(48000), &Broken),
            Err(SinkError::DeviceInit(_))
        ));
    }

    #[test]
    fn incomplete_request_uses_stereo_defaults() {
        let probe = TableProbe::new(vec![(2, DataFormat::S16NE, 44100)]);
        let c = search_exclusive(&AudioFormat::default(), &probe).unwrap();
        assert_eq!(c.sample_rate, 44100);
        assert_eq!(c.layout, ChannelLayout::stereo());
    }

    #[test]
    fn candidate_apply_keeps_raw_link() {
        let mut f = AudioFormat::raw(StreamType::Ac3, 48000);
        let c = Candidate {
            layout: ChannelLayout::stereo(),
            data_format: DataFormat::S16NE,
            sample_rate: 48000,
        };
        c.apply_to(&mut f);
        assert!(f.is_raw());
        assert_eq!(f.frame_size, 4);
    }

    #[test]
    fn align_rounds_up_to_whole_periods() {
        assert_eq!(align_to_period(500_000, 100_000), 500_000);
        assert_eq!(align_to_period(450_000, 100_000), 500_000);
        assert_eq!(align_to_period(1, 100_000), 100_000);
        assert_eq!(align_to_period(123, 0), 123);
    }

    #[test]
    fn alignment_error_retries_with_reported_size() {
        let mut attempts = Vec::new();
        let result = initialize_aligned(500_000, 100_000, 48000, |d| {
            attempts.push(d);
            if attempts.len() == 1 {
                Err(OpenFailure::NotAligned { buffer_frames: 2400 })
            } else {
                Ok(())
            }
        });
        assert_eq!(result.unwrap(), 500_000);
        assert_eq!(attempts, vec![500_000, frames_to_hns(2400, 48000)]);
    }

    #[test]
    fn alignment_gives_up_after_one_retry() {
        let result = initialize_aligned(500_000, 100_000, 48000, |_| {
            Err(OpenFailure::NotAligned { buffer_frames: 2401 })
        });
        assert!(result.is_err());
    }

    #[test]
    fn ladder_prefers_buffer_then_period() {
        let mut hw = RangeHwParams {
            period_range: Some((64, 4096)),
            buffer_range: Some((256, 16384)),
            default: BufferRequest::with_periods(1024, 4),
        };
        let (step, got) = negotiate_period(&mut hw, BufferRequest::with_periods(960, 4)).unwrap();
        assert_eq!(step, PeriodStep::BufferThenPeriod);
        assert_eq!(got, BufferRequest::with_periods(960, 4));
    }

    #[test]
    fn ladder_falls_through_to_period_only_without_buffer_control() {
        let mut hw = RangeHwParams {
            period_range: Some((128, 512)),
            buffer_range: None,
            default: BufferRequest::with_periods(256, 4),
        };
        let (step, got) = negotiate_period(&mut hw, BufferRequest::with_periods(960, 4)).unwrap();
        assert_eq!(step, PeriodStep::PeriodOnly);
        assert_eq!(got.period_frames, 512);
        assert!(got.buffer_frames >= 1024);
    }

    #[test]
    fn ladder_uses_buffer_only_and_hardware_default() {
        let mut hw = RangeHwParams {
            period_range: None,
            buffer_range: Some((4096, 8192)),
            default: BufferRequest::with_periods(1024, 4),
        };
        let (step, got) = negotiate_period(&mut hw, BufferRequest::with_periods(256, 2)).unwrap();
        assert_eq!(step, PeriodStep::BufferOnly);
        assert_eq!(got.buffer_frames, 4096);

        let mut hw = RangeHwParams {
            period_range: None,
            buffer_range: None,
            default: BufferRequest::with_periods(1024, 4),
        };
        let (step, got) = negotiate_period(&mut hw, BufferRequest::with_periods(256, 2)).unwrap();
        assert_eq!(step, PeriodStep::HardwareDefault);
        assert_eq!(got, hw.default);
    }

    #[test]
    fn channel_map_query_wins_when_usable() {
        use Channel::*;
        let map = [FL, FR, FC, LFE, SL, SR];
        assert_eq!(resolve_channel_map(Some(&map), 6).as_slice(), &map);
        assert_eq!(
            resolve_channel_map(Some(&[FL, FR]), 6),
            ChannelLayout::alsa_legacy(6)
        );
        assert_eq!(
            resolve_channel_map(Some(&[UNKNOWN1, UNKNOWN2]), 2),
            ChannelLayout::alsa_legacy(2)
        );
        assert_eq!(resolve_channel_map(None, 2), ChannelLayout::alsa_legacy(2));
    }
}
