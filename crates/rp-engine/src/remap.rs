//! Channel remapping (gain table) and upmixing (zero-padding).

use std::f32::consts::FRAC_1_SQRT_2 as H;

use rp_format::{Channel, ChannelLayout};

type Group = &'static [(Channel, f32)];

/// Where a source channel goes when the output lacks it, best first.
/// The first group whose channels all exist in the output wins.
fn fallback_groups(ch: Channel) -> &'static [Group] {
    use Channel::*;
    match ch {
        FL => &[&[(FC, H)]],
        FR => &[&[(FC, H)]],
        FC => &[&[(FL, H), (FR, H)]],
        BL | BLOC => &[&[(SL, 1.0)], &[(FL, H)], &[(FC, H)]],
        BR | BROC => &[&[(SR, 1.0)], &[(FR, H)], &[(FC, H)]],
        SL => &[&[(BL, 1.0)], &[(FL, H)], &[(FC, H)]],
        SR => &[&[(BR, 1.0)], &[(FR, H)], &[(FC, H)]],
        BC | TBC => &[
            &[(BL, H), (BR, H)],
            &[(SL, H), (SR, H)],
            &[(FL, H), (FR, H)],
            &[(FC, H)],
        ],
        FLOC | TFL => &[&[(FL, 1.0)], &[(FC, H)]],
        FROC | TFR => &[&[(FR, 1.0)], &[(FC, H)]],
        TFC | TC => &[&[(FC, 1.0)], &[(FL, H), (FR, H)]],
        TBL => &[&[(BL, 1.0)], &[(SL, 1.0)], &[(FL, H)]],
        TBR => &[&[(BR, 1.0)], &[(SR, 1.0)], &[(FR, H)]],
        // LFE is dropped rather than folded into full-range speakers.
        LFE | RAW | UNKNOWN1 | UNKNOWN2 | UNKNOWN3 | UNKNOWN4 => &[],
    }
}

/// Per-output-channel gain table from one layout to another.
///
/// Each output channel is a weighted sum of zero or more input channels;
/// channels present on both sides are copied, missing ones are folded
/// into their nearest neighbours.
#[derive(Clone, Debug, PartialEq)]
pub struct Remapper {
    input: ChannelLayout,
    output: ChannelLayout,
    /// `rows[out]` lists `(input index, gain)`
    rows: Vec<Vec<(usize, f32)>>,
}

impl Remapper {
    pub fn new(input: &ChannelLayout, output: &ChannelLayout, normalize: bool) -> Self {
        let mut rows: Vec<Vec<(usize, f32)>> = vec![Vec::new(); output.count()];

        for (in_idx, ch) in input.iter().enumerate() {
            if let Some(out_idx) = output.index_of(ch) {
                rows[out_idx].push((in_idx, 1.0));
                continue;
            }
            let group = fallback_groups(ch)
                .iter()
                .find(|g| g.iter().all(|(c, _)| output.contains(*c)));
            if let Some(group) = group {
                for &(target, gain) in group.iter() {
                    if let Some(out_idx) = output.index_of(target) {
                        rows[out_idx].push((in_idx, gain));
                    }
                }
            }
        }

        // Mono sources feed every front speaker at full level.
        if input.count() == 1 && input.get(0) == Some(Channel::FC) && !output.contains(Channel::FC) {
            for row in rows.iter_mut() {
                for entry in row.iter_mut() {
                    entry.1 = 1.0;
                }
            }
        }

        if normalize {
            for row in rows.iter_mut() {
                let sum: f32 = row.iter().map(|(_, g)| g).sum();
                if sum > 1.0 {
                    for entry in row.iter_mut() {
                        entry.1 /= sum;
                    }
                }
            }
        }

        Self {
            input: input.clone(),
            output: output.clone(),
            rows,
        }
    }

    pub fn input(&self) -> &ChannelLayout {
        &self.input
    }

    pub fn output(&self) -> &ChannelLayout {
        &self.output
    }

    /// Gain from input channel `in_idx` to output channel `out_idx`.
    pub fn gain(&self, out_idx: usize, in_idx: usize) -> f32 {
        self.rows
            .get(out_idx)
            .and_then(|row| row.iter().find(|(i, _)| *i == in_idx))
            .map_or(0.0, |(_, g)| *g)
    }

    /// True when the table is a plain copy.
    pub fn is_identity(&self) -> bool {
        self.input == self.output
    }

    /// Remap `frames` frames from `src` into `dst` (overwritten).
    /// Requires `src` to hold at least `frames` input frames.
    pub fn process(&self, src: &[f32], dst: &mut [f32], frames: usize) {
        let in_ch = self.input.count();
        let out_ch = self.output.count();
        debug_assert!(
            src.len() >= frames * in_ch,
            "remap short input: {} samples for {} frames of {} channels",
            src.len(),
            frames,
            in_ch
        );
        if out_ch == 0 {
            return;
        }
        for (f, out_frame) in dst.chunks_exact_mut(out_ch).take(frames).enumerate() {
            let in_frame = &src[f * in_ch..(f + 1) * in_ch];
            for (o, row) in out_frame.iter_mut().zip(&self.rows) {
                *o = row.iter().map(|&(i, g)| in_frame[i] * g).sum();
            }
        }
    }
}

/// Copies the source channels and zero-fills the extra output channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Upmixer {
    channels_in: usize,
    channels_out: usize,
}

impl Upmixer {
    /// `None` unless `channels_out >= channels_in`.
    pub fn new(channels_in: usize, channels_out: usize) -> Option<Self> {
        (channels_out >= channels_in && channels_in > 0).then_some(Self {
            channels_in,
            channels_out,
        })
    }

    /// Equal counts: nothing to do.
    pub fn is_noop(&self) -> bool {
        self.channels_in == self.channels_out
    }

    pub fn channels_out(&self) -> usize {
        self.channels_out
    }

    /// Upmix `frames` frames from `src` into `dst`.
    /// Requires `src` to hold at least `frames` input frames.
    pub fn process(&self, src: &[f32], dst: &mut [f32], frames: usize) {
        debug_assert!(
            src.len() >= frames * self.channels_in,
            "upmix short input: {} samples for {} frames of {} channels",
            src.len(),
            frames,
            self.channels_in
        );
        if self.is_noop() {
            let n = frames * self.channels_in;
            dst[..n].copy_from_slice(&src[..n]);
            return;
        }
        for (in_frame, out_frame) in src
            .chunks_exact(self.channels_in)
            .zip(dst.chunks_exact_mut(self.channels_out))
            .take(frames)
        {
            out_frame[..self.channels_in].copy_from_slice(in_frame);
            out_frame[self.channels_in..].fill(0.0);
        }
    }
}
