//! Matrix mixer graph with a fixed pool of input buses.
//!
//! Each input is pulled into a scratch buffer and summed into the output
//! through its own gain matrix. Scratch space is sized up front with
//! [`MixerGraph::set_max_frames`], so [`MixerGraph::render`] never touches
//! the allocator.

use std::sync::Arc;

use heapless::Vec as HVec;

/// Maximum number of simultaneously attached inputs.
pub const MAX_BUSES: usize = 64;

/// Handle to an allocated bus. Stale handles are detected by generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BusId {
    index: u16,
    generation: u32,
}

impl BusId {
    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct BusSlot {
    generation: u32,
    in_use: bool,
}

/// Fixed-size bus allocator. Always hands out the lowest free index.
#[derive(Clone, Debug)]
pub struct BusPool {
    slots: HVec<BusSlot, MAX_BUSES>,
}

impl BusPool {
    pub fn new() -> Self {
        let mut slots = HVec::new();
        while slots.push(BusSlot::default()).is_ok() {}
        Self { slots }
    }

    pub fn allocate(&mut self) -> Option<BusId> {
        let index = self.slots.iter().position(|s| !s.in_use)?;
        let slot = &mut self.slots[index];
        slot.in_use = true;
        Some(BusId {
            index: index as u16,
            generation: slot.generation,
        })
    }

    /// Free a bus. Returns false for stale or unknown handles.
    pub fn release(&mut self, id: BusId) -> bool {
        match self.slots.get_mut(id.index()) {
            Some(slot) if slot.in_use && slot.generation == id.generation => {
                slot.in_use = false;
                slot.generation = slot.generation.wrapping_add(1);
                true
            }
            _ => false,
        }
    }

    pub fn is_live(&self, id: BusId) -> bool {
        self.slots
            .get(id.index())
            .is_some_and(|s| s.in_use && s.generation == id.generation)
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }
}

impl Default for BusPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Something the graph can pull interleaved float frames from.
///
/// Called on the render thread; implementations must not block or allocate.
pub trait GraphSource: Send + Sync {
    /// Fill `out` (interleaved, graph channel count). Return `false` when
    /// the source produced nothing audible and `out` is silence.
    fn pull(&self, out: &mut [f32]) -> bool;
}

struct Input {
    id: BusId,
    source: Arc<dyn GraphSource>,
    /// Row-major `channels x channels`: `matrix[out * channels + in]`
    matrix: Vec<f32>,
    /// Matrix is `gain * identity`
    diagonal: Option<f32>,
}

/// Mixes every attached input into one interleaved output.
pub struct MixerGraph {
    channels: usize,
    pool: BusPool,
    inputs: Vec<Option<Input>>,
    scratch: Vec<f32>,
    master_gain: f32,
}

impl MixerGraph {
    pub fn new(channels: usize) -> Self {
        Self {
            channels: channels.max(1),
            pool: BusPool::new(),
            inputs: (0..MAX_BUSES).map(|_| None).collect(),
            scratch: Vec::new(),
            master_gain: 1.0,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Change the output channel count. Every input keeps its bus but its
    /// matrix is reset to unity.
    pub fn set_channels(&mut self, channels: usize) {
        self.channels = channels.max(1);
        let ch = self.channels;
        for input in self.inputs.iter_mut().flatten() {
            input.matrix = identity(ch, 1.0);
            input.diagonal = Some(1.0);
        }
        let frames = self.max_frames();
        self.set_max_frames(frames);
    }

    /// Preallocate scratch space for `frames` frames per render chunk.
    pub fn set_max_frames(&mut self, frames: usize) {
        self.scratch.clear();
        self.scratch.resize(frames.max(1) * self.channels, 0.0);
    }

    pub fn max_frames(&self) -> usize {
        self.scratch.len() / self.channels
    }

    /// Attach a source on the first free bus with a unity matrix.
    pub fn attach(&mut self, source: Arc<dyn GraphSource>) -> Option<BusId> {
        let id = self.pool.allocate()?;
        self.inputs[id.index()] = Some(Input {
            id,
            source,
            matrix: identity(self.channels, 1.0),
            diagonal: Some(1.0),
        });
        Some(id)
    }

    pub fn detach(&mut self, id: BusId) -> Option<Arc<dyn GraphSource>> {
        if !self.pool.release(id) {
            return None;
        }
        self.inputs[id.index()].take().map(|i| i.source)
    }

    pub fn is_attached(&self, id: BusId) -> bool {
        self.pool.is_live(id)
    }

    pub fn input_count(&self) -> usize {
        self.pool.in_use()
    }

    /// Scale an input uniformly on all channels.
    pub fn set_input_gain(&mut self, id: BusId, gain: f32) -> bool {
        let channels = self.channels;
        match self.input_mut(id) {
            Some(input) => {
                input.matrix = identity(channels, gain);
                input.diagonal = Some(gain);
                true
            }
            None => false,
        }
    }

    /// Replace an input's full gain matrix (`matrix[out * channels + in]`).
    pub fn set_input_matrix(&mut self, id: BusId, matrix: &[f32]) -> bool {
        let channels = self.channels;
        if matrix.len() != channels * channels {
            return false;
        }
        match self.input_mut(id) {
            Some(input) => {
                input.matrix.clear();
                input.matrix.extend_from_slice(matrix);
                input.diagonal = None;
                true
            }
            None => false,
        }
    }

    pub fn set_master_gain(&mut self, gain: f32) {
        self.master_gain = gain;
    }

    pub fn master_gain(&self) -> f32 {
        self.master_gain
    }

    fn input_mut(&mut self, id: BusId) -> Option<&mut Input> {
        if !self.pool.is_live(id) {
            return None;
        }
        self.inputs[id.index()].as_mut().filter(|i| i.id == id)
    }

    /// Pull every input and mix into `out` (overwritten).
    ///
    /// Returns `true` when at least one input produced audio.
    pub fn render(&mut self, out: &mut [f32]) -> bool {
        out.fill(0.0);
        if self.scratch.is_empty() {
            return false;
        }
        let ch = self.channels;
        let chunk_len = (self.scratch.len() / ch) * ch;
        let mut audible = false;

        for chunk in out.chunks_mut(chunk_len) {
            let frames = chunk.len() / ch;
            let samples = frames * ch;
            for input in self.inputs.iter().flatten() {
                let scratch = &mut self.scratch[..samples];
                scratch.fill(0.0);
                if !input.source.pull(scratch) {
                    continue;
                }
                audible = true;
                match input.diagonal {
                    Some(gain) => {
                        for (o, s) in chunk[..samples].iter_mut().zip(scratch.iter()) {
                            *o += s * gain;
                        }
                    }
                    None => {
                        for (out_frame, in_frame) in chunk[..samples]
                            .chunks_exact_mut(ch)
                            .zip(scratch.chunks_exact(ch))
                        {
                            for (o, row) in out_frame.iter_mut().zip(input.matrix.chunks_exact(ch)) {
                                *o += row.iter().zip(in_frame).map(|(g, s)| g * s).sum::<f32>();
                            }
                        }
                    }
                }
            }
        }

        if self.master_gain != 1.0 {
            for s in out.iter_mut() {
                *s *= self.master_gain;
            }
        }
        audible
    }
}

fn identity(channels: usize, gain: f32) -> Vec<f32> {
    let mut m = vec![0.0; channels * channels];
    for c in 0..channels {
        m[c * channels + c] = gain;
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Constant {
        value: f32,
        live: AtomicBool,
    }

    impl Constant {
        fn new(value: f32) -> Arc<Self> {
            Arc::new(Self {
                value,
                live: AtomicBool::new(true),
            })
        }
    }

    impl GraphSource for Constant {
        fn pull(&self, out: &mut [f32]) -> bool {
            if !self.live.load(Ordering::Relaxed) {
                return false;
            }
            out.fill(self.value);
            true
        }
    }

    /// Writes the channel index into each sample.
    struct ChannelIndex;

    impl GraphSource for ChannelIndex {
        fn pull(&self, out: &mut [f32]) -> bool {
            for frame in out.chunks_exact_mut(2) {
                frame[0] = 1.0;
                frame[1] = 2.0;
            }
            true
        }
    }

    #[test]
    fn pool_hands_out_first_free_slot() {
        let mut pool = BusPool::new();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));
        assert!(pool.release(b));
        let d = pool.allocate().unwrap();
        assert_eq!(d.index(), 1);
        assert_ne!(d.generation(), b.generation());
    }

    #[test]
    fn stale_handles_are_rejected() {
        let mut pool = BusPool::new();
        let a = pool.allocate().unwrap();
        assert!(pool.release(a));
        assert!(!pool.release(a));
        let b = pool.allocate().unwrap();
        assert_eq!(a.index(), b.index());
        assert!(!pool.is_live(a));
        assert!(pool.is_live(b));
    }

    #[test]
    fn pool_exhausts_at_max_buses() {
        let mut pool = BusPool::new();
        for _ in 0..MAX_BUSES {
            assert!(pool.allocate().is_some());
        }
        assert!(pool.allocate().is_none());
        assert_eq!(pool.in_use(), MAX_BUSES);
    }

    #[test]
    fn inputs_are_summed() {
        let mut graph = MixerGraph::new(2);
        graph.set_max_frames(16);
        graph.attach(Constant::new(0.25)).unwrap();
        graph.attach(Constant::new(0.5)).unwrap();
        let mut out = vec![0.0; 32];
        assert!(graph.render(&mut out));
        assert!(out.iter().all(|&s| (s - 0.75).abs() < 1e-6));
    }

    #[test]
    fn render_larger_than_scratch_is_chunked() {
        let mut graph = MixerGraph::new(2);
        graph.set_max_frames(4);
        graph.attach(Constant::new(0.5)).unwrap();
        let mut out = vec![0.0; 2 * 11];
        assert!(graph.render(&mut out));
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn silent_inputs_report_silence() {
        let mut graph = MixerGraph::new(2);
        graph.set_max_frames(8);
        let src = Constant::new(1.0);
        src.live.store(false, Ordering::Relaxed);
        graph.attach(src).unwrap();
        let mut out = vec![9.0; 16];
        assert!(!graph.render(&mut out));
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn gain_matrix_swaps_channels() {
        let mut graph = MixerGraph::new(2);
        graph.set_max_frames(4);
        let id = graph.attach(Arc::new(ChannelIndex)).unwrap();
        assert!(graph.set_input_matrix(id, &[0.0, 1.0, 1.0, 0.0]));
        let mut out = vec![0.0; 8];
        graph.render(&mut out);
        assert_eq!(&out[..2], &[2.0, 1.0]);
    }

    #[test]
    fn detach_and_master_gain() {
        let mut graph = MixerGraph::new(1);
        graph.set_max_frames(4);
        let a = graph.attach(Constant::new(1.0)).unwrap();
        let b = graph.attach(Constant::new(1.0)).unwrap();
        graph.set_input_gain(b, 0.5);
        graph.set_master_gain(0.5);
        let mut out = vec![0.0; 4];
        graph.render(&mut out);
        assert!((out[0] - 0.75).abs() < 1e-6);

        assert!(graph.detach(a).is_some());
        assert!(graph.detach(a).is_none());
        assert!(!graph.set_input_gain(a, 1.0));
        graph.render(&mut out);
        assert!((out[0] - 0.25).abs() < 1e-6);
        assert_eq!(graph.input_count(), 1);
    }
}
