//! Incremental pyramid construction.
//!
//! Level 0 receives every frame as is. Each coarser level `L` receives one
//! slice for every two slices of level `L - 1`: the first of a pair is held
//! in that level's carry state, the second triggers a 2x box mean over every
//! axis and the result cascades further down. A slice still held when the
//! stream ends is dropped, so level `L` ends up with `floor(N / 2^L)` slices
//! for `N` frames.

use log::{trace, warn};
use ndarray::{ArrayD, ArrayViewD, CowArray, IxDyn, Slice};

use crate::{
    accumulator::ChunkAccumulator,
    backend::{BackendError, StorageBackend},
    config::WriterConfig,
    layout::PyramidLayout,
    metadata::{LevelStats, MultiscaleMetadata},
    pixel::PixelType,
};

/// Carry state of one coarser level.
#[derive(Debug)]
pub struct LevelState<T> {
    /// Finer slices received so far; never reset.
    inputs: u64,
    /// First slice of an incomplete pair.
    pending: Option<ArrayD<T>>,
    discarded: bool,
}

impl<T> LevelState<T> {
    fn new() -> Self {
        Self {
            inputs: 0,
            pending: None,
            discarded: false,
        }
    }

    pub fn inputs(&self) -> u64 {
        self.inputs
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

fn block<'a, T>(view: &'a ArrayViewD<'_, T>, index: &IxDyn) -> ArrayViewD<'a, T> {
    view.slice_each_axis(|ax| {
        let start = 2 * index[ax.axis.index()];
        Slice::from(start..(start + 2).min(ax.len))
    })
}

/// Reduce two consecutive slices into one slice of half the extent (rounded
/// up) along every axis. Each output element is the mean of the up to
/// `2 * 2^rank` input elements it covers.
pub fn downsample_pair<T: PixelType>(first: ArrayViewD<'_, T>, second: ArrayViewD<'_, T>) -> ArrayD<T> {
    debug_assert_eq!(first.shape(), second.shape());
    let shape: Vec<usize> = first.shape().iter().map(|&e| e.div_ceil(2)).collect();
    ArrayD::from_shape_fn(IxDyn(&shape), |index| {
        let mut acc = T::Accumulator::default();
        let mut count = 0u32;
        for &value in block(&first, &index).iter().chain(block(&second, &index).iter()) {
            acc = T::accumulate(acc, value);
            count += 1;
        }
        T::finish(acc, count)
    })
}

/// Owns the per-level chunk accumulators and carry states.
pub struct PyramidBuilder<T> {
    layout: PyramidLayout,
    accumulators: Vec<ChunkAccumulator<T>>,
    /// Index `i` belongs to level `i + 1`.
    carry: Vec<LevelState<T>>,
    frames: u64,
}

impl<T: PixelType> PyramidBuilder<T> {
    pub fn new(layout: PyramidLayout) -> Self {
        let accumulators = layout.levels().iter().map(ChunkAccumulator::new).collect();
        let carry = (1..layout.num_levels()).map(|_| LevelState::new()).collect();
        Self {
            layout,
            accumulators,
            carry,
            frames: 0,
        }
    }

    pub fn layout(&self) -> &PyramidLayout {
        &self.layout
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn level_state(&self, level: u32) -> Option<&LevelState<T>> {
        (level as usize)
            .checked_sub(1)
            .and_then(|i| self.carry.get(i))
    }

    /// Feed one full-resolution frame through every level it reaches.
    pub fn push_frame<B>(&mut self, frame: ArrayViewD<'_, T>, backend: &mut B) -> Result<(), BackendError>
    where
        B: StorageBackend<T> + ?Sized,
    {
        self.accumulators[0].push(frame.view(), backend)?;
        self.frames += 1;

        let mut finer = CowArray::from(frame);
        for (i, state) in self.carry.iter_mut().enumerate() {
            let level = i + 1;
            state.inputs += 1;
            let Some(previous) = state.pending.take() else {
                state.pending = Some(finer.into_owned());
                break;
            };
            let coarser = downsample_pair(previous.view(), finer.view());
            trace!("level {level}: reduced slice from inputs {}", state.inputs);
            self.accumulators[level].push(coarser.view(), backend)?;
            finer = CowArray::from(coarser);
        }
        Ok(())
    }

    /// Flush all partial chunks and drop slices that never got a partner.
    pub fn finish<B>(&mut self, backend: &mut B) -> Result<(), BackendError>
    where
        B: StorageBackend<T> + ?Sized,
    {
        for accumulator in self.accumulators.iter_mut() {
            accumulator.finish(backend)?;
        }
        for (i, state) in self.carry.iter_mut().enumerate() {
            if state.pending.take().is_some() {
                warn!(
                    "level {}: discarding unpaired slice after {} inputs",
                    i + 1,
                    state.inputs
                );
                state.discarded = true;
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> Vec<LevelStats> {
        self.accumulators
            .iter()
            .enumerate()
            .map(|(level, accumulator)| LevelStats {
                discarded_input: self.level_state(level as u32).is_some_and(|s| s.discarded),
                ..accumulator.stats()
            })
            .collect()
    }

    pub fn metadata(&self, config: &WriterConfig) -> MultiscaleMetadata {
        MultiscaleMetadata::new(config, &self.layout, &self.stats(), self.frames)
    }
}

#[cfg(test)]
mod test {
    use ndarray::{arr2, Array2, ArrayD, IxDyn};

    use super::{downsample_pair, PyramidBuilder};
    use crate::{
        config::WriterConfig, layout::PyramidLayout, memory_backend::MemoryBackend,
    };

    fn builder(volume: &[u64], chunk: &[u64], max_level: u32) -> (WriterConfig, PyramidBuilder<u16>) {
        let config = WriterConfig::builder("pyramid", volume, chunk)
            .max_level(max_level)
            .build()
            .unwrap();
        let layout = PyramidLayout::new(&config);
        (config, PyramidBuilder::new(layout))
    }

    fn ramp(seed: u16, shape: &[usize]) -> ArrayD<u16> {
        ArrayD::from_shape_fn(IxDyn(shape), |idx| {
            seed.wrapping_mul(31)
                .wrapping_add((idx[0] * 7 + idx[1] * 3) as u16)
        })
    }

    #[test]
    fn test_downsample_pair_rounds_half_even() {
        let a = arr2(&[[0u8, 1], [1, 1]]).into_dyn();
        let b = arr2(&[[1u8, 1], [1, 2]]).into_dyn();
        // sum 8 over 8 elements
        assert_eq!(downsample_pair(a.view(), b.view()), arr2(&[[1u8]]).into_dyn());

        let a = arr2(&[[0u8, 0], [0, 0]]).into_dyn();
        let b = arr2(&[[0u8, 0], [1, 3]]).into_dyn();
        // 4 / 8 = 0.5 -> 0
        assert_eq!(downsample_pair(a.view(), b.view()), arr2(&[[0u8]]).into_dyn());

        let b = arr2(&[[0u8, 1], [2, 9]]).into_dyn();
        // 12 / 8 = 1.5 -> 2
        assert_eq!(downsample_pair(a.view(), b.view()), arr2(&[[2u8]]).into_dyn());
    }

    #[test]
    fn test_downsample_pair_odd_edges() {
        let a: Array2<u16> = arr2(&[[1, 3, 10], [5, 7, 20], [100, 100, 100]]);
        let b: Array2<u16> = arr2(&[[1, 3, 30], [5, 7, 40], [200, 200, 200]]);
        let out = downsample_pair(a.into_dyn().view(), b.into_dyn().view());
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out[[0, 0]], 4);
        // right edge: 10, 20, 30, 40
        assert_eq!(out[[0, 1]], 25);
        // bottom edge: 100, 100, 200, 200
        assert_eq!(out[[1, 0]], 150);
        // corner: 100, 200
        assert_eq!(out[[1, 1]], 150);
    }

    #[test]
    fn test_downsample_no_overflow() {
        let a = ArrayD::from_elem(IxDyn(&[2, 2]), u16::MAX);
        let out = downsample_pair(a.view(), a.view());
        assert_eq!(out[[0, 0]], u16::MAX);
    }

    #[test]
    fn test_cascade_rate() {
        let (_config, mut pyramid) = builder(&[100, 8, 8], &[4, 8, 8], 3);
        let mut backend = MemoryBackend::new();
        let store = backend.store();
        for n in 0..13u16 {
            pyramid.push_frame(ramp(n, &[8, 8]).view(), &mut backend).unwrap();
        }
        pyramid.finish(&mut backend).unwrap();

        let slices: Vec<u64> = pyramid.stats().iter().map(|s| s.slices).collect();
        assert_eq!(slices, vec![13, 6, 3, 1]);
        assert_eq!(store.read_level(1).unwrap().shape(), &[6, 4, 4]);
        assert_eq!(store.read_level(3).unwrap().shape(), &[1, 1, 1]);

        // 13 = 0b1101: levels 1 and 3 had an unpaired input at the end
        let discarded: Vec<bool> = pyramid.stats().iter().map(|s| s.discarded_input).collect();
        assert_eq!(discarded, vec![false, true, false, true]);
        assert_eq!(pyramid.level_state(1).unwrap().inputs(), 13);
        assert_eq!(pyramid.level_state(2).unwrap().inputs(), 6);
        assert!(!pyramid.level_state(2).unwrap().has_pending());
    }

    #[test]
    fn test_coarser_levels_reduce_finer_output() {
        let (_config, mut pyramid) = builder(&[100, 8, 8], &[2, 8, 8], 2);
        let mut backend = MemoryBackend::new();
        let store = backend.store();
        let frames: Vec<_> = (0..8u16).map(|n| ramp(n * 11, &[8, 8])).collect();
        for frame in &frames {
            pyramid.push_frame(frame.view(), &mut backend).unwrap();
        }
        pyramid.finish(&mut backend).unwrap();

        let level0 = store.read_level(0).unwrap();
        let level1 = store.read_level(1).unwrap();
        let level2 = store.read_level(2).unwrap();

        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(level0.index_axis(ndarray::Axis(0), i), frame.view());
        }
        for i in 0..4 {
            let expected = downsample_pair(
                level0.index_axis(ndarray::Axis(0), 2 * i),
                level0.index_axis(ndarray::Axis(0), 2 * i + 1),
            );
            assert_eq!(level1.index_axis(ndarray::Axis(0), i), expected.view());
        }
        for i in 0..2 {
            let expected = downsample_pair(
                level1.index_axis(ndarray::Axis(0), 2 * i),
                level1.index_axis(ndarray::Axis(0), 2 * i + 1),
            );
            assert_eq!(level2.index_axis(ndarray::Axis(0), i), expected.view());
        }
    }

    #[test]
    fn test_single_frame_only_populates_level_zero() {
        let (config, mut pyramid) = builder(&[100, 8, 8], &[10, 8, 8], 2);
        let mut backend = MemoryBackend::new();
        let store = backend.store();
        pyramid.push_frame(ramp(1, &[8, 8]).view(), &mut backend).unwrap();
        pyramid.finish(&mut backend).unwrap();

        assert_eq!(store.chunk_depths(0), vec![1]);
        assert!(store.read_level(1).is_none());
        let metadata = pyramid.metadata(&config);
        assert_eq!(metadata.paths(), vec!["0"]);
        assert_eq!(metadata.discarded_slices, 1);
    }
}
