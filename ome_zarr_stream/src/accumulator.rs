use log::debug;
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Slice};

use crate::{
    backend::{BackendError, StorageBackend},
    layout::LevelLayout,
    metadata::LevelStats,
    pixel::PixelType,
};

/// Collects the slices of one level until a chunk along the append axis is
/// complete, then hands it to the backend.
///
/// The chunk buffer is allocated once and reused for every chunk.
pub struct ChunkAccumulator<T> {
    level: u32,
    buffer: ArrayD<T>,
    filled: usize,
    next_chunk_index: u64,
    slices: u64,
}

impl<T: PixelType> ChunkAccumulator<T> {
    pub fn new(layout: &LevelLayout) -> Self {
        let mut shape = vec![layout.chunk_depth() as usize];
        shape.extend(layout.plane_shape_usize());
        Self {
            level: layout.level,
            buffer: ArrayD::from_elem(IxDyn(&shape), T::default()),
            filled: 0,
            next_chunk_index: 0,
            slices: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.buffer.len_of(Axis(0))
    }

    /// Slices currently buffered, not yet handed to the backend.
    pub fn pending(&self) -> usize {
        self.filled
    }

    pub fn stats(&self) -> LevelStats {
        LevelStats {
            slices: self.slices,
            chunks: self.next_chunk_index,
            discarded_input: false,
        }
    }

    /// Append one slice, flushing the chunk if it is now full.
    ///
    /// `slice` must have the plane shape of this level.
    pub fn push<B>(&mut self, slice: ArrayViewD<'_, T>, backend: &mut B) -> Result<(), BackendError>
    where
        B: StorageBackend<T> + ?Sized,
    {
        if slice.shape() != &self.buffer.shape()[1..] {
            return Err(format!(
                "level {}: slice shape {:?} does not match plane shape {:?}",
                self.level,
                slice.shape(),
                &self.buffer.shape()[1..]
            )
            .into());
        }
        self.buffer
            .index_axis_mut(Axis(0), self.filled)
            .assign(&slice);
        self.filled += 1;
        self.slices += 1;
        if self.filled == self.depth() {
            self.flush(backend)?;
        }
        Ok(())
    }

    /// Flush a partially filled chunk. Does nothing if the buffer is empty.
    pub fn finish<B>(&mut self, backend: &mut B) -> Result<(), BackendError>
    where
        B: StorageBackend<T> + ?Sized,
    {
        if self.filled > 0 {
            self.flush(backend)?;
        }
        Ok(())
    }

    fn flush<B>(&mut self, backend: &mut B) -> Result<(), BackendError>
    where
        B: StorageBackend<T> + ?Sized,
    {
        let chunk_index = self.next_chunk_index;
        let view = self
            .buffer
            .slice_axis(Axis(0), Slice::from(0..self.filled));
        debug!(
            "level {}: flushing chunk {chunk_index} with {} slices",
            self.level, self.filled
        );
        backend.write_chunk(self.level, chunk_index, view)?;
        self.next_chunk_index += 1;
        self.filled = 0;
        Ok(())
    }
}
