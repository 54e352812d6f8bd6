//! In-memory `StorageBackend`, for tests and for previewing a dataset while
//! it is being written.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;
use ndarray::{concatenate, ArrayD, ArrayViewD, Axis};

use crate::{
    backend::{BackendError, StorageBackend},
    metadata::MultiscaleMetadata,
    pixel::PixelType,
};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk<T> {
    pub level: u32,
    pub chunk_index: u64,
    pub data: ArrayD<T>,
}

#[derive(Debug)]
struct Inner<T> {
    chunks: Vec<StoredChunk<T>>,
    metadata: Option<MultiscaleMetadata>,
    finalize_calls: usize,
}

/// Shared view on everything a [`MemoryBackend`] has received. Stays usable
/// after the backend itself has been moved into a writer.
#[derive(Debug)]
pub struct MemoryStore<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for MemoryStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: PixelType> MemoryStore<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All chunks of `level`, in the order they were written.
    pub fn chunks(&self, level: u32) -> Vec<StoredChunk<T>> {
        self.lock()
            .chunks
            .iter()
            .filter(|c| c.level == level)
            .cloned()
            .collect()
    }

    /// Depth of each chunk of `level`, in write order.
    pub fn chunk_depths(&self, level: u32) -> Vec<usize> {
        self.chunks(level)
            .iter()
            .map(|c| c.data.len_of(Axis(0)))
            .collect()
    }

    /// Total number of `write_chunk` calls over all levels.
    pub fn write_count(&self) -> usize {
        self.lock().chunks.len()
    }

    /// Concatenate the chunks of `level` along the append axis.
    pub fn read_level(&self, level: u32) -> Option<ArrayD<T>> {
        let chunks = self.chunks(level);
        let views: Vec<_> = chunks.iter().map(|c| c.data.view()).collect();
        if views.is_empty() {
            return None;
        }
        concatenate(Axis(0), &views).ok()
    }

    pub fn metadata(&self) -> Option<MultiscaleMetadata> {
        self.lock().metadata.clone()
    }

    pub fn finalize_calls(&self) -> usize {
        self.lock().finalize_calls
    }
}

/// Keeps every chunk in memory. Rejects chunks that arrive out of index
/// order, so it doubles as a check of the write ordering.
#[derive(Debug)]
pub struct MemoryBackend<T> {
    store: MemoryStore<T>,
}

impl<T: PixelType> Default for MemoryBackend<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PixelType> MemoryBackend<T> {
    pub fn new() -> Self {
        Self {
            store: MemoryStore {
                inner: Arc::new(Mutex::new(Inner {
                    chunks: Vec::new(),
                    metadata: None,
                    finalize_calls: 0,
                })),
            },
        }
    }

    pub fn store(&self) -> MemoryStore<T> {
        self.store.clone()
    }
}

impl<T: PixelType> StorageBackend<T> for MemoryBackend<T> {
    fn write_chunk(
        &mut self,
        level: u32,
        chunk_index: u64,
        data: ArrayViewD<'_, T>,
    ) -> Result<(), BackendError> {
        let mut inner = self.store.lock();
        let expected = inner.chunks.iter().filter(|c| c.level == level).count() as u64;
        if chunk_index != expected {
            return Err(format!(
                "level {level}: got chunk {chunk_index}, expected chunk {expected}"
            )
            .into());
        }
        debug!(
            "memory backend: level {level} chunk {chunk_index} shape {:?}",
            data.shape()
        );
        inner.chunks.push(StoredChunk {
            level,
            chunk_index,
            data: data.to_owned(),
        });
        Ok(())
    }

    fn finalize(&mut self, metadata: &MultiscaleMetadata) -> Result<(), BackendError> {
        let mut inner = self.store.lock();
        inner.finalize_calls += 1;
        inner.metadata = Some(metadata.clone());
        Ok(())
    }
}
