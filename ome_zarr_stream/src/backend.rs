use ndarray::ArrayViewD;

use crate::{metadata::MultiscaleMetadata, pixel::PixelType};

pub type BackendError = Box<dyn std::error::Error + Sync + Send + 'static>;

/// Where finished chunks go.
///
/// `write_chunk` receives the planes of one chunk along the append axis,
/// shaped `[depth, plane...]`. For each level, chunks arrive strictly in
/// index order starting at 0, and all but the last have the full chunk
/// depth of that level; the last one may be shorter. Returning `Ok` means
/// the data is durable (or reliably queued), the writer moves on.
///
/// `finalize` is called exactly once, after every level has been flushed.
///
/// Errors are fatal to the writer. If a backend wants to retry, it has to do
/// so before returning.
pub trait StorageBackend<T: PixelType>: Send {
    fn write_chunk(
        &mut self,
        level: u32,
        chunk_index: u64,
        data: ArrayViewD<'_, T>,
    ) -> Result<(), BackendError>;

    fn finalize(&mut self, metadata: &MultiscaleMetadata) -> Result<(), BackendError>;
}

impl<T, B> StorageBackend<T> for Box<B>
where
    T: PixelType,
    B: StorageBackend<T> + ?Sized,
{
    fn write_chunk(
        &mut self,
        level: u32,
        chunk_index: u64,
        data: ArrayViewD<'_, T>,
    ) -> Result<(), BackendError> {
        (**self).write_chunk(level, chunk_index, data)
    }

    fn finalize(&mut self, metadata: &MultiscaleMetadata) -> Result<(), BackendError> {
        (**self).finalize(metadata)
    }
}
