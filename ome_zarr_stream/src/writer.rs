use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use log::{debug, error, info, warn};
use ndarray::{Array, ArrayD, Dimension, IxDyn};

use crate::{
    backend::StorageBackend,
    background_thread::{spawn_consumer, ConsumerResult},
    config::WriterConfig,
    error::{ConfigError, WriterError},
    metadata::MultiscaleMetadata,
    pixel::PixelType,
    ring_buffer::{ring_buffer, FrameProducer, RingError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Open,
    /// `close` is draining the ring buffer and flushing partial chunks.
    Closing,
    Closed,
    /// A backend error ended the stream; terminal.
    Failed,
}

/// Streams frames into a multiscale dataset.
///
/// Frames are queued in a ring buffer with `concurrency_depth` slots and
/// consumed on a background thread that builds the pyramid and writes chunks
/// to the storage backend. `add_frame` blocks while every slot is occupied.
///
/// # Example
///
/// ```
/// use ndarray::Array2;
/// use ome_zarr_stream::{MemoryBackend, Writer, WriterConfig};
///
/// let config = WriterConfig::builder("stack", &[100, 64, 64], &[10, 64, 64])
///     .max_level(2)
///     .build()?;
/// let backend = MemoryBackend::<u16>::new();
/// let store = backend.store();
///
/// let mut writer = Writer::new(config, backend)?;
/// for i in 0..25u16 {
///     writer.add_frame(Array2::from_elem((64, 64), i))?;
/// }
/// writer.close()?;
///
/// assert_eq!(store.chunk_depths(0), vec![10, 10, 5]);
/// assert_eq!(store.chunk_depths(1), vec![10, 2]);
/// assert_eq!(store.chunk_depths(2), vec![6]);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Writer<T: PixelType> {
    config: Arc<WriterConfig>,
    producer: Option<FrameProducer<T>>,
    consumer: Option<JoinHandle<ConsumerResult>>,
    failed: Arc<AtomicBool>,
    state: WriterState,
    accepted: u64,
    metadata: Option<MultiscaleMetadata>,
}

impl<T: PixelType> Writer<T> {
    /// Validate `config` against the element type and start the consumer
    /// thread. No backend I/O happens here.
    pub fn new<B>(config: WriterConfig, backend: B) -> Result<Self, WriterError>
    where
        B: StorageBackend<T> + 'static,
    {
        if config.dtype() != T::DATA_TYPE {
            return Err(ConfigError::DataTypeMismatch {
                configured: config.dtype(),
                element: T::DATA_TYPE,
            }
            .into());
        }

        let config = Arc::new(config);
        let (producer, frames) = ring_buffer(config.concurrency_depth());
        let failed = Arc::new(AtomicBool::new(false));
        let consumer = spawn_consumer(
            Arc::clone(&config),
            frames,
            backend,
            Arc::clone(&failed),
        )?;

        info!(
            "writer {:?} opened: shape {:?}, chunks {:?}, {} levels, {} slots",
            config.name(),
            config.volume_shape(),
            config.chunk_shape(),
            config.num_levels(),
            config.concurrency_depth(),
        );

        Ok(Self {
            config,
            producer: Some(producer),
            consumer: Some(consumer),
            failed,
            state: WriterState::Open,
            accepted: 0,
            metadata: None,
        })
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Number of frames accepted so far, also after `close` or a failure.
    pub fn frames_submitted(&self) -> u64 {
        self.accepted
    }

    /// Metadata of the finished dataset, available after a successful `close`.
    pub fn metadata(&self) -> Option<&MultiscaleMetadata> {
        self.metadata.as_ref()
    }

    /// Queue one frame, blocking while the ring buffer is full. Returns the
    /// sequence index assigned to the frame.
    ///
    /// A frame with the wrong shape, or one that doesn't fit into the volume
    /// anymore, is rejected and the stream continues. A backend error is
    /// fatal: it is returned once, after that the writer is `Failed`.
    pub fn add_frame<D: Dimension>(&mut self, plane: Array<T, D>) -> Result<u64, WriterError> {
        match self.state {
            WriterState::Open => {}
            WriterState::Closing | WriterState::Closed => return Err(WriterError::WriterClosed),
            WriterState::Failed => return Err(WriterError::Failed),
        }
        if self.failed.load(Ordering::Acquire) {
            return Err(self.fail());
        }

        let expected = self.config.plane_shape_usize();
        if plane.shape() != expected.as_slice() {
            return Err(WriterError::ShapeMismatch {
                expected,
                actual: plane.shape().to_vec(),
            });
        }
        if self.frames_submitted() >= self.config.capacity() {
            return Err(WriterError::VolumeFull {
                capacity: self.config.capacity(),
            });
        }

        let producer = self.producer.as_mut().ok_or(WriterError::WriterClosed)?;
        match producer.submit(plane.into_dyn()) {
            Ok(sequence) => {
                self.accepted = producer.submitted();
                Ok(sequence)
            }
            Err(RingError::Disconnected) => Err(self.fail()),
            Err(err) => {
                error!("ring buffer error in {:?}: {err}", self.config.name());
                // the consumer's own error is the root cause, if it has one
                match self.fail() {
                    WriterError::Failed => Err(err.into()),
                    consumer_err => Err(consumer_err),
                }
            }
        }
    }

    /// Queue one frame given as a flat, row-major buffer.
    pub fn add_frame_from_slice(&mut self, data: &[T]) -> Result<u64, WriterError> {
        if data.len() != self.config.plane_len() {
            return Err(WriterError::ShapeMismatch {
                expected: self.config.plane_shape_usize(),
                actual: vec![data.len()],
            });
        }
        let plane = ArrayD::from_shape_vec(IxDyn(&self.config.plane_shape_usize()), data.to_vec())
            .map_err(|_| WriterError::ShapeMismatch {
                expected: self.config.plane_shape_usize(),
                actual: vec![data.len()],
            })?;
        self.add_frame(plane)
    }

    /// Stop accepting frames, wait until every queued frame went through the
    /// pyramid, flush partial chunks and finalize the backend.
    ///
    /// Calling `close` on a closed writer does nothing.
    pub fn close(&mut self) -> Result<(), WriterError> {
        match self.state {
            WriterState::Open => {}
            WriterState::Closing | WriterState::Closed => return Ok(()),
            WriterState::Failed => return Err(WriterError::Failed),
        }
        self.state = WriterState::Closing;
        debug!("closing writer {:?}", self.config.name());

        // hanging up the producer side lets the consumer drain and finish
        drop(self.producer.take());

        match self.join_consumer() {
            Ok(metadata) => {
                info!(
                    "writer {:?} closed: {} frames, levels {:?}",
                    self.config.name(),
                    metadata.shape[0],
                    metadata.paths(),
                );
                self.metadata = Some(metadata);
                self.state = WriterState::Closed;
                Ok(())
            }
            Err(err) => {
                self.state = WriterState::Failed;
                Err(err)
            }
        }
    }

    fn join_consumer(&mut self) -> ConsumerResult {
        match self.consumer.take() {
            Some(handle) => handle.join().map_err(|_| WriterError::ConsumerPanicked)?,
            None => Err(WriterError::Failed),
        }
    }

    /// Move into the failed state and return the error that caused it.
    fn fail(&mut self) -> WriterError {
        self.state = WriterState::Failed;
        drop(self.producer.take());
        match self.join_consumer() {
            Err(err) => err,
            Ok(_) => WriterError::Failed,
        }
    }
}

impl<T: PixelType> Drop for Writer<T> {
    fn drop(&mut self) {
        if self.state == WriterState::Open {
            warn!(
                "writer {:?} dropped while open, closing it",
                self.config.name()
            );
            if let Err(err) = self.close() {
                error!("closing writer {:?} failed: {err}", self.config.name());
            }
        }
    }
}
