use crate::{backend::BackendError, pixel::DataType, ring_buffer::RingError};

/// A `WriterConfig` that can't describe a dataset.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("dataset name must not be empty")]
    EmptyName,

    #[error("volume shape needs an append axis and at least one plane axis, got rank {rank}")]
    RankTooSmall { rank: usize },

    #[error("volume shape has rank {volume} but chunk shape has rank {chunk}")]
    RankMismatch { volume: usize, chunk: usize },

    #[error("volume extent along axis {axis} must be positive")]
    ZeroExtent { axis: usize },

    #[error("chunk extent along axis {axis} must be positive")]
    ZeroChunk { axis: usize },

    #[error("expected {expected} axis descriptors, got {got}")]
    AxisCount { expected: usize, got: usize },

    #[error("axis name {name:?} is used more than once")]
    DuplicateAxis { name: String },

    #[error("concurrency depth must be at least 1")]
    ZeroConcurrencyDepth,

    #[error("max level {max_level} is larger than the supported maximum {limit}")]
    MaxLevelTooLarge { max_level: u32, limit: u32 },

    #[error("configured dtype is {configured}, but the writer was created for {element}")]
    DataTypeMismatch {
        configured: DataType,
        element: DataType,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum WriterError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The frame was rejected; the stream continues.
    #[error("frame has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// The frame was rejected; the stream continues.
    #[error("volume is full: the append axis holds at most {capacity} frames")]
    VolumeFull { capacity: u64 },

    #[error("writer is closed")]
    WriterClosed,

    /// The storage backend reported a failure; the writer is now unusable.
    #[error("storage backend error: {0}")]
    Backend(#[source] BackendError),

    /// A previous error already moved the writer into its failed state.
    #[error("writer has failed and accepts no further work")]
    Failed,

    #[error("ring buffer error: {0}")]
    Ring(#[from] RingError),

    #[error("could not start consumer thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("consumer thread panicked")]
    ConsumerPanicked,
}
