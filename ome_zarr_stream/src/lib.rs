//! Streaming writer for multiscale (OME-Zarr) volumes.
//!
//! Frames are pushed one plane at a time into a [`Writer`]. A background
//! thread builds the resolution pyramid incrementally, collects each level
//! into chunks along the append axis and hands finished chunks to a
//! [`StorageBackend`]. Coarser levels are produced on the fly, so there is no
//! downsampling pass after the acquisition.

pub mod accumulator;
pub mod backend;
mod background_thread;
pub mod config;
pub mod error;
pub mod frame;
pub mod layout;
pub mod memory_backend;
pub mod metadata;
pub mod pixel;
pub mod pyramid;
pub mod ring_buffer;
pub mod writer;
pub mod zarr_writer;

pub use backend::{BackendError, StorageBackend};
pub use config::{AxisDescriptor, AxisKind, Compression, WriterConfig, WriterConfigBuilder};
pub use error::{ConfigError, WriterError};
pub use memory_backend::{MemoryBackend, MemoryStore};
pub use metadata::{LevelMetadata, MultiscaleMetadata};
pub use pixel::{DataType, PixelType};
pub use writer::{Writer, WriterState};
pub use zarr_writer::{ZarrBackend, ZarrCompression};
