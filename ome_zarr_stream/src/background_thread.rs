use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Instant,
};

use log::{debug, error, info, trace, warn};

use crate::{
    backend::StorageBackend,
    config::WriterConfig,
    error::WriterError,
    layout::PyramidLayout,
    metadata::MultiscaleMetadata,
    pixel::PixelType,
    pyramid::PyramidBuilder,
    ring_buffer::FrameConsumer,
};

pub type ConsumerResult = Result<MultiscaleMetadata, WriterError>;

/// Drain the ring buffer into the pyramid until the producer hangs up, then
/// flush everything and finalize the backend.
fn consume<T, B>(
    config: &WriterConfig,
    mut frames: FrameConsumer<T>,
    backend: &mut B,
) -> ConsumerResult
where
    T: PixelType,
    B: StorageBackend<T> + ?Sized,
{
    let t0 = Instant::now();
    let mut pyramid = PyramidBuilder::new(PyramidLayout::new(config));

    while let Some(in_use) = frames.recv()? {
        trace!(
            "consuming frame {} from slot {}",
            in_use.frame().sequence(),
            in_use.slot()
        );
        pyramid
            .push_frame(in_use.frame().view(), backend)
            .map_err(WriterError::Backend)?;
        frames.release(in_use)?;
    }

    debug!("ring buffer drained after {} frames", pyramid.frames());
    pyramid.finish(backend).map_err(WriterError::Backend)?;

    let metadata = pyramid.metadata(config);
    if metadata.levels.is_empty() {
        warn!("finalizing {:?} without any populated level", config.name());
    }
    backend.finalize(&metadata).map_err(WriterError::Backend)?;

    let elapsed = t0.elapsed();
    info!(
        "{}: {} frames written in {elapsed:?}; slices per level: {:?}",
        config.name(),
        pyramid.frames(),
        metadata.levels.iter().map(|l| l.slices).collect::<Vec<_>>(),
    );
    Ok(metadata)
}

/// Convert consumer errors into the shared failure flag, so the producer
/// side notices without waiting on a slot.
fn background_thread_wrap<T, B>(
    config: Arc<WriterConfig>,
    frames: FrameConsumer<T>,
    mut backend: B,
    failed: Arc<AtomicBool>,
) -> ConsumerResult
where
    T: PixelType,
    B: StorageBackend<T>,
{
    debug!("consumer thread for {:?} started", config.name());
    let result = consume(&config, frames, &mut backend);
    if let Err(err) = &result {
        error!("consumer thread err'd: {err}");
        failed.store(true, Ordering::Release);
    }
    debug!("consumer thread for {:?} is done", config.name());
    result
}

pub fn spawn_consumer<T, B>(
    config: Arc<WriterConfig>,
    frames: FrameConsumer<T>,
    backend: B,
    failed: Arc<AtomicBool>,
) -> Result<JoinHandle<ConsumerResult>, WriterError>
where
    T: PixelType,
    B: StorageBackend<T> + 'static,
{
    std::thread::Builder::new()
        .name(format!("ome-zarr-consumer-{}", config.name()))
        .spawn(move || background_thread_wrap(config, frames, backend, failed))
        .map_err(WriterError::Spawn)
}
