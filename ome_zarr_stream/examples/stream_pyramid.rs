//! Simulated acquisition: push synthetic frames into an OME-Zarr pyramid on
//! disk and print the resulting multiscale metadata.
//!
//! ```text
//! cargo run --example stream_pyramid -- --output /tmp/stream.zarr --frames 25
//! ```
//!
//! * Frames arrive faster than a write-then-downsample pipeline could keep up
//!   with, so the pyramid is built while writing. The coarser levels are
//!   readable as soon as their first chunk is stored.
//!
//! * If the acquisition stops early, the arrays are shrunk to what was
//!   actually written at close, the last chunk of each level overhangs the
//!   array edge.

use std::{path::PathBuf, time::Instant};

use clap::Parser;
use log::info;
use ndarray::Array2;
use ome_zarr_stream::{zarr_writer::read_level, Compression, Writer, WriterConfig, ZarrBackend};

#[derive(Parser, Debug)]
struct Args {
    /// Where to put the dataset
    #[arg(short, long, default_value = "/tmp/ome-zarr-stream.zarr")]
    output: PathBuf,

    /// Number of frames to acquire
    #[arg(short, long, default_value_t = 25)]
    frames: u64,

    /// Frame height
    #[arg(long, default_value_t = 512)]
    height: u64,

    /// Frame width
    #[arg(long, default_value_t = 512)]
    width: u64,

    /// Planes per chunk at full resolution
    #[arg(long, default_value_t = 10)]
    chunk_depth: u64,

    #[arg(long, default_value_t = 2)]
    max_level: u32,

    /// Ring buffer slots
    #[arg(long, default_value_t = 4)]
    slots: usize,

    /// Store chunks uncompressed
    #[arg(long)]
    raw: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let compression = if args.raw {
        Compression::None
    } else {
        Compression::LosslessDefault
    };
    let config = WriterConfig::builder(
        "stream_pyramid",
        &[args.frames.max(1), args.height, args.width],
        &[args.chunk_depth, args.height, args.width],
    )
    .max_level(args.max_level)
    .concurrency_depth(args.slots)
    .compression(compression)
    .build()?;

    let backend = ZarrBackend::create(&args.output, &config)
        .map_err(|e| anyhow::anyhow!("could not create dataset: {e}"))?;
    let mut writer = Writer::<u16>::new(config, backend)?;

    let t0 = Instant::now();
    for i in 0..args.frames {
        let frame = Array2::from_shape_fn(
            (args.height as usize, args.width as usize),
            |(y, x)| ((x + y + i as usize * 7) % 4096) as u16,
        );
        writer.add_frame(frame)?;
    }
    writer.close()?;
    info!("{} frames in {:?}", args.frames, t0.elapsed());

    if let Some(metadata) = writer.metadata() {
        println!(
            "metadata: {}",
            serde_json::to_string_pretty(&metadata.to_ome_attributes())?
        );
        for level in &metadata.levels {
            let data = read_level::<u16>(&args.output, level.level)
                .map_err(|e| anyhow::anyhow!("could not read level {}: {e}", level.level))?;
            println!(
                "level {}: shape {:?}, {} chunks",
                level.level,
                data.shape(),
                level.chunks
            );
        }
    }

    Ok(())
}
