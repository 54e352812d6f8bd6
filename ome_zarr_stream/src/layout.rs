//! Shapes of the arrays that make up the pyramid.
//!
//! Level `L` is downsampled by `2^L` along every axis, including the append
//! axis. Extents round up, so odd edges keep a (smaller) output element.

use serde::{Deserialize, Serialize};

use crate::config::WriterConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelLayout {
    pub level: u32,
    /// Array path relative to the multiscale group.
    pub path: String,
    pub downsample_factors: Vec<u64>,
    /// Shape of the level if every frame the volume can hold was written.
    pub capacity_shape: Vec<u64>,
    pub chunk_shape: Vec<u64>,
}

impl LevelLayout {
    fn new(config: &WriterConfig, level: u32) -> Self {
        let factor = 1u64 << level;
        let capacity_shape: Vec<u64> = config
            .volume_shape()
            .iter()
            .map(|&extent| extent.div_ceil(factor))
            .collect();
        let chunk_shape = config
            .chunk_shape()
            .iter()
            .zip(&capacity_shape)
            .map(|(&chunk, &extent)| chunk.min(extent))
            .collect();
        Self {
            level,
            path: level.to_string(),
            downsample_factors: vec![factor; config.rank()],
            capacity_shape,
            chunk_shape,
        }
    }

    pub fn factor(&self) -> u64 {
        1u64 << self.level
    }

    pub fn plane_shape(&self) -> &[u64] {
        &self.capacity_shape[1..]
    }

    pub fn plane_shape_usize(&self) -> Vec<usize> {
        self.plane_shape().iter().map(|&e| e as usize).collect()
    }

    /// Planes per chunk along the append axis.
    pub fn chunk_depth(&self) -> u64 {
        self.chunk_shape[0]
    }

    /// Maximum number of planes this level can receive.
    pub fn capacity(&self) -> u64 {
        self.capacity_shape[0]
    }

    /// Shape of the level once `slices` planes have been written.
    pub fn shape_with_slices(&self, slices: u64) -> Vec<u64> {
        let mut shape = self.capacity_shape.clone();
        shape[0] = slices;
        shape
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PyramidLayout {
    levels: Vec<LevelLayout>,
}

impl PyramidLayout {
    pub fn new(config: &WriterConfig) -> Self {
        Self {
            levels: (0..=config.max_level())
                .map(|level| LevelLayout::new(config, level))
                .collect(),
        }
    }

    pub fn levels(&self) -> &[LevelLayout] {
        &self.levels
    }

    pub fn level(&self, level: u32) -> Option<&LevelLayout> {
        self.levels.get(level as usize)
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }
}
