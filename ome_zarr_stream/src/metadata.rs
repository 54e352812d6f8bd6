//! Summary of a finished pyramid, handed to `StorageBackend::finalize`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    config::{AxisDescriptor, WriterConfig},
    layout::PyramidLayout,
    pixel::DataType,
};

pub const OME_NGFF_VERSION: &str = "0.5";

/// What one level of the pyramid received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelStats {
    pub slices: u64,
    pub chunks: u64,
    /// Whether a dangling finer-level slice was dropped at close instead of
    /// being reduced into this level.
    pub discarded_input: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelMetadata {
    pub level: u32,
    pub path: String,
    /// Final shape; axis 0 is the number of slices written.
    pub shape: Vec<u64>,
    pub chunk_shape: Vec<u64>,
    pub downsample_factors: Vec<u64>,
    /// Scale relative to level 0, per axis.
    pub scale: Vec<f64>,
    pub slices: u64,
    pub chunks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiscaleMetadata {
    pub name: String,
    pub dtype: DataType,
    pub axes: Vec<AxisDescriptor>,
    /// Full-resolution shape; axis 0 is the number of frames ingested.
    pub shape: Vec<u64>,
    /// Only levels that received at least one slice.
    pub levels: Vec<LevelMetadata>,
    /// Number of odd trailing slices dropped at close, over all levels.
    pub discarded_slices: u64,
}

impl MultiscaleMetadata {
    pub fn new(
        config: &WriterConfig,
        layout: &PyramidLayout,
        stats: &[LevelStats],
        frames: u64,
    ) -> Self {
        let levels = layout
            .levels()
            .iter()
            .zip(stats)
            .filter(|(_, stats)| stats.slices > 0)
            .map(|(level, stats)| LevelMetadata {
                level: level.level,
                path: level.path.clone(),
                shape: level.shape_with_slices(stats.slices),
                chunk_shape: level.chunk_shape.clone(),
                downsample_factors: level.downsample_factors.clone(),
                scale: level.downsample_factors.iter().map(|&f| f as f64).collect(),
                slices: stats.slices,
                chunks: stats.chunks,
            })
            .collect();

        let mut shape = config.volume_shape().to_vec();
        shape[0] = frames;

        Self {
            name: config.name().to_owned(),
            dtype: config.dtype(),
            axes: config.axes().to_vec(),
            shape,
            levels,
            discarded_slices: stats.iter().filter(|s| s.discarded_input).count() as u64,
        }
    }

    pub fn level(&self, level: u32) -> Option<&LevelMetadata> {
        self.levels.iter().find(|l| l.level == level)
    }

    /// Paths of the populated levels, finest first.
    pub fn paths(&self) -> Vec<&str> {
        self.levels.iter().map(|l| l.path.as_str()).collect()
    }

    /// The `multiscales` entry of an OME-NGFF image group.
    pub fn to_multiscales(&self) -> Value {
        let datasets: Vec<Value> = self
            .levels
            .iter()
            .map(|level| {
                json!({
                    "path": level.path,
                    "coordinateTransformations": [
                        { "type": "scale", "scale": level.scale }
                    ],
                })
            })
            .collect();

        json!({
            "name": self.name,
            "axes": self.axes,
            "datasets": datasets,
            "type": "mean",
            "metadata": {
                "method": "box mean over 2^n blocks, rounded half to even",
                "shape": self.shape,
                "discarded_slices": self.discarded_slices,
            },
        })
    }

    /// Group attributes for an OME-Zarr 0.5 image.
    pub fn to_ome_attributes(&self) -> serde_json::Map<String, Value> {
        let mut attributes = serde_json::Map::new();
        attributes.insert(
            "ome".to_owned(),
            json!({
                "version": OME_NGFF_VERSION,
                "multiscales": [self.to_multiscales()],
            }),
        );
        attributes
    }
}

#[cfg(test)]
mod test {
    use super::{LevelStats, MultiscaleMetadata};
    use crate::{config::WriterConfig, layout::PyramidLayout};

    #[test]
    fn test_empty_levels_are_omitted() {
        let config = WriterConfig::builder("stack", &[100, 16, 16], &[10, 16, 16])
            .max_level(2)
            .build()
            .unwrap();
        let layout = PyramidLayout::new(&config);
        let stats = [
            LevelStats {
                slices: 1,
                chunks: 1,
                discarded_input: false,
            },
            LevelStats {
                slices: 0,
                chunks: 0,
                discarded_input: true,
            },
            LevelStats::default(),
        ];
        let metadata = MultiscaleMetadata::new(&config, &layout, &stats, 1);
        assert_eq!(metadata.paths(), vec!["0"]);
        assert_eq!(metadata.shape, vec![1, 16, 16]);
        assert_eq!(metadata.discarded_slices, 1);
        assert!(metadata.level(1).is_none());
    }

    #[test]
    fn test_ome_attributes() {
        let config = WriterConfig::builder("stack", &[100, 16, 16], &[10, 16, 16])
            .max_level(1)
            .build()
            .unwrap();
        let layout = PyramidLayout::new(&config);
        let stats = [
            LevelStats {
                slices: 4,
                chunks: 1,
                discarded_input: false,
            },
            LevelStats {
                slices: 2,
                chunks: 1,
                discarded_input: false,
            },
        ];
        let metadata = MultiscaleMetadata::new(&config, &layout, &stats, 4);
        let attributes = metadata.to_ome_attributes();
        let ome = &attributes["ome"];
        assert_eq!(ome["version"], "0.5");

        let multiscales = &ome["multiscales"][0];
        assert_eq!(multiscales["name"], "stack");
        assert_eq!(multiscales["axes"][0]["name"], "z");
        assert_eq!(multiscales["axes"][0]["type"], "space");
        assert_eq!(multiscales["axes"][2]["unit"], "micrometer");
        assert_eq!(multiscales["datasets"][1]["path"], "1");
        let scale = &multiscales["datasets"][1]["coordinateTransformations"][0];
        assert_eq!(scale["type"], "scale");
        assert_eq!(scale["scale"], serde_json::json!([2.0, 2.0, 2.0]));

        let level1 = metadata.level(1).unwrap();
        assert_eq!(level1.shape, vec![2, 8, 8]);
        assert_eq!(level1.chunk_shape, vec![10, 8, 8]);
    }
}
