use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, pixel::DataType};

/// Upper bound for `max_level`, keeps `2^level` comfortably inside `u64`.
pub const MAX_LEVEL_LIMIT: u32 = 30;

pub const DEFAULT_CONCURRENCY_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisKind {
    Space,
    Time,
    Channel,
}

/// Name, kind and unit of one dataset axis, as listed in the multiscale
/// metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AxisKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl AxisDescriptor {
    pub fn space(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: AxisKind::Space,
            unit: Some("micrometer".to_owned()),
        }
    }

    pub fn time(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: AxisKind::Time,
            unit: Some("second".to_owned()),
        }
    }

    pub fn channel(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: AxisKind::Channel,
            unit: None,
        }
    }

    pub fn with_unit(mut self, unit: Option<&str>) -> Self {
        self.unit = unit.map(str::to_owned);
        self
    }

    /// Default axes for a volume of the given rank: `y, x` for 2D,
    /// `z, y, x` for 3D, `t, z, y, x` for 4D, and a leading `t` followed by
    /// generic spatial axes beyond that.
    pub fn defaults_for_rank(rank: usize) -> Vec<Self> {
        match rank {
            0 => vec![],
            1 => vec![Self::space("x")],
            2 => vec![Self::space("y"), Self::space("x")],
            3 => vec![Self::space("z"), Self::space("y"), Self::space("x")],
            4 => vec![
                Self::time("t"),
                Self::space("z"),
                Self::space("y"),
                Self::space("x"),
            ],
            n => generic_defaults(n),
        }
    }
}

fn generic_defaults(rank: usize) -> Vec<AxisDescriptor> {
    std::iter::once(AxisDescriptor::time("t"))
        .chain((1..rank).map(|i| AxisDescriptor::space(&format!("dim_{i}"))))
        .collect()
}

/// How chunks should be compressed. Only `None` and `LosslessDefault` have a
/// meaning to this crate; `BackendSpecific` is handed through to the storage
/// backend untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    #[default]
    LosslessDefault,
    BackendSpecific(serde_json::Value),
}

/// Validated, immutable description of the dataset a `Writer` produces.
///
/// Axis 0 of `volume_shape` is the append axis: every submitted frame is one
/// plane along it, shaped like the remaining axes. Build one with
/// [`WriterConfig::builder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WriterConfigBuilder", into = "WriterConfigBuilder")]
pub struct WriterConfig {
    name: String,
    volume_shape: Vec<u64>,
    chunk_shape: Vec<u64>,
    dtype: DataType,
    max_level: u32,
    compression: Compression,
    axes: Vec<AxisDescriptor>,
    concurrency_depth: usize,
    backend_options: serde_json::Value,
}

impl WriterConfig {
    pub fn builder(name: &str, volume_shape: &[u64], chunk_shape: &[u64]) -> WriterConfigBuilder {
        WriterConfigBuilder {
            name: name.to_owned(),
            volume_shape: volume_shape.to_vec(),
            chunk_shape: chunk_shape.to_vec(),
            dtype: default_dtype(),
            max_level: 0,
            compression: Compression::default(),
            axes: None,
            concurrency_depth: DEFAULT_CONCURRENCY_DEPTH,
            backend_options: serde_json::Value::Null,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn volume_shape(&self) -> &[u64] {
        &self.volume_shape
    }

    /// Chunk shape, already clamped against the volume shape.
    pub fn chunk_shape(&self) -> &[u64] {
        &self.chunk_shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    pub fn num_levels(&self) -> usize {
        self.max_level as usize + 1
    }

    pub fn compression(&self) -> &Compression {
        &self.compression
    }

    pub fn axes(&self) -> &[AxisDescriptor] {
        &self.axes
    }

    pub fn concurrency_depth(&self) -> usize {
        self.concurrency_depth
    }

    pub fn backend_options(&self) -> &serde_json::Value {
        &self.backend_options
    }

    pub fn rank(&self) -> usize {
        self.volume_shape.len()
    }

    /// Maximum number of frames along the append axis.
    pub fn capacity(&self) -> u64 {
        self.volume_shape[0]
    }

    /// Shape of a single frame.
    pub fn plane_shape(&self) -> &[u64] {
        &self.volume_shape[1..]
    }

    pub fn plane_shape_usize(&self) -> Vec<usize> {
        self.plane_shape().iter().map(|&e| e as usize).collect()
    }

    pub fn plane_len(&self) -> usize {
        self.plane_shape().iter().product::<u64>() as usize
    }

    /// Number of planes per chunk at full resolution.
    pub fn chunk_depth(&self) -> u64 {
        self.chunk_shape[0]
    }
}

fn default_dtype() -> DataType {
    DataType::UInt16
}

fn default_concurrency_depth() -> usize {
    DEFAULT_CONCURRENCY_DEPTH
}

/// Unvalidated form of a [`WriterConfig`]; also the serialized representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterConfigBuilder {
    name: String,
    volume_shape: Vec<u64>,
    chunk_shape: Vec<u64>,
    #[serde(default = "default_dtype")]
    dtype: DataType,
    #[serde(default)]
    max_level: u32,
    #[serde(default)]
    compression: Compression,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    axes: Option<Vec<AxisDescriptor>>,
    #[serde(default = "default_concurrency_depth")]
    concurrency_depth: usize,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    backend_options: serde_json::Value,
}

impl WriterConfigBuilder {
    pub fn dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn max_level(mut self, max_level: u32) -> Self {
        self.max_level = max_level;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn axes(mut self, axes: Vec<AxisDescriptor>) -> Self {
        self.axes = Some(axes);
        self
    }

    pub fn concurrency_depth(mut self, depth: usize) -> Self {
        self.concurrency_depth = depth;
        self
    }

    pub fn backend_options(mut self, options: serde_json::Value) -> Self {
        self.backend_options = options;
        self
    }

    pub fn build(self) -> Result<WriterConfig, ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }

        let rank = self.volume_shape.len();
        if rank < 2 {
            return Err(ConfigError::RankTooSmall { rank });
        }
        if self.chunk_shape.len() != rank {
            return Err(ConfigError::RankMismatch {
                volume: rank,
                chunk: self.chunk_shape.len(),
            });
        }
        if let Some(axis) = self.volume_shape.iter().position(|&e| e == 0) {
            return Err(ConfigError::ZeroExtent { axis });
        }
        if let Some(axis) = self.chunk_shape.iter().position(|&e| e == 0) {
            return Err(ConfigError::ZeroChunk { axis });
        }
        if self.concurrency_depth == 0 {
            return Err(ConfigError::ZeroConcurrencyDepth);
        }
        if self.max_level > MAX_LEVEL_LIMIT {
            return Err(ConfigError::MaxLevelTooLarge {
                max_level: self.max_level,
                limit: MAX_LEVEL_LIMIT,
            });
        }

        let axes = self
            .axes
            .unwrap_or_else(|| AxisDescriptor::defaults_for_rank(rank));
        if axes.len() != rank {
            return Err(ConfigError::AxisCount {
                expected: rank,
                got: axes.len(),
            });
        }
        let mut seen = HashSet::new();
        for axis in &axes {
            if !seen.insert(axis.name.as_str()) {
                return Err(ConfigError::DuplicateAxis {
                    name: axis.name.clone(),
                });
            }
        }

        let chunk_shape = self
            .chunk_shape
            .iter()
            .zip(&self.volume_shape)
            .map(|(&chunk, &extent)| chunk.min(extent))
            .collect();

        Ok(WriterConfig {
            name: self.name,
            volume_shape: self.volume_shape,
            chunk_shape,
            dtype: self.dtype,
            max_level: self.max_level,
            compression: self.compression,
            axes,
            concurrency_depth: self.concurrency_depth,
            backend_options: self.backend_options,
        })
    }
}

impl TryFrom<WriterConfigBuilder> for WriterConfig {
    type Error = ConfigError;

    fn try_from(builder: WriterConfigBuilder) -> Result<Self, Self::Error> {
        builder.build()
    }
}

impl From<WriterConfig> for WriterConfigBuilder {
    fn from(config: WriterConfig) -> Self {
        Self {
            name: config.name,
            volume_shape: config.volume_shape,
            chunk_shape: config.chunk_shape,
            dtype: config.dtype,
            max_level: config.max_level,
            compression: config.compression,
            axes: Some(config.axes),
            concurrency_depth: config.concurrency_depth,
            backend_options: config.backend_options,
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::{AxisDescriptor, AxisKind, Compression, WriterConfig};
    use crate::{error::ConfigError, pixel::DataType};

    #[test]
    fn test_defaults() {
        let config = WriterConfig::builder("stack", &[100, 512, 512], &[10, 512, 512])
            .build()
            .unwrap();
        assert_eq!(config.dtype(), DataType::UInt16);
        assert_eq!(config.max_level(), 0);
        assert_eq!(config.concurrency_depth(), 4);
        assert_eq!(config.compression(), &Compression::LosslessDefault);
        assert_eq!(config.plane_shape(), &[512, 512]);
        assert_eq!(config.plane_len(), 512 * 512);
        assert_eq!(config.capacity(), 100);
        let names: Vec<_> = config.axes().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["z", "y", "x"]);
    }

    #[test]
    fn test_chunk_is_clamped() {
        let config = WriterConfig::builder("stack", &[5, 64, 32], &[10, 128, 16])
            .build()
            .unwrap();
        assert_eq!(config.chunk_shape(), &[5, 64, 16]);
        assert_eq!(config.chunk_depth(), 5);
    }

    #[test]
    fn test_validation_errors() {
        let err = |b: super::WriterConfigBuilder| b.build().unwrap_err();

        assert_eq!(
            err(WriterConfig::builder("", &[1, 2], &[1, 2])),
            ConfigError::EmptyName
        );
        assert_eq!(
            err(WriterConfig::builder("a", &[10], &[1])),
            ConfigError::RankTooSmall { rank: 1 }
        );
        assert_eq!(
            err(WriterConfig::builder("a", &[10, 4, 4], &[1, 4])),
            ConfigError::RankMismatch {
                volume: 3,
                chunk: 2
            }
        );
        assert_eq!(
            err(WriterConfig::builder("a", &[10, 0, 4], &[1, 4, 4])),
            ConfigError::ZeroExtent { axis: 1 }
        );
        assert_eq!(
            err(WriterConfig::builder("a", &[10, 4, 4], &[1, 4, 0])),
            ConfigError::ZeroChunk { axis: 2 }
        );
        assert_eq!(
            err(WriterConfig::builder("a", &[10, 4, 4], &[1, 4, 4]).concurrency_depth(0)),
            ConfigError::ZeroConcurrencyDepth
        );
        assert_eq!(
            err(WriterConfig::builder("a", &[10, 4, 4], &[1, 4, 4]).max_level(31)),
            ConfigError::MaxLevelTooLarge {
                max_level: 31,
                limit: 30
            }
        );
        assert_eq!(
            err(WriterConfig::builder("a", &[10, 4, 4], &[1, 4, 4])
                .axes(vec![AxisDescriptor::space("y"), AxisDescriptor::space("x")])),
            ConfigError::AxisCount {
                expected: 3,
                got: 2
            }
        );
        assert_eq!(
            err(WriterConfig::builder("a", &[10, 4, 4], &[1, 4, 4]).axes(vec![
                AxisDescriptor::time("t"),
                AxisDescriptor::space("x"),
                AxisDescriptor::space("x"),
            ])),
            ConfigError::DuplicateAxis {
                name: "x".to_owned()
            }
        );
    }

    #[test]
    fn test_default_axes() {
        let axes = AxisDescriptor::defaults_for_rank(4);
        assert_eq!(axes[0].kind, AxisKind::Time);
        assert_eq!(axes[0].unit.as_deref(), Some("second"));
        assert_eq!(axes[3].name, "x");

        let axes = AxisDescriptor::defaults_for_rank(6);
        assert_eq!(axes.len(), 6);
        assert_eq!(axes[0].name, "t");
        assert_eq!(axes[5].name, "dim_5");
    }

    #[test]
    fn test_deserialize_validates() {
        let config: WriterConfig = serde_json::from_value(json!({
            "name": "stack",
            "volume_shape": [20, 8, 8],
            "chunk_shape": [4, 8, 8],
            "dtype": "uint8",
            "max_level": 2,
            "compression": "none",
        }))
        .unwrap();
        assert_eq!(config.dtype(), DataType::UInt8);
        assert_eq!(config.max_level(), 2);
        assert_eq!(config.compression(), &Compression::None);

        let invalid = serde_json::from_value::<WriterConfig>(json!({
            "name": "stack",
            "volume_shape": [20, 8, 8],
            "chunk_shape": [4, 8],
        }));
        assert!(invalid.is_err());
    }

    #[test]
    fn test_serde_roundtrip_keeps_opaque_options() {
        let config = WriterConfig::builder("stack", &[20, 8, 8], &[4, 8, 8])
            .compression(Compression::BackendSpecific(
                json!({"codec": "gzip", "level": 3}),
            ))
            .backend_options(json!({"direct_io": true}))
            .build()
            .unwrap();
        let encoded = serde_json::to_value(&config).unwrap();
        let decoded: WriterConfig = serde_json::from_value(encoded).unwrap();
        assert_eq!(config, decoded);
    }
}
