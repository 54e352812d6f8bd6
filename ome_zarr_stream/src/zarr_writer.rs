//! OME-Zarr backend on top of a zarrs `FilesystemStore`.
//!
//! Layout: the root group carries the `ome.multiscales` attributes, every
//! level is a zarr v3 array at `/<level>`.
//!
//! While the acquisition runs, each level array has the capacity shape of
//! that level, so readers can already look at the chunks written so far.
//! `finalize` then rewrites the array metadata with the number of slices that
//! were actually written: the last chunk overhangs the edge of the array,
//! which regular chunk grids allow.

use std::{
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info, warn};
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use serde::{Deserialize, Serialize};
use zarrs::{
    array::{
        chunk_grid::ChunkGrid,
        codec::{BytesToBytesCodecTraits, GzipCodec, ZstdCodec},
        Array, ArrayBuilder, DataType as ZarrDataType, Element, ElementOwned, FillValue,
    },
    array_subset::ArraySubset,
    filesystem::{FilesystemStore, FilesystemStoreOptions},
    group::{Group, GroupBuilder},
    storage::{ReadableWritableListableStorage, ReadableWritableListableStorageTraits},
};

use crate::{
    backend::{BackendError, StorageBackend},
    config::{Compression, WriterConfig},
    layout::{LevelLayout, PyramidLayout},
    metadata::MultiscaleMetadata,
    pixel::{DataType, PixelType},
};

/// Codec settings understood by [`ZarrBackend`], passed in through
/// `Compression::BackendSpecific`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "codec", rename_all = "lowercase")]
pub enum ZarrCompression {
    Zstd { level: i32, checksum: bool },
    Gzip { level: u32 },
}

impl ZarrCompression {
    pub const LOSSLESS_DEFAULT: ZarrCompression = ZarrCompression::Zstd {
        level: 5,
        checksum: true,
    };

    pub fn from_config(compression: &Compression) -> Result<Option<Self>, BackendError> {
        match compression {
            Compression::None => Ok(None),
            Compression::LosslessDefault => Ok(Some(Self::LOSSLESS_DEFAULT)),
            Compression::BackendSpecific(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }

    fn codec(&self) -> Result<Arc<dyn BytesToBytesCodecTraits>, BackendError> {
        let codec: Arc<dyn BytesToBytesCodecTraits> = match self {
            ZarrCompression::Zstd { level, checksum } => Arc::new(ZstdCodec::new(*level, *checksum)),
            ZarrCompression::Gzip { level } => Arc::new(GzipCodec::new(*level)?),
        };
        Ok(codec)
    }
}

/// Options read from `WriterConfig::backend_options`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZarrBackendOptions {
    /// Bypass the page cache when writing chunks.
    pub direct_io: bool,
}

impl ZarrBackendOptions {
    pub fn from_config(config: &WriterConfig) -> Result<Self, BackendError> {
        match config.backend_options() {
            serde_json::Value::Null => Ok(Self::default()),
            value => Ok(serde_json::from_value(value.clone())?),
        }
    }
}

fn zarr_data_type(dtype: DataType) -> (ZarrDataType, FillValue) {
    match dtype {
        DataType::UInt8 => (ZarrDataType::UInt8, FillValue::from(0u8)),
        DataType::UInt16 => (ZarrDataType::UInt16, FillValue::from(0u16)),
        DataType::UInt32 => (ZarrDataType::UInt32, FillValue::from(0u32)),
        DataType::UInt64 => (ZarrDataType::UInt64, FillValue::from(0u64)),
        DataType::Int8 => (ZarrDataType::Int8, FillValue::from(0i8)),
        DataType::Int16 => (ZarrDataType::Int16, FillValue::from(0i16)),
        DataType::Int32 => (ZarrDataType::Int32, FillValue::from(0i32)),
        DataType::Int64 => (ZarrDataType::Int64, FillValue::from(0i64)),
        DataType::Float32 => (ZarrDataType::Float32, FillValue::from(0f32)),
        DataType::Float64 => (ZarrDataType::Float64, FillValue::from(0f64)),
    }
}

fn array_path(level: &LevelLayout) -> String {
    format!("/{}", level.path)
}

/// Writes the pyramid as an OME-Zarr 0.5 dataset on the local filesystem.
pub struct ZarrBackend {
    save_path: PathBuf,
    options: ZarrBackendOptions,
    /// Opened on the first chunk or on `finalize`.
    store: Option<ReadableWritableListableStorage>,
    layout: PyramidLayout,
    dtype: DataType,
    dimension_names: Vec<String>,
    compression: Option<ZarrCompression>,
    arrays: Vec<Option<Array<dyn ReadableWritableListableStorageTraits>>>,
}

impl ZarrBackend {
    /// Prepare a dataset at `save_path`. Only the options are checked here;
    /// the store and root group are created when the first chunk arrives (or
    /// at `finalize`), so a writer that is rejected leaves nothing on disk.
    pub fn create(save_path: &Path, config: &WriterConfig) -> Result<Self, BackendError> {
        let options = ZarrBackendOptions::from_config(config)?;
        let compression = ZarrCompression::from_config(config.compression())?;
        if let Some(compression) = &compression {
            compression.codec()?;
        }

        let layout = PyramidLayout::new(config);
        let arrays = layout.levels().iter().map(|_| None).collect();
        Ok(Self {
            save_path: save_path.to_owned(),
            options,
            store: None,
            dtype: config.dtype(),
            dimension_names: config.axes().iter().map(|a| a.name.clone()).collect(),
            compression,
            layout,
            arrays,
        })
    }

    fn store(&mut self) -> Result<ReadableWritableListableStorage, BackendError> {
        if let Some(store) = &self.store {
            return Ok(Arc::clone(store));
        }
        let mut opts = FilesystemStoreOptions::default();
        opts.direct_io(self.options.direct_io);
        let store: ReadableWritableListableStorage =
            Arc::new(FilesystemStore::new_with_options(&self.save_path, opts)?);

        GroupBuilder::new()
            .build(Arc::clone(&store), "/")?
            .store_metadata()?;
        debug!("root group stored at {:?}", self.save_path);

        self.store = Some(Arc::clone(&store));
        Ok(store)
    }

    fn level_layout(&self, level: u32) -> Result<&LevelLayout, BackendError> {
        self.layout
            .level(level)
            .ok_or_else(|| format!("no such level: {level}").into())
    }

    fn build_array(
        &self,
        store: ReadableWritableListableStorage,
        level: &LevelLayout,
        shape: Vec<u64>,
    ) -> Result<Array<dyn ReadableWritableListableStorageTraits>, BackendError> {
        let (data_type, fill_value) = zarr_data_type(self.dtype);
        let chunk_grid: ChunkGrid = level
            .chunk_shape
            .clone()
            .try_into()
            .map_err(|e| format!("invalid chunk shape {:?}: {e:?}", level.chunk_shape))?;

        let mut builder = ArrayBuilder::new(shape, data_type, chunk_grid, fill_value);
        builder.dimension_names(Some(
            self.dimension_names.iter().map(String::as_str).collect::<Vec<_>>(),
        ));
        if let Some(compression) = &self.compression {
            builder.bytes_to_bytes_codecs(vec![compression.codec()?]);
        }
        Ok(builder.build(store, &array_path(level))?)
    }

    fn array_for_level(
        &mut self,
        level: u32,
    ) -> Result<&Array<dyn ReadableWritableListableStorageTraits>, BackendError> {
        let idx = level as usize;
        if self.arrays.get(idx).is_some_and(Option::is_none) {
            let store = self.store()?;
            let layout = self.level_layout(level)?.clone();
            let array = self.build_array(store, &layout, layout.capacity_shape.clone())?;
            array.store_metadata()?;
            debug!(
                "level {level}: array metadata stored, capacity shape {:?}",
                layout.capacity_shape
            );
            self.arrays[idx] = Some(array);
        }
        self.arrays
            .get(idx)
            .and_then(Option::as_ref)
            .ok_or_else(|| format!("no such level: {level}").into())
    }
}

impl<T> StorageBackend<T> for ZarrBackend
where
    T: PixelType + Element,
{
    fn write_chunk(
        &mut self,
        level: u32,
        chunk_index: u64,
        data: ArrayViewD<'_, T>,
    ) -> Result<(), BackendError> {
        let layout = self.level_layout(level)?;
        let start = chunk_index * layout.chunk_depth();
        let depth = data.shape()[0] as u64;
        let ranges: Vec<Range<u64>> = std::iter::once(start..start + depth)
            .chain(layout.plane_shape().iter().map(|&extent| 0..extent))
            .collect();
        let subset = ArraySubset::new_with_ranges(&ranges);

        let data = data.as_standard_layout();
        let elements = data
            .as_slice()
            .ok_or("chunk data is not contiguous")?;

        let array = self.array_for_level(level)?;
        array.store_array_subset_elements::<T>(&subset, elements)?;
        debug!("level {level}: stored chunk {chunk_index} ({depth} slices)");
        Ok(())
    }

    fn finalize(&mut self, metadata: &MultiscaleMetadata) -> Result<(), BackendError> {
        if metadata.levels.is_empty() {
            warn!("no level was populated, only writing group metadata");
        }
        let store = self.store()?;
        for level in &metadata.levels {
            let layout = self.level_layout(level.level)?.clone();
            let array = self.build_array(Arc::clone(&store), &layout, level.shape.clone())?;
            array.store_metadata()?;
            debug!("level {}: final shape {:?}", level.level, level.shape);
        }

        GroupBuilder::new()
            .attributes(metadata.to_ome_attributes())
            .build(store, "/")?
            .store_metadata()?;
        info!(
            "multiscale metadata stored for {:?}: levels {:?}",
            metadata.name,
            metadata.paths()
        );
        Ok(())
    }
}

fn open_store(save_path: &Path) -> Result<ReadableWritableListableStorage, BackendError> {
    Ok(Arc::new(FilesystemStore::new(save_path)?))
}

/// Read one level of a dataset written by [`ZarrBackend`]. Works on
/// datasets that are still being written, too.
pub fn read_level<T>(save_path: &Path, level: u32) -> Result<ArrayD<T>, BackendError>
where
    T: PixelType + ElementOwned,
{
    let array = Array::open(open_store(save_path)?, &format!("/{level}"))?;
    let shape = array.shape().to_vec();
    let subset = ArraySubset::new_with_shape(shape.clone());
    let elements = array.retrieve_array_subset_elements::<T>(&subset)?;
    let shape: Vec<usize> = shape.iter().map(|&e| e as usize).collect();
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), elements)?)
}

/// Attributes of the root group, including the `ome` entry after finalize.
pub fn read_group_attributes(
    save_path: &Path,
) -> Result<serde_json::Map<String, serde_json::Value>, BackendError> {
    let group = Group::open(open_store(save_path)?, "/")?;
    Ok(group.attributes().clone())
}

#[cfg(test)]
mod test {
    use ndarray::{Array2, Axis};
    use serde_json::json;
    use tempfile::tempdir;

    use super::{read_group_attributes, read_level, ZarrBackend, ZarrCompression};
    use crate::{
        config::{Compression, WriterConfig},
        error::{ConfigError, WriterError},
        pixel::DataType,
        writer::Writer,
    };

    fn frame(seed: u16) -> Array2<u16> {
        Array2::from_shape_fn((12, 10), |(y, x)| seed * 100 + (y * 10 + x) as u16)
    }

    #[test]
    fn test_compression_from_config() {
        assert_eq!(ZarrCompression::from_config(&Compression::None).unwrap(), None);
        assert_eq!(
            ZarrCompression::from_config(&Compression::LosslessDefault).unwrap(),
            Some(ZarrCompression::LOSSLESS_DEFAULT)
        );
        assert_eq!(
            ZarrCompression::from_config(&Compression::BackendSpecific(
                json!({"codec": "gzip", "level": 4})
            ))
            .unwrap(),
            Some(ZarrCompression::Gzip { level: 4 })
        );
        assert!(ZarrCompression::from_config(&Compression::BackendSpecific(
            json!({"codec": "lz77"})
        ))
        .is_err());
    }

    #[test]
    fn test_write_pyramid() {
        let dir = tempdir().unwrap();
        let config = WriterConfig::builder("zarr", &[40, 12, 10], &[4, 8, 8])
            .max_level(2)
            .build()
            .unwrap();
        let backend = ZarrBackend::create(dir.path(), &config).unwrap();
        let mut writer = Writer::<u16>::new(config, backend).unwrap();
        let frames: Vec<_> = (0..11).map(frame).collect();
        for f in &frames {
            writer.add_frame(f.clone()).unwrap();
        }
        writer.close().unwrap();

        let level0 = read_level::<u16>(dir.path(), 0).unwrap();
        assert_eq!(level0.shape(), &[11, 12, 10]);
        for (i, f) in frames.iter().enumerate() {
            assert_eq!(level0.index_axis(Axis(0), i), f.view().into_dyn());
        }

        let level1 = read_level::<u16>(dir.path(), 1).unwrap();
        assert_eq!(level1.shape(), &[5, 6, 5]);
        let level2 = read_level::<u16>(dir.path(), 2).unwrap();
        assert_eq!(level2.shape(), &[2, 3, 3]);

        let attributes = read_group_attributes(dir.path()).unwrap();
        let multiscales = &attributes["ome"]["multiscales"][0];
        assert_eq!(multiscales["datasets"][0]["path"], "0");
        assert_eq!(multiscales["datasets"][2]["path"], "2");
        assert_eq!(
            multiscales["datasets"][2]["coordinateTransformations"][0]["scale"],
            json!([4.0, 4.0, 4.0])
        );
    }

    #[test]
    fn test_unpopulated_levels_are_absent() {
        let dir = tempdir().unwrap();
        let config = WriterConfig::builder("short", &[40, 12, 10], &[4, 12, 10])
            .max_level(2)
            .compression(Compression::None)
            .build()
            .unwrap();
        let backend = ZarrBackend::create(dir.path(), &config).unwrap();
        let mut writer = Writer::<u16>::new(config, backend).unwrap();
        writer.add_frame(frame(1)).unwrap();
        writer.close().unwrap();

        assert_eq!(read_level::<u16>(dir.path(), 0).unwrap().shape(), &[1, 12, 10]);
        assert!(read_level::<u16>(dir.path(), 1).is_err());

        let attributes = read_group_attributes(dir.path()).unwrap();
        let datasets = attributes["ome"]["multiscales"][0]["datasets"]
            .as_array()
            .unwrap()
            .len();
        assert_eq!(datasets, 1);
    }

    #[test]
    fn test_float_gzip() {
        let dir = tempdir().unwrap();
        let config = WriterConfig::builder("float", &[8, 4, 4], &[2, 4, 4])
            .dtype(DataType::Float32)
            .max_level(1)
            .compression(Compression::BackendSpecific(
                json!({"codec": "gzip", "level": 5}),
            ))
            .build()
            .unwrap();
        let backend = ZarrBackend::create(dir.path(), &config).unwrap();
        let mut writer = Writer::<f32>::new(config, backend).unwrap();
        writer.add_frame(Array2::<f32>::from_elem((4, 4), 1.0)).unwrap();
        writer.add_frame(Array2::<f32>::from_elem((4, 4), 2.0)).unwrap();
        writer.close().unwrap();

        let level1 = read_level::<f32>(dir.path(), 1).unwrap();
        assert_eq!(level1.shape(), &[1, 2, 2]);
        assert!(level1.iter().all(|&v| v == 1.5));
    }

    #[test]
    fn test_rejected_writer_leaves_no_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rejected.zarr");
        let config = WriterConfig::builder("rejected", &[8, 4, 4], &[2, 4, 4])
            .build()
            .unwrap();
        let backend = ZarrBackend::create(&path, &config).unwrap();
        let result = Writer::<f32>::new(config, backend);
        assert!(matches!(
            result,
            Err(WriterError::Config(ConfigError::DataTypeMismatch { .. }))
        ));
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_close_without_frames_writes_group() {
        let dir = tempdir().unwrap();
        let config = WriterConfig::builder("empty", &[8, 4, 4], &[2, 4, 4])
            .build()
            .unwrap();
        let backend = ZarrBackend::create(dir.path(), &config).unwrap();
        let mut writer = Writer::<u16>::new(config, backend).unwrap();
        writer.close().unwrap();

        let attributes = read_group_attributes(dir.path()).unwrap();
        assert_eq!(attributes["ome"]["version"], "0.5");
        assert!(read_level::<u16>(dir.path(), 0).is_err());
    }
}
