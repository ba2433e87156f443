//! The in-process read path: a filesystem Zarr V3 store read chunk by chunk.
//!
//! Reads return the bytes stored for a chunk (or shard) without decoding them, so the
//! measured cost is storage access plus task scheduling.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use itertools::Itertools;
use tracing::trace;

use crate::grid::{ChunkGrid, ChunkIndex, ShapeError};

pub const METADATA_FILE: &str = "zarr.json";

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing array metadata {path:?}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported array metadata: {0}")]
    Unsupported(String),
    #[error("chunk {0:?} lies outside the chunk grid")]
    OutOfGrid(ChunkIndex),
    #[error("read task failed: {0}")]
    Task(String),
}

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Read(#[from] ReadError),
}

/// Something that can read an array chunk by chunk, or all at once.
pub trait ReadPath: Send + Sync {
    fn grid(&self) -> &ChunkGrid;

    fn read_chunk(&self, index: &[u64]) -> Result<Vec<u8>, ReadError>;

    /// Read every chunk of the array as a single operation.
    fn read_all(&self) -> Result<Vec<u8>, ReadError>;
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ArrayMetadata {
    pub zarr_format: u8,
    pub node_type: String,
    pub shape: Vec<u64>,
    pub data_type: String,
    pub chunk_grid: NamedConfiguration<RegularChunkGridConfiguration>,
    pub chunk_key_encoding: ChunkKeyEncoding,
    pub fill_value: serde_json::Value,
    pub codecs: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NamedConfiguration<T> {
    pub name: String,
    pub configuration: T,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RegularChunkGridConfiguration {
    pub chunk_shape: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "name", content = "configuration", rename_all = "lowercase")]
pub enum ChunkKeyEncoding {
    Default {
        #[serde(default = "default_separator")]
        separator: String,
    },
    V2 {
        #[serde(default = "v2_separator")]
        separator: String,
    },
}

fn default_separator() -> String {
    "/".to_owned()
}

fn v2_separator() -> String {
    ".".to_owned()
}

impl ChunkKeyEncoding {
    pub fn key(&self, index: &[u64]) -> String {
        match self {
            ChunkKeyEncoding::Default { separator } => {
                std::iter::once("c".to_owned())
                    .chain(index.iter().map(u64::to_string))
                    .join(separator)
            }
            ChunkKeyEncoding::V2 { separator } => index.iter().join(separator),
        }
    }
}

/// Size in bytes of one element of a Zarr V3 core data type.
pub fn element_size(data_type: &str) -> Option<usize> {
    Some(match data_type {
        "bool" | "int8" | "uint8" => 1,
        "int16" | "uint16" | "float16" | "bfloat16" => 2,
        "int32" | "uint32" | "float32" => 4,
        "int64" | "uint64" | "float64" | "complex64" => 8,
        "complex128" => 16,
        _ => return None,
    })
}

impl ArrayMetadata {
    /// Metadata for an uncompressed array with a regular chunk grid.
    pub fn new_uncompressed(
        shape: Vec<u64>,
        chunk_shape: Vec<u64>,
        data_type: &str,
        chunk_key_encoding: ChunkKeyEncoding,
    ) -> Self {
        ArrayMetadata {
            zarr_format: 3,
            node_type: "array".to_owned(),
            shape,
            data_type: data_type.to_owned(),
            chunk_grid: NamedConfiguration {
                name: "regular".to_owned(),
                configuration: RegularChunkGridConfiguration { chunk_shape },
            },
            chunk_key_encoding,
            fill_value: serde_json::Value::from(0),
            codecs: vec![serde_json::json!({
                "name": "bytes",
                "configuration": { "endian": "little" }
            })],
            attributes: serde_json::Map::new(),
        }
    }
}

#[derive(Debug)]
pub struct FilesystemStore {
    root: PathBuf,
    metadata: ArrayMetadata,
    grid: ChunkGrid,
}

impl FilesystemStore {
    /// Open the array rooted at `root` and build its chunk grid.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, OpenError> {
        let root = root.into();
        let path = root.join(METADATA_FILE);
        let bytes = std::fs::read(&path).map_err(|source| ReadError::Io {
            path: path.clone(),
            source,
        })?;
        let metadata: ArrayMetadata = serde_json::from_slice(&bytes)
            .map_err(|source| ReadError::Metadata { path, source })?;
        if metadata.zarr_format != 3 || metadata.node_type != "array" {
            return Err(ReadError::Unsupported(format!(
                "expected a zarr_format 3 array, got zarr_format {} {}",
                metadata.zarr_format, metadata.node_type
            ))
            .into());
        }
        if metadata.chunk_grid.name != "regular" {
            return Err(ReadError::Unsupported(format!(
                "chunk grid {:?}",
                metadata.chunk_grid.name
            ))
            .into());
        }
        let grid = ChunkGrid::new(
            &metadata.shape,
            &metadata.chunk_grid.configuration.chunk_shape,
        )?;
        Ok(Self {
            root,
            metadata,
            grid,
        })
    }

    /// Create a new array at `root`, writing its metadata. Chunks are written separately.
    pub fn create(root: impl Into<PathBuf>, metadata: ArrayMetadata) -> Result<Self, OpenError> {
        let root = root.into();
        let grid = ChunkGrid::new(
            &metadata.shape,
            &metadata.chunk_grid.configuration.chunk_shape,
        )?;
        let io_err = |path: &Path| {
            let path = path.to_owned();
            move |source| ReadError::Io { path, source }
        };
        std::fs::create_dir_all(&root).map_err(io_err(&root))?;
        let path = root.join(METADATA_FILE);
        let json = serde_json::to_vec_pretty(&metadata).map_err(|source| ReadError::Metadata {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, json).map_err(io_err(&path))?;
        Ok(Self {
            root,
            metadata,
            grid,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata(&self) -> &ArrayMetadata {
        &self.metadata
    }

    pub fn chunk_path(&self, index: &[u64]) -> PathBuf {
        self.root
            .join(self.metadata.chunk_key_encoding.key(index))
    }

    /// Write the stored bytes of one chunk, creating parent directories as needed.
    pub fn write_chunk(&self, index: &[u64], bytes: &[u8]) -> Result<(), ReadError> {
        if self.grid.region(index).is_none() {
            return Err(ReadError::OutOfGrid(index.to_vec()));
        }
        let path = self.chunk_path(index);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ReadError::Io {
                path: parent.to_owned(),
                source,
            })?;
        }
        std::fs::write(&path, bytes).map_err(|source| ReadError::Io { path, source })
    }

    /// Total size in bytes of all files under the array root.
    pub fn size(&self) -> Result<u64, ReadError> {
        fn dir_size(dir: &Path) -> Result<u64, ReadError> {
            let io_err = |source| ReadError::Io {
                path: dir.to_owned(),
                source,
            };
            let mut total = 0;
            for entry in std::fs::read_dir(dir).map_err(io_err)? {
                let entry = entry.map_err(io_err)?;
                let file_type = entry.file_type().map_err(io_err)?;
                if file_type.is_dir() {
                    total += dir_size(&entry.path())?;
                } else {
                    total += entry.metadata().map_err(io_err)?.len();
                }
            }
            Ok(total)
        }
        dir_size(&self.root)
    }
}

impl ReadPath for FilesystemStore {
    fn grid(&self) -> &ChunkGrid {
        &self.grid
    }

    fn read_chunk(&self, index: &[u64]) -> Result<Vec<u8>, ReadError> {
        let Some(region) = self.grid.region(index) else {
            return Err(ReadError::OutOfGrid(index.to_vec()));
        };
        let path = self.chunk_path(index);
        trace!(?index, ?region, ?path, "reading chunk");
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            // chunks that were never written hold the fill value
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(ReadError::Io { path, source }),
        }
    }

    fn read_all(&self) -> Result<Vec<u8>, ReadError> {
        let mut bytes = Vec::new();
        for index in self.grid.indices() {
            bytes.extend_from_slice(&self.read_chunk(&index)?);
        }
        Ok(bytes)
    }
}
