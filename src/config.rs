//! TOML job configuration for the `affine-fusion` binary.
//!
//! ```toml
//! transform = [
//!     [1.0, 0.0, 0.0, 4.5],
//!     [0.0, 1.0, 0.0, 0.0],
//!     [0.0, 0.0, 2.0, 0.0],
//!     [0.0, 0.0, 0.0, 1.0],
//! ]
//! method = "cubspl"
//! preserve_dtype = true
//! chunk_shape = [64, 256, 256]
//! device_count = 2
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::chunks::ChunkSize;
use crate::coordinator::TransformJob;
use crate::enums::Method;
use crate::kernels::DEFAULT_BLOCK_SHAPE;
use crate::transform::AffineMatrix;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML {path:?}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_block_shape() -> [usize; 3] {
    let (z, y, x) = DEFAULT_BLOCK_SHAPE;
    [z, y, x]
}

/// One chunked transform, as read from a TOML file. Shapes are `[z, y, x]`.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResampleConfig {
    /// 4x4 rows, XYZ + homogeneous.
    pub transform: [[f64; 4]; 4],
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub preserve_dtype: bool,
    #[serde(default)]
    pub out_shape: Option<[usize; 3]>,
    pub chunk_shape: ChunkSize,
    #[serde(default = "default_block_shape")]
    pub block_shape: [usize; 3],
    /// Upper bound on the devices used; all discovered devices otherwise.
    #[serde(default)]
    pub device_count: Option<usize>,
}

impl ResampleConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Toml {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject zero extents and singular transforms up front.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.affine()?;
        let (cz, cy, cx) = self.chunk_shape.shape();
        if cz == 0 || cy == 0 || cx == 0 {
            return Err(ConfigError::Invalid(format!(
                "chunk_shape {:?} has a zero extent",
                [cz, cy, cx]
            )));
        }
        if self.block_shape.contains(&0) {
            return Err(ConfigError::Invalid(format!(
                "block_shape {:?} has a zero extent",
                self.block_shape
            )));
        }
        if let Some(shape) = self.out_shape.filter(|s| s.contains(&0)) {
            return Err(ConfigError::Invalid(format!(
                "out_shape {shape:?} has a zero extent"
            )));
        }
        if self.device_count == Some(0) {
            return Err(ConfigError::Invalid("device_count must be positive".into()));
        }
        Ok(())
    }

    pub fn affine(&self) -> Result<AffineMatrix, ConfigError> {
        AffineMatrix::from_rows(self.transform).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn job(&self) -> Result<TransformJob, ConfigError> {
        let [bz, by, bx] = self.block_shape;
        Ok(TransformJob {
            transform: self.affine()?,
            method: self.method,
            preserve_dtype: self.preserve_dtype,
            out_shape: self.out_shape.map(|[z, y, x]| (z, y, x)),
            chunk_shape: self.chunk_shape,
            block_shape: (bz, by, bx),
        })
    }
}
