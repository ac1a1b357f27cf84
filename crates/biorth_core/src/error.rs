//! Error types for the expansion core.

use std::path::PathBuf;

use thiserror::Error;

use crate::basis::Field;
use crate::roots::RootFamily;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cache header mismatch on '{field}': cached {cached}, requested {requested}")]
    CacheMismatch {
        field: String,
        cached: String,
        requested: String,
    },

    #[error("cache file {} is corrupt: {detail}", path.display())]
    CacheCorrupt { path: PathBuf, detail: String },

    #[error("cache file {} does not exist", path.display())]
    CacheMissing { path: PathBuf },

    #[error("root search for {family:?} order {order} diverged at root {index}: {detail}")]
    RootSearchDivergence {
        family: RootFamily,
        order: i32,
        index: usize,
        detail: String,
    },

    #[error("{coordinate} = {value} is outside [{min}, {max}]")]
    OutOfRangeQuery {
        coordinate: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{what} has size {found}, expected {expected}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{what} index {index} exceeds limit {limit}")]
    LevelIndexOutOfRange {
        what: &'static str,
        index: usize,
        limit: usize,
    },

    #[error("field {field:?} is not tabulated for this geometry")]
    MissingField { field: Field },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Cache problems are handled by rebuilding the table; everything else
    /// propagates to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::CacheMismatch { .. } | Error::CacheCorrupt { .. } | Error::CacheMissing { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
