//! Local persistence: the offline attendance queue and the credential store.

pub mod credentials;
pub mod offline_queue;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where new offline records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Appended to the on-disk log.
    #[default]
    Durable,
    /// Held in the bounded in-memory ring only.
    Memory,
}

impl FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "durable" => Ok(StorageMode::Durable),
            "memory" => Ok(StorageMode::Memory),
            other => Err(format!(
                "storage mode must be \"durable\" or \"memory\", got \"{other}\""
            )),
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageMode::Durable => f.write_str("durable"),
            StorageMode::Memory => f.write_str("memory"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not encode record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("durable log unavailable")]
    Unavailable,
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}
