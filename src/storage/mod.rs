//! Persistent storage -- measurement history and small JSON documents.
//!
//! Every file is replaced through write-temp, fsync, rename so a reader (or a
//! restarted process) only ever sees a complete old or complete new version.

pub mod columnar;
pub mod export;
pub mod history;
pub mod record;

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

pub use self::export::ExportFormat;
pub use self::history::HistoryStore;
pub use self::record::{HistoryFilter, MeasurementRecord, RecordStatus};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("corrupt history data: {0}")]
    Corrupt(String),

    #[error("unsupported export format '{0}' (expected json, csv or columnar)")]
    UnsupportedFormat(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

impl StorageError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Sibling path used while a new version of `path` is being written.
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub async fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), StorageError> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = temp_path(path);

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| StorageError::io(&tmp, e))?;
    file.write_all(&json)
        .await
        .map_err(|e| StorageError::io(&tmp, e))?;
    file.sync_all().await.map_err(|e| StorageError::io(&tmp, e))?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StorageError::io(path, e))?;

    // Persist the rename itself; not every platform lets us open a directory.
    if let Some(parent) = path.parent() {
        if let Ok(dir) = tokio::fs::File::open(parent).await {
            let _ = dir.sync_all().await;
        }
    }
    Ok(())
}

/// Read `path`, returning `None` if it does not exist.
pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

/// Remove a temp file left behind by an interrupted write.
pub(crate) async fn remove_stale_temp(path: &Path) -> Result<(), StorageError> {
    let tmp = temp_path(path);
    match tokio::fs::remove_file(&tmp).await {
        Ok(()) => {
            tracing::warn!(path = %tmp.display(), "removed stale temp file from interrupted write");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io(&tmp, e)),
    }
}
