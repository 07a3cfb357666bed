//! Measurement history kept in two synchronized files.
//!
//! `speedtest_history.json` is the ground truth. `speedtest_history.columns.json`
//! is a columnar cache regenerated from it after every write. Both carry a
//! generation counter; when they disagree the cache is stale and is rebuilt
//! on the next read or write.
//!
//! All mutations go through one `RwLock` held for a single append or clear.
//! Readers take the shared side, so they never see a write half-applied.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::columnar::ColumnarHistory;
use super::export::{self, ExportFormat};
use super::record::{HistoryFilter, MeasurementRecord};
use super::{read_optional, remove_stale_temp, write_json_atomic, StorageError};

pub const GROUND_TRUTH_FILE: &str = "speedtest_history.json";
pub const COLUMNAR_FILE: &str = "speedtest_history.columns.json";

/// On-disk layout of the ground-truth file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryDocument {
    pub generation: u64,
    pub records: Vec<MeasurementRecord>,
}

/// Which persisted representation a read is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Representation {
    GroundTruth,
    Columnar,
}

#[derive(Debug)]
struct Inner {
    ground_truth: PathBuf,
    columnar: PathBuf,
    lock: RwLock<()>,
}

/// Handle to the history files. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    inner: Arc<Inner>,
}

impl HistoryStore {
    /// Open (or create) the history files under `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| StorageError::io(data_dir, e))?;

        let store = Self {
            inner: Arc::new(Inner {
                ground_truth: data_dir.join(GROUND_TRUTH_FILE),
                columnar: data_dir.join(COLUMNAR_FILE),
                lock: RwLock::new(()),
            }),
        };

        {
            let _guard = store.inner.lock.write().await;
            remove_stale_temp(&store.inner.ground_truth).await?;
            remove_stale_temp(&store.inner.columnar).await?;
            if read_optional(&store.inner.ground_truth).await?.is_none() {
                info!(path = %store.inner.ground_truth.display(), "creating empty history");
                write_json_atomic(&store.inner.ground_truth, &HistoryDocument::default()).await?;
            }
        }

        store.reconcile().await?;
        Ok(store)
    }

    pub fn ground_truth_path(&self) -> &Path {
        &self.inner.ground_truth
    }

    pub fn columnar_path(&self) -> &Path {
        &self.inner.columnar
    }

    /// Append one record to both representations.
    ///
    /// Returns the record as stored: a timestamp earlier than the last stored
    /// one is raised to it so the log stays non-decreasing.
    pub async fn append(
        &self,
        mut record: MeasurementRecord,
    ) -> Result<MeasurementRecord, StorageError> {
        if !record.is_consistent() {
            return Err(StorageError::InvalidRecord(
                "error must be present exactly when status is failed, and metrics must be finite"
                    .to_string(),
            ));
        }

        let _guard = self.inner.lock.write().await;
        let mut doc = self.read_ground_truth().await?;
        if let Some(last) = doc.records.last() {
            if record.timestamp < last.timestamp {
                debug!(
                    given = %record.timestamp,
                    last = %last.timestamp,
                    "clamping out-of-order timestamp"
                );
                record.timestamp = last.timestamp;
            }
        }
        doc.records.push(record.clone());
        doc.generation += 1;

        self.commit_ground_truth(&doc).await?;
        self.refresh_columnar_logged(&doc).await;

        debug!(
            provider = %record.provider,
            status = ?record.status,
            generation = doc.generation,
            "appended measurement"
        );
        Ok(record)
    }

    /// Records matching `filter`, in append order, from the ground truth.
    pub async fn list(&self, filter: &HistoryFilter) -> Result<Vec<MeasurementRecord>, StorageError> {
        let (doc, fresh) = {
            let _guard = self.inner.lock.read().await;
            let doc = self.read_ground_truth().await?;
            let fresh = self.columnar_generation().await == Some(doc.generation);
            (doc, fresh)
        };

        if !fresh {
            if let Err(e) = self.reconcile().await {
                warn!(error = %e, "failed to reconcile columnar history");
            }
        }
        Ok(filter.apply(&doc.records))
    }

    /// Records matching `filter`, read back from the columnar representation.
    pub async fn list_columnar(
        &self,
        filter: &HistoryFilter,
    ) -> Result<Vec<MeasurementRecord>, StorageError> {
        let (_, records) = self.read_columnar_reconciled().await?;
        Ok(filter.apply(&records))
    }

    /// Read from a specific representation.
    pub async fn list_from(
        &self,
        source: Representation,
        filter: &HistoryFilter,
    ) -> Result<Vec<MeasurementRecord>, StorageError> {
        match source {
            Representation::GroundTruth => self.list(filter).await,
            Representation::Columnar => self.list_columnar(filter).await,
        }
    }

    /// The most recently appended record, if any.
    pub async fn latest(&self) -> Result<Option<MeasurementRecord>, StorageError> {
        let _guard = self.inner.lock.read().await;
        let doc = self.read_ground_truth().await?;
        Ok(doc.records.last().cloned())
    }

    pub async fn len(&self) -> Result<usize, StorageError> {
        let _guard = self.inner.lock.read().await;
        Ok(self.read_ground_truth().await?.records.len())
    }

    pub async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len().await? == 0)
    }

    /// Remove every record from both representations.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.inner.lock.write().await;

        // A corrupt ground truth must still be clearable; pick a generation
        // the cache cannot already carry.
        let current = match self.read_ground_truth().await {
            Ok(doc) => doc.generation,
            Err(StorageError::Corrupt(reason)) => {
                warn!(%reason, "clearing corrupt history");
                0
            }
            Err(e) => return Err(e),
        };
        let cached = self.columnar_generation().await.unwrap_or(0);
        let doc = HistoryDocument {
            generation: current.max(cached) + 1,
            records: Vec::new(),
        };

        self.commit_ground_truth(&doc).await?;
        self.refresh_columnar_logged(&doc).await;
        info!(generation = doc.generation, "history cleared");
        Ok(())
    }

    /// Render the filtered history. JSON and CSV come from the ground truth,
    /// the columnar export from the derived cache.
    pub async fn export(
        &self,
        format: ExportFormat,
        filter: &HistoryFilter,
    ) -> Result<Vec<u8>, StorageError> {
        match format {
            ExportFormat::Json | ExportFormat::Csv => {
                let records = self.list(filter).await?;
                export::render(format, 0, &records)
            }
            ExportFormat::Columnar => {
                let (generation, records) = self.read_columnar_reconciled().await?;
                export::render(format, generation, &filter.apply(&records))
            }
        }
    }

    /// Rebuild the columnar cache if it does not match the ground truth.
    /// Returns whether a rebuild happened.
    pub async fn reconcile(&self) -> Result<bool, StorageError> {
        {
            let _guard = self.inner.lock.read().await;
            let generation = self.read_ground_truth().await?.generation;
            if self.columnar_generation().await == Some(generation) {
                return Ok(false);
            }
        }

        let _guard = self.inner.lock.write().await;
        let doc = self.read_ground_truth().await?;
        if self.columnar_generation().await == Some(doc.generation) {
            return Ok(false);
        }
        info!(
            generation = doc.generation,
            rows = doc.records.len(),
            "rebuilding stale columnar history"
        );
        self.write_columnar(&doc).await?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // File access. Callers hold the lock.
    // -----------------------------------------------------------------------

    async fn read_ground_truth(&self) -> Result<HistoryDocument, StorageError> {
        let path = &self.inner.ground_truth;
        match read_optional(path).await? {
            None => Ok(HistoryDocument::default()),
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StorageError::Corrupt(format!("{}: {}", path.display(), e))
            }),
        }
    }

    async fn commit_ground_truth(&self, doc: &HistoryDocument) -> Result<(), StorageError> {
        write_json_atomic(&self.inner.ground_truth, doc).await
    }

    async fn write_columnar(&self, doc: &HistoryDocument) -> Result<(), StorageError> {
        let columnar = ColumnarHistory::from_records(doc.generation, &doc.records);
        write_json_atomic(&self.inner.columnar, &columnar).await
    }

    async fn refresh_columnar_logged(&self, doc: &HistoryDocument) {
        if let Err(e) = self.write_columnar(doc).await {
            warn!(
                error = %e,
                generation = doc.generation,
                "columnar history update failed; will reconcile on next access"
            );
        }
    }

    /// The cache document, or `None` when missing or unreadable.
    async fn read_columnar(&self) -> Option<ColumnarHistory> {
        let path = &self.inner.columnar;
        match read_optional(path).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable columnar history");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "failed to read columnar history");
                None
            }
        }
    }

    async fn columnar_generation(&self) -> Option<u64> {
        self.read_columnar().await.map(|c| c.generation)
    }

    async fn read_columnar_reconciled(
        &self,
    ) -> Result<(u64, Vec<MeasurementRecord>), StorageError> {
        for _ in 0..2 {
            {
                let _guard = self.inner.lock.read().await;
                let generation = self.read_ground_truth().await?.generation;
                if let Some(columnar) = self.read_columnar().await {
                    if columnar.generation == generation {
                        return Ok((generation, columnar.into_records()?));
                    }
                }
            }
            self.reconcile().await?;
        }
        Err(StorageError::Corrupt(
            "columnar history could not be brought up to date".to_string(),
        ))
    }
}
