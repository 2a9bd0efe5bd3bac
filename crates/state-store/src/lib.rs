//! Durable batch/execution records. The scheduler evicts finished entries
//! from its live registry after a linger delay; status queries for anything
//! older are answered from here.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::to_writer_pretty;
use thiserror::Error;

use autoflow_core_types::{BatchId, BatchStatus, ExecutionId, ExecutionStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o: {0}")]
    Io(#[from] io::Error),
    #[error("store serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Where a batch's workflows came from.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum BatchSource {
    Folder { path: PathBuf },
    Files { paths: Vec<PathBuf> },
    Inline { count: usize },
}

/// Durable summary of one execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub batch_id: Option<BatchId>,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub worker_id: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct BatchProgress {
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
    pub running: usize,
    pub queued: usize,
}

/// Durable summary of one batch submission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: BatchId,
    pub source: BatchSource,
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub progress: BatchProgress,
    pub workers: usize,
    pub priority: i32,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output_path: Option<PathBuf>,
    pub executions: Vec<ExecutionId>,
}

/// Persistence contract consumed by the scheduler. Implementations must
/// survive process restarts and live-registry eviction.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn save_batch(&self, record: &BatchRecord) -> Result<(), StoreError>;
    async fn save_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError>;
    async fn update_batch_progress(
        &self,
        id: &BatchId,
        progress: BatchProgress,
        status: BatchStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
    async fn get_batch(&self, id: &BatchId) -> Result<Option<BatchRecord>, StoreError>;
    async fn get_execution(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>, StoreError>;
    async fn get_batch_executions(&self, id: &BatchId) -> Result<Vec<ExecutionRecord>, StoreError>;
}

/// DashMap-backed store for tests and embedded use.
#[derive(Default)]
pub struct MemoryStore {
    batches: DashMap<BatchId, BatchRecord>,
    executions: DashMap<ExecutionId, ExecutionRecord>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn save_batch(&self, record: &BatchRecord) -> Result<(), StoreError> {
        self.batches.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn save_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        self.executions.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_batch_progress(
        &self,
        id: &BatchId,
        progress: BatchProgress,
        status: BatchStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        if let Some(mut record) = self.batches.get_mut(id) {
            record.progress = progress;
            record.status = status;
            if finished_at.is_some() {
                record.finished_at = finished_at;
            }
        }
        Ok(())
    }

    async fn get_batch(&self, id: &BatchId) -> Result<Option<BatchRecord>, StoreError> {
        Ok(self.batches.get(id).map(|entry| entry.clone()))
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self.executions.get(id).map(|entry| entry.clone()))
    }

    async fn get_batch_executions(&self, id: &BatchId) -> Result<Vec<ExecutionRecord>, StoreError> {
        let ids = match self.batches.get(id) {
            Some(batch) => batch.executions.clone(),
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .iter()
            .filter_map(|exec_id| self.executions.get(exec_id).map(|entry| entry.clone()))
            .collect())
    }
}

/// One pretty-printed JSON file per record under `batches/` and
/// `executions/`.
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Arc<Self>, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join("batches"))?;
        fs::create_dir_all(root.join("executions"))?;
        Ok(Arc::new(Self { root }))
    }

    fn batch_path(&self, id: &BatchId) -> PathBuf {
        self.root.join("batches").join(format!("{id}.json"))
    }

    fn execution_path(&self, id: &ExecutionId) -> PathBuf {
        self.root.join("executions").join(format!("{id}.json"))
    }

    fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
        Ok(())
    }

    fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, StoreError> {
        match fs::read_to_string(path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ExecutionStore for JsonFileStore {
    async fn save_batch(&self, record: &BatchRecord) -> Result<(), StoreError> {
        Self::write_json(&self.batch_path(&record.id), record)
    }

    async fn save_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        Self::write_json(&self.execution_path(&record.id), record)
    }

    async fn update_batch_progress(
        &self,
        id: &BatchId,
        progress: BatchProgress,
        status: BatchStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let path = self.batch_path(id);
        if let Some(mut record) = Self::read_json::<BatchRecord>(&path)? {
            record.progress = progress;
            record.status = status;
            if finished_at.is_some() {
                record.finished_at = finished_at;
            }
            Self::write_json(&path, &record)?;
        }
        Ok(())
    }

    async fn get_batch(&self, id: &BatchId) -> Result<Option<BatchRecord>, StoreError> {
        Self::read_json(&self.batch_path(id))
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>, StoreError> {
        Self::read_json(&self.execution_path(id))
    }

    async fn get_batch_executions(&self, id: &BatchId) -> Result<Vec<ExecutionRecord>, StoreError> {
        let batch: Option<BatchRecord> = Self::read_json(&self.batch_path(id))?;
        let mut records = Vec::new();
        if let Some(batch) = batch {
            for exec_id in &batch.executions {
                if let Some(record) = Self::read_json(&self.execution_path(exec_id))? {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch(id: BatchId, executions: Vec<ExecutionId>) -> BatchRecord {
        BatchRecord {
            id,
            source: BatchSource::Inline { count: executions.len() },
            total: executions.len(),
            valid: executions.len(),
            invalid: 0,
            progress: BatchProgress::default(),
            workers: 2,
            priority: 0,
            status: BatchStatus::Running,
            created_at: Utc::now(),
            finished_at: None,
            output_path: None,
            executions,
        }
    }

    fn sample_execution(id: ExecutionId, batch: &BatchId) -> ExecutionRecord {
        ExecutionRecord {
            id,
            batch_id: Some(batch.clone()),
            workflow_id: "wf".into(),
            workflow_name: "sample".into(),
            status: ExecutionStatus::Queued,
            worker_id: None,
            started_at: None,
            finished_at: None,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::new();
        let batch_id = BatchId::new();
        let exec_id = ExecutionId::new();
        store
            .save_batch(&sample_batch(batch_id.clone(), vec![exec_id.clone()]))
            .await
            .unwrap();
        store
            .save_execution(&sample_execution(exec_id.clone(), &batch_id))
            .await
            .unwrap();

        let progress = BatchProgress {
            completed: 1,
            ..BatchProgress::default()
        };
        store
            .update_batch_progress(&batch_id, progress, BatchStatus::Completed, Some(Utc::now()))
            .await
            .unwrap();

        let batch = store.get_batch(&batch_id).await.unwrap().unwrap();
        assert_eq!(batch.progress.completed, 1);
        assert_eq!(batch.status, BatchStatus::Completed);
        assert!(batch.finished_at.is_some());

        let members = store.get_batch_executions(&batch_id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, exec_id);
    }

    #[tokio::test]
    async fn json_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let batch_id = BatchId::new();
        let exec_id = ExecutionId::new();
        {
            let store = JsonFileStore::new(dir.path()).unwrap();
            store
                .save_batch(&sample_batch(batch_id.clone(), vec![exec_id.clone()]))
                .await
                .unwrap();
            store
                .save_execution(&sample_execution(exec_id.clone(), &batch_id))
                .await
                .unwrap();
        }
        let reopened = JsonFileStore::new(dir.path()).unwrap();
        let batch = reopened.get_batch(&batch_id).await.unwrap().unwrap();
        assert_eq!(batch.executions, vec![exec_id.clone()]);
        assert!(reopened.get_execution(&exec_id).await.unwrap().is_some());
        assert!(reopened
            .get_execution(&ExecutionId::new())
            .await
            .unwrap()
            .is_none());
    }
}
