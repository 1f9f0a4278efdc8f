//! Document-store seam for CQI: create-only task persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use cqi_core::Task;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cqi-store";

/// Hard per-batch write ceiling of the underlying store. Writers must commit
/// strictly fewer operations per batch.
pub const HARD_BATCH_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store read failed for {id}: {source}")]
    Read {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("store write failed for {id}: {source}")]
    Write {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("codec failure for {id}: {source}")]
    Codec {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("document already exists at {id}")]
    Conflict { id: String },
    #[error("batch of {count} operations exceeds the per-commit limit of {HARD_BATCH_LIMIT}")]
    BatchTooLarge { count: usize },
}

/// Constructor-injected collaborator for the ingestion pipeline.
///
/// `create_tasks` has create-only semantics: committing a batch containing an
/// id that already exists must fail with [`StoreError::Conflict`] and is a
/// dedup-gate invariant violation, never a transient condition. The store
/// stamps `created_at` on every committed task.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError>;
    async fn create_tasks(&self, batch: Vec<(String, Task)>) -> Result<(), StoreError>;
}

/// In-memory store for tests. Records the size of each committed batch so
/// batching behavior can be asserted.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, Task>>,
    batch_sizes: Mutex<Vec<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.docs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.lock().await.is_empty()
    }

    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().await.clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.docs.lock().await.get(id).cloned())
    }

    async fn create_tasks(&self, batch: Vec<(String, Task)>) -> Result<(), StoreError> {
        if batch.len() > HARD_BATCH_LIMIT {
            return Err(StoreError::BatchTooLarge { count: batch.len() });
        }
        let mut docs = self.docs.lock().await;
        for (id, _) in &batch {
            if docs.contains_key(id) {
                return Err(StoreError::Conflict { id: id.clone() });
            }
        }
        let count = batch.len();
        let now = Utc::now();
        for (id, mut task) in batch {
            task.created_at = Some(now);
            docs.insert(id, task);
        }
        self.batch_sizes.lock().await.push(count);
        Ok(())
    }
}

/// File-backed document store: one JSON document per task id under a root
/// directory, written via a temp file and an atomic rename so a half-written
/// document is never observable under its final name.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn doc_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    async fn write_doc(&self, id: &str, task: &Task) -> Result<(), StoreError> {
        let final_path = self.doc_path(id);
        let bytes = serde_json::to_vec_pretty(task).map_err(|source| StoreError::Codec {
            id: id.to_string(),
            source,
        })?;

        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|source| StoreError::Write {
                id: id.to_string(),
                source,
            })?;
        let write_result = async {
            file.write_all(&bytes).await?;
            file.flush().await
        }
        .await;
        drop(file);
        if let Err(source) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Write {
                id: id.to_string(),
                source,
            });
        }

        match fs::rename(&temp_path, &final_path).await {
            Ok(()) => Ok(()),
            Err(source) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StoreError::Write {
                    id: id.to_string(),
                    source,
                })
            }
        }
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let path = self.doc_path(id);
        match fs::read(&path).await {
            Ok(bytes) => {
                let task = serde_json::from_slice(&bytes).map_err(|source| StoreError::Codec {
                    id: id.to_string(),
                    source,
                })?;
                Ok(Some(task))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Read {
                id: id.to_string(),
                source,
            }),
        }
    }

    async fn create_tasks(&self, batch: Vec<(String, Task)>) -> Result<(), StoreError> {
        if batch.len() > HARD_BATCH_LIMIT {
            return Err(StoreError::BatchTooLarge { count: batch.len() });
        }
        if batch.is_empty() {
            return Ok(());
        }

        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StoreError::Write {
                id: self.root.display().to_string(),
                source,
            })?;

        // Create-only: refuse the whole batch before writing anything if any
        // id is already present.
        for (id, _) in &batch {
            if self.get_task(id).await?.is_some() {
                return Err(StoreError::Conflict { id: id.clone() });
            }
        }

        let count = batch.len();
        let now = Utc::now();
        for (id, mut task) in batch {
            task.created_at = Some(now);
            self.write_doc(&id, &task).await?;
        }
        debug!(count, root = %self.root.display(), "committed task batch");
        Ok(())
    }
}
