// ABOUTME: Write-behind persistence interface for execution snapshots
// ABOUTME: Ships an in-memory store and a JSON-file store keyed by run id

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

use super::state::ExecutionSnapshot;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn save(&self, snapshot: &ExecutionSnapshot) -> Result<()>;
    async fn load(&self, run_id: &str) -> Result<Option<ExecutionSnapshot>>;
    async fn list(&self) -> Result<Vec<String>>;
}

#[derive(Default)]
pub struct InMemoryStore {
    snapshots: RwLock<HashMap<String, ExecutionSnapshot>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn save(&self, snapshot: &ExecutionSnapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(snapshot.run_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<ExecutionSnapshot>> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(run_id).cloned())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let snapshots = self.snapshots.read().await;
        let mut ids: Vec<String> = snapshots.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// One pretty-printed `<run_id>.json` file per run inside a directory
pub struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        self.directory.join(format!("{}.json", run_id))
    }
}

#[async_trait]
impl ExecutionStore for FileStore {
    async fn save(&self, snapshot: &ExecutionSnapshot) -> Result<()> {
        fs::create_dir_all(&self.directory).await?;

        let content = serde_json::to_string_pretty(snapshot)?;
        let path = self.path_for(&snapshot.run_id);
        let temp = path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        drop(file);
        fs::rename(&temp, &path).await?;

        debug!("Snapshot written to {} ({} bytes)", path.display(), content.len());
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<ExecutionSnapshot>> {
        match fs::read_to_string(self.path_for(run_id)).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
