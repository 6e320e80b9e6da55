use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::queue::TaskRecord;

/// Persists queued tasks so a restart picks up where the last process left off.
#[async_trait]
pub trait QueueJournal: Send + Sync {
    /// Replace the saved queue with `tasks`.
    async fn save(&self, tasks: &[TaskRecord]) -> Result<(), PipelineError>;

    /// Load the saved queue, oldest first.
    async fn load(&self) -> Result<Vec<TaskRecord>, PipelineError>;
}

// --- NoJournal ---

/// No persistence. Queued work is lost with the process.
pub struct NoJournal;

#[async_trait]
impl QueueJournal for NoJournal {
    async fn save(&self, _: &[TaskRecord]) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn load(&self) -> Result<Vec<TaskRecord>, PipelineError> {
        Ok(Vec::new())
    }
}

// --- FileJournal ---

/// Saves the queue to disk as JSON, writing through a temp file and rename.
pub struct FileJournal {
    path: PathBuf,
}

impl FileJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl QueueJournal for FileJournal {
    async fn save(&self, tasks: &[TaskRecord]) -> Result<(), PipelineError> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| PipelineError::Journal(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(tasks)
            .map_err(|e| PipelineError::Journal(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| PipelineError::Journal(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| PipelineError::Journal(e.to_string()))?;
        Ok(())
    }

    async fn load(&self) -> Result<Vec<TaskRecord>, PipelineError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| PipelineError::Journal(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(PipelineError::Journal(e.to_string())),
        }
    }
}
