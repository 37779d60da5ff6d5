// ABOUTME: JSON-file tool store for local runs without a remote database.
// ABOUTME: Same record shape as the REST view; writes replace the file atomically.

use super::ToolStore;
use async_trait::async_trait;
use coven_tools_core::{Result, StatusUpdate, ToolSpec, ToolVersion};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub struct FileToolStore {
    path: PathBuf,
    // Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl FileToolStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Vec<ToolSpec>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Tool file does not exist yet");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, tools: &[ToolSpec]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(tools)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ToolStore for FileToolStore {
    async fn fetch_tools(&self) -> Result<Vec<ToolSpec>> {
        self.read().await
    }

    async fn update_versions(&self, tool_id: &str, versions: &[ToolVersion]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tools = self.read().await?;
        match tools.iter_mut().find(|t| t.tool_id == tool_id) {
            Some(tool) => tool.versions = versions.to_vec(),
            None => {
                warn!(tool_id, "Tool vanished from store before versions write-back");
                return Ok(());
            }
        }
        self.write(&tools).await
    }

    async fn update_statuses(&self, updates: &[StatusUpdate]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tools = self.read().await?;
        for update in updates {
            if let Some(tool) = tools.iter_mut().find(|t| t.tool_id == update.tool_id) {
                tool.on_status = update.on_status.clone();
                if let Some(versions) = &update.versions {
                    tool.versions = versions.clone();
                }
            }
        }
        self.write(&tools).await
    }
}
