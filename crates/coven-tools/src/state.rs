// ABOUTME: The supervisor's observability file, manager_state.json in the runner dir.
// ABOUTME: Last reconcile counts, committed signatures and the last health summary.

use crate::health::{HealthReport, HealthStatus};
use crate::signature::SignatureMap;
use chrono::{DateTime, Utc};
use coven_tools_core::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeCounts {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthSummary {
    pub checked_at: Option<DateTime<Utc>>,
    pub healthy: usize,
    pub total: usize,
    pub unhealthy: Vec<String>,
}

impl From<&HealthReport> for HealthSummary {
    fn from(report: &HealthReport) -> Self {
        Self {
            checked_at: Some(report.checked_at),
            healthy: report.healthy,
            total: report.total,
            unhealthy: report
                .records
                .iter()
                .filter(|r| r.status == HealthStatus::Inactive)
                .map(|r| r.name.clone())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagerState {
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub changes: ChangeCounts,
    #[serde(default)]
    pub total_running: usize,
    #[serde(default)]
    pub signatures: SignatureMap,
    #[serde(default)]
    pub health: Option<HealthSummary>,
}

pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The saved state, or the default if nothing was written yet.
    pub async fn load(&self) -> Result<ManagerState> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ManagerState::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, state: &ManagerState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(state)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "Saved manager state");
        Ok(())
    }

    /// Load, apply `f`, save.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ManagerState),
    {
        // A corrupt file is replaced rather than blocking every later write.
        let mut state = self.load().await.unwrap_or_default();
        f(&mut state);
        self.save(&state).await
    }
}
