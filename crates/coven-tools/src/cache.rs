// ABOUTME: TTL cache in front of the configuration store (desired state).
// ABOUTME: Serves the last good tool list when the store is unreachable.

use crate::clock::{expired, SharedClock};
use crate::store::SharedStore;
use chrono::{DateTime, Duration, Utc};
use coven_tools_core::{Result, ToolSpec, ToolVersion};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct Snapshot {
    fetched_at: DateTime<Utc>,
    tools: Vec<ToolSpec>,
}

pub struct ToolSpecCache {
    store: SharedStore,
    clock: SharedClock,
    ttl: Duration,
    snapshot: Mutex<Option<Snapshot>>,
}

impl ToolSpecCache {
    pub fn new(store: SharedStore, clock: SharedClock, ttl: std::time::Duration) -> Self {
        Self {
            store,
            clock,
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(60)),
            snapshot: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Desired tool state, at most `ttl` old unless the store is down.
    ///
    /// Errors only when the store fails and nothing was ever fetched.
    pub async fn get_tool_specs(&self, force_refresh: bool) -> Result<Vec<ToolSpec>> {
        let mut snapshot = self.snapshot.lock().await;

        if let Some(cached) = snapshot.as_ref() {
            if !force_refresh && !expired(self.clock.as_ref(), cached.fetched_at, self.ttl) {
                debug!(tools = cached.tools.len(), "Using cached tool specs");
                return Ok(cached.tools.clone());
            }
        }

        match self.store.fetch_tools().await {
            Ok(tools) => {
                info!(tools = tools.len(), "Refreshed tool specs from store");
                *snapshot = Some(Snapshot {
                    fetched_at: self.clock.now(),
                    tools: tools.clone(),
                });
                Ok(tools)
            }
            Err(e) => match snapshot.as_ref() {
                Some(cached) => {
                    warn!(
                        error = %e,
                        age_secs = (self.clock.now() - cached.fetched_at).num_seconds(),
                        "Store fetch failed, serving last known tool specs"
                    );
                    Ok(cached.tools.clone())
                }
                None => Err(e),
            },
        }
    }

    /// Write a repaired port back to the store.
    ///
    /// Failure is logged, not returned: the next tick recomputes everything.
    /// On success the cached copy is patched so ticks inside the TTL agree
    /// with the store.
    pub async fn persist_port_reassignment(&self, tool_id: &str, versions: &[ToolVersion]) -> bool {
        if let Err(e) = self.store.update_versions(tool_id, versions).await {
            warn!(tool_id, error = %e, "Failed to persist port reassignment");
            return false;
        }

        let mut snapshot = self.snapshot.lock().await;
        if let Some(cached) = snapshot.as_mut() {
            if let Some(tool) = cached.tools.iter_mut().find(|t| t.tool_id == tool_id) {
                tool.versions = versions.to_vec();
            }
        }
        true
    }

    /// Drop the cached value so the next read goes to the store.
    pub async fn invalidate(&self) {
        *self.snapshot.lock().await = None;
    }
}
