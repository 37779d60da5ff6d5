// ABOUTME: One reconciliation tick: desired state vs. running processes, converged minimally.
// ABOUTME: Diffs per-tool signatures and only stops/starts tools whose effective config changed.

use crate::cache::ToolSpecCache;
use crate::launcher::{start_batch, stop_batch, SharedLauncher};
use crate::ports::{repair_ports, PortAllocator};
use crate::signature::{self, SignatureMap};
use crate::state::{ChangeCounts, StateFile};
use crate::table::ProcessTable;
use crate::translate::{translate, ProcessSpec, TranslateError};
use chrono::{DateTime, Utc};
use coven_tools_core::{Result, StatusUpdate, ToolSpec, ToolStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What one tick did, per tool.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started_at: Option<DateTime<Utc>>,
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    /// Added tools already running with the desired command and port,
    /// typically restarted by the status checker before this tick.
    pub adopted: Vec<String>,
    /// (name, error) for tools whose start failed.
    pub failed: Vec<(String, String)>,
    /// (name, reason) for tools left out of this tick.
    pub skipped: Vec<(String, String)>,
    /// (name, new port) for port repairs.
    pub reassigned: Vec<(String, u16)>,
    pub running: usize,
}

impl ReconcileReport {
    pub fn counts(&self) -> ChangeCounts {
        ChangeCounts {
            added: self.added.len(),
            removed: self.removed.len(),
            modified: self.modified.len(),
            unchanged: self.unchanged.len(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

pub struct Reconciler {
    cache: Arc<ToolSpecCache>,
    allocator: Arc<PortAllocator>,
    launcher: SharedLauncher,
    table: ProcessTable,
    state: Arc<StateFile>,
    proxy_binary: String,
    // Held for a whole tick, which also keeps ticks from overlapping.
    baseline: Mutex<SignatureMap>,
}

impl Reconciler {
    pub fn new(
        cache: Arc<ToolSpecCache>,
        allocator: Arc<PortAllocator>,
        launcher: SharedLauncher,
        table: ProcessTable,
        state: Arc<StateFile>,
        proxy_binary: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            allocator,
            launcher,
            table,
            state,
            proxy_binary: proxy_binary.into(),
            baseline: Mutex::new(SignatureMap::new()),
        }
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn cache(&self) -> &Arc<ToolSpecCache> {
        &self.cache
    }

    /// The signatures committed by the last tick.
    pub async fn baseline(&self) -> SignatureMap {
        self.baseline.lock().await.clone()
    }

    /// Run one tick.
    ///
    /// Errors only when desired state is unavailable and was never fetched;
    /// the tick is then skipped without touching running processes.
    pub async fn reconcile(&self, force_refresh: bool) -> Result<ReconcileReport> {
        let mut baseline = self.baseline.lock().await;
        let mut report = ReconcileReport {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        let tools = self.cache.get_tool_specs(force_refresh).await?;
        let mut active: Vec<ToolSpec> = tools.into_iter().filter(ToolSpec::is_active).collect();

        self.fix_ports(&mut active, &mut report).await;

        let desired = self.translate_all(&active, &mut report);
        let current: SignatureMap = desired
            .iter()
            .map(|(name, spec)| (name.clone(), signature::compute(spec)))
            .collect();
        let diff = signature::diff(&baseline, &current);

        let mut adopted = Vec::new();
        let mut launch_added = Vec::new();
        for name in &diff.added {
            let running = self.table.get(name).await;
            match (desired.get(name), running) {
                (Some(spec), Some(running))
                    if running.command == spec.command && running.port == spec.port =>
                {
                    debug!(tool = %name, port = spec.port, "Adopting already running process");
                    adopted.push(name.clone());
                }
                _ => launch_added.push(name.clone()),
            }
        }

        // Every stop finishes before any start, so a port changing hands
        // is never bound twice. Added tools are included in case a stale
        // instance is still tracked under the name.
        let to_stop: Vec<String> = diff
            .removed
            .iter()
            .chain(diff.modified.iter())
            .chain(launch_added.iter())
            .cloned()
            .collect();
        if !to_stop.is_empty() {
            stop_batch(&self.launcher, &self.table, &to_stop).await;
        }

        let to_start: Vec<ProcessSpec> = diff
            .modified
            .iter()
            .chain(launch_added.iter())
            .filter_map(|name| desired.get(name).cloned())
            .collect();
        let outcome = if to_start.is_empty() {
            Default::default()
        } else {
            start_batch(&self.launcher, &self.table, to_start).await
        };

        // Failed starts stay out of the baseline so the next tick retries them.
        let mut committed = current;
        for (name, _) in &outcome.failed {
            committed.remove(name);
        }
        *baseline = committed;

        report.added = diff.added;
        report.modified = diff.modified;
        report.removed = diff.removed;
        report.unchanged = diff.unchanged;
        report.adopted = adopted;
        report.failed = outcome.failed;
        report.running = self.table.len().await;

        info!(
            added = report.added.len(),
            modified = report.modified.len(),
            removed = report.removed.len(),
            unchanged = report.unchanged.len(),
            adopted = report.adopted.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            running = report.running,
            "Reconcile complete"
        );

        let counts = report.counts();
        let running = report.running;
        let signatures = baseline.clone();
        if let Err(e) = self
            .state
            .update(|s| {
                s.last_update = Some(Utc::now());
                s.changes = counts;
                s.total_running = running;
                s.signatures = signatures;
            })
            .await
        {
            warn!(error = %e, path = %self.state.path().display(), "Failed to save manager state");
        }

        Ok(report)
    }

    /// Resolve duplicate and missing ports, persisting every change in turn.
    async fn fix_ports(&self, active: &mut Vec<ToolSpec>, report: &mut ReconcileReport) {
        let repair = repair_ports(active, &self.allocator).await;

        for moved in &repair.reassigned {
            self.cache
                .persist_port_reassignment(&moved.tool_id, &moved.versions)
                .await;
            report.reassigned.push((moved.name.clone(), moved.new_port));
        }

        if repair.exhausted.is_empty() {
            return;
        }

        let range = self.allocator.range();
        let reason = format!(
            "No free port available in range {}-{}",
            range.start(),
            range.end()
        );
        let updates: Vec<StatusUpdate> = repair
            .exhausted
            .iter()
            .map(|(tool_id, name)| {
                warn!(tool = %name, "{}", reason);
                report.skipped.push((name.clone(), reason.clone()));
                StatusUpdate {
                    tool_id: tool_id.clone(),
                    name: name.clone(),
                    on_status: ToolStatus::Inactive.with_reason(Some(&reason)),
                    versions: None,
                }
            })
            .collect();
        if let Err(e) = self.cache.store().update_statuses(&updates).await {
            warn!(error = %e, "Failed to mark port-exhausted tools inactive");
        }

        // Exhausted tools must not launch on a port someone else kept.
        active.retain(|t| !repair.exhausted.iter().any(|(id, _)| *id == t.tool_id));
    }

    fn translate_all(
        &self,
        active: &[ToolSpec],
        report: &mut ReconcileReport,
    ) -> BTreeMap<String, ProcessSpec> {
        let mut desired = BTreeMap::new();
        for tool in active {
            match translate(tool, &self.proxy_binary) {
                Ok(spec) => {
                    if desired.contains_key(&spec.name) {
                        warn!(tool = %spec.name, tool_id = %tool.tool_id, "Duplicate tool name, skipping");
                        report
                            .skipped
                            .push((spec.name.clone(), "duplicate tool name".to_string()));
                        continue;
                    }
                    debug!(tool = %spec.name, command = %spec.command, "Desired process");
                    desired.insert(spec.name.clone(), spec);
                }
                Err(e) => {
                    // Tools without versions are not deployed yet.
                    if e != TranslateError::NoVersions {
                        warn!(tool = %tool.display_name(), error = %e, "Skipping tool");
                    }
                    report
                        .skipped
                        .push((tool.display_name().to_string(), e.to_string()));
                }
            }
        }
        desired
    }

    /// Stop every owned process. Used at shutdown.
    pub async fn stop_all(&self) -> Vec<String> {
        let mut baseline = self.baseline.lock().await;
        let names: Vec<String> = self
            .table
            .snapshot()
            .await
            .into_iter()
            .map(|p| p.name)
            .collect();
        let stopped = stop_batch(&self.launcher, &self.table, &names).await;
        baseline.clear();
        stopped
    }
}
