// ABOUTME: Status checker: matches OS listening sockets against each tool's expected command.
// ABOUTME: Writes composite statuses back to the store and restarts missing tools under cooldown.

use crate::cache::ToolSpecCache;
use crate::launcher::{start_batch, stop_batch, SharedLauncher};
use crate::listeners::{Listener, ListenerInspector};
use crate::ports::PortAllocator;
use crate::restart::RestartPolicy;
use crate::table::ProcessTable;
use crate::translate::{collapse_whitespace, translate, ProcessSpec};
use chrono::{DateTime, Utc};
use coven_tools_core::{Result, StatusUpdate, ToolSpec, ToolStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StatusReport {
    pub checked_at: Option<DateTime<Utc>>,
    /// (tool name, status text) for every tool in the store.
    pub statuses: Vec<(String, String)>,
    pub restarted: Vec<String>,
    pub restart_failed: Vec<(String, String)>,
    /// Restart candidates held back by the cooldown.
    pub suppressed: Vec<String>,
    /// Ports cleared from Offline tools.
    pub released_ports: Vec<(String, u16)>,
}

/// What the socket table says about one expected tool.
enum Verdict {
    Online,
    Missing(u16),
    Foreign(String),
    Unknown,
}

pub struct StatusChecker {
    cache: Arc<ToolSpecCache>,
    inspector: Arc<dyn ListenerInspector>,
    launcher: SharedLauncher,
    table: ProcessTable,
    allocator: Arc<PortAllocator>,
    policy: Arc<RestartPolicy>,
    proxy_binary: String,
    predefined_company_id: Option<String>,
}

impl StatusChecker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<ToolSpecCache>,
        inspector: Arc<dyn ListenerInspector>,
        launcher: SharedLauncher,
        table: ProcessTable,
        allocator: Arc<PortAllocator>,
        policy: Arc<RestartPolicy>,
        proxy_binary: impl Into<String>,
        predefined_company_id: Option<String>,
    ) -> Self {
        Self {
            cache,
            inspector,
            launcher,
            table,
            allocator,
            policy,
            proxy_binary: proxy_binary.into(),
            predefined_company_id,
        }
    }

    fn is_predefined(&self, tool: &ToolSpec) -> bool {
        match (&self.predefined_company_id, &tool.company_id) {
            (Some(wanted), Some(company)) => wanted == company && tool.has_env_vars(),
            _ => false,
        }
    }

    async fn verdict(
        &self,
        tool: &ToolSpec,
        spec: &ProcessSpec,
        listeners: &HashMap<u16, Listener>,
    ) -> Verdict {
        let Some(listener) = listeners.get(&spec.port) else {
            return Verdict::Missing(spec.port);
        };
        let expected = tool
            .latest_released()
            .map(|r| collapse_whitespace(&r.args))
            .unwrap_or_default();

        match &listener.cmdline {
            Some(cmdline) if cmdline.contains(&expected) => Verdict::Online,
            Some(cmdline) => Verdict::Foreign(cmdline.clone()),
            None => {
                // Without a visible command line, trust our own tracked child.
                let ours = self
                    .table
                    .snapshot()
                    .await
                    .into_iter()
                    .any(|p| p.name == spec.name && p.port == spec.port);
                if ours {
                    Verdict::Online
                } else {
                    Verdict::Unknown
                }
            }
        }
    }

    /// One full status pass.
    ///
    /// Errors only if desired state could not be read at all.
    pub async fn run_once(&self) -> Result<StatusReport> {
        let mut tools = self.cache.get_tool_specs(false).await?;

        let ports: Vec<u16> = tools.iter().filter_map(ToolSpec::declared_port).collect();
        let listeners = self.inspector.inspect(&ports).await;
        debug!(tools = tools.len(), listening = listeners.len(), "Checking tool statuses");

        let mut report = StatusReport {
            checked_at: Some(Utc::now()),
            ..Default::default()
        };
        let mut updates = Vec::with_capacity(tools.len());
        let mut candidates = Vec::new();

        for tool in tools.iter_mut() {
            let name = tool.display_name().to_string();
            let mut versions = None;

            let on_status = if tool.status() == ToolStatus::Offline {
                let latest = tool.declared_port();
                if clear_ports(tool) {
                    if let Some(port) = latest {
                        self.allocator.release(port).await;
                        report.released_ports.push((name.clone(), port));
                    }
                    versions = Some(tool.versions.clone());
                }
                ToolStatus::Offline.with_reason(None)
            } else if self.is_predefined(tool) {
                ToolStatus::Predefined.with_reason(None)
            } else {
                match translate(tool, &self.proxy_binary) {
                    Err(e) => {
                        debug!(tool = %name, error = %e, "No launchable config");
                        ToolStatus::Inactive.with_reason(None)
                    }
                    Ok(spec) => match self.verdict(tool, &spec, &listeners).await {
                        Verdict::Online => ToolStatus::Online.with_reason(None),
                        Verdict::Missing(port) => {
                            candidates.push(spec);
                            ToolStatus::Inactive.with_reason(Some(&format!(
                                "Port {} not found in running processes",
                                port
                            )))
                        }
                        Verdict::Foreign(cmdline) => ToolStatus::Inactive
                            .with_reason(Some(&format!("Port is used by: {}", cmdline))),
                        Verdict::Unknown => ToolStatus::Inactive.with_reason(Some(
                            "Port is used by an unknown or inaccessible process",
                        )),
                    },
                }
            };

            report.statuses.push((name.clone(), on_status.clone()));
            updates.push(StatusUpdate {
                tool_id: tool.tool_id.clone(),
                name,
                on_status,
                versions,
            });
        }

        self.restart(candidates, &mut report).await;

        if let Err(e) = self.cache.store().update_statuses(&updates).await {
            warn!(error = %e, "Failed to write tool statuses");
        }

        let online = report
            .statuses
            .iter()
            .filter(|(_, s)| ToolStatus::classify(s) == ToolStatus::Online)
            .count();
        info!(
            online,
            total = report.statuses.len(),
            restarted = report.restarted.len(),
            suppressed = report.suppressed.len(),
            "Status check complete"
        );
        Ok(report)
    }

    async fn restart(&self, candidates: Vec<ProcessSpec>, report: &mut StatusReport) {
        let mut allowed = Vec::new();
        for spec in candidates {
            if self.policy.try_acquire(&spec.name) {
                info!(tool = %spec.name, port = spec.port, "Restarting tool");
                allowed.push(spec);
            } else {
                report.suppressed.push(spec.name);
            }
        }
        if allowed.is_empty() {
            return;
        }

        // Anything still tracked under these names is not serving; drop it first.
        let names: Vec<String> = allowed.iter().map(|s| s.name.clone()).collect();
        stop_batch(&self.launcher, &self.table, &names).await;

        let outcome = start_batch(&self.launcher, &self.table, allowed).await;
        report.restarted = outcome.started;
        report.restart_failed = outcome.failed;
    }
}

/// Clear the declared port of every released version. True if any was set.
fn clear_ports(tool: &mut ToolSpec) -> bool {
    let mut cleared = false;
    for released in tool.versions.iter_mut().filter_map(|v| v.released.as_mut()) {
        if !released.port.is_empty() {
            released.port.clear();
            cleared = true;
        }
    }
    cleared
}
