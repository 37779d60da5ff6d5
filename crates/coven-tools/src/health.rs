// ABOUTME: Health checks for tracked tools from two independent signals.
// ABOUTME: Readiness marker in the captured log AND a TCP connect to the tool's port.

use crate::table::{ProcessInfo, ProcessTable};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coven_tools_core::{ToolSpec, ToolStatus};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Inactive,
    Offline,
    Predefined,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub name: String,
    pub port: Option<u16>,
    pub log_healthy: bool,
    pub port_healthy: bool,
    pub status: HealthStatus,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub healthy: usize,
    pub total: usize,
    pub records: Vec<HealthRecord>,
}

impl HealthReport {
    pub fn unhealthy(&self) -> impl Iterator<Item = &HealthRecord> {
        self.records
            .iter()
            .filter(|r| r.status == HealthStatus::Inactive)
    }
}

/// Can something accept a TCP connection on this local port?
#[async_trait]
pub trait ConnectProbe: Send + Sync {
    async fn can_connect(&self, port: u16, timeout: Duration) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnectProbe;

#[async_trait]
impl ConnectProbe for TcpConnectProbe {
    async fn can_connect(&self, port: u16, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await,
            Ok(Ok(_))
        )
    }
}

/// Whether the log at `path` contains `marker`. A missing log counts as no.
pub async fn log_has_marker(path: Option<&Path>, marker: &str) -> bool {
    let Some(path) = path else {
        return false;
    };
    match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).contains(marker),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Log not readable");
            false
        }
    }
}

/// Composite status and reason from the two raw signals.
pub fn classify(port: u16, log_healthy: bool, port_healthy: bool) -> (HealthStatus, String) {
    let mut reasons = Vec::new();
    if !log_healthy {
        reasons.push("readiness marker not found in log".to_string());
    }
    if !port_healthy {
        reasons.push(format!("port {} not accepting connections", port));
    }
    if reasons.is_empty() {
        (HealthStatus::Healthy, String::new())
    } else {
        (HealthStatus::Inactive, reasons.join("; "))
    }
}

pub struct HealthChecker {
    table: ProcessTable,
    probe: Arc<dyn ConnectProbe>,
    marker: String,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        table: ProcessTable,
        probe: Arc<dyn ConnectProbe>,
        marker: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            table,
            probe,
            marker: marker.into(),
            timeout,
        }
    }

    async fn check_one(&self, process: ProcessInfo) -> HealthRecord {
        let (log_healthy, port_healthy) = tokio::join!(
            log_has_marker(process.log_path.as_deref(), &self.marker),
            self.probe.can_connect(process.port, self.timeout),
        );
        let (status, reason) = classify(process.port, log_healthy, port_healthy);
        HealthRecord {
            name: process.name,
            port: Some(process.port),
            log_healthy,
            port_healthy,
            status,
            reason,
        }
    }

    /// Check every tracked process concurrently, after reaping exited ones.
    ///
    /// Tools in `desired` that are administratively Offline or Predefined
    /// are listed with that status and are not probed.
    pub async fn check(&self, desired: &[ToolSpec]) -> HealthReport {
        for gone in self.table.reap_exited().await {
            warn!(tool = %gone.name, port = gone.port, "Reaped exited tool process");
        }

        // The table lock is not held while probing.
        let tracked = self.table.snapshot().await;
        let mut records: Vec<HealthRecord> =
            join_all(tracked.into_iter().map(|p| self.check_one(p))).await;

        for tool in desired {
            let status = match tool.status() {
                ToolStatus::Offline => HealthStatus::Offline,
                ToolStatus::Predefined => HealthStatus::Predefined,
                _ => continue,
            };
            if records.iter().any(|r| r.name == tool.display_name()) {
                continue;
            }
            records.push(HealthRecord {
                name: tool.display_name().to_string(),
                port: tool.declared_port(),
                log_healthy: false,
                port_healthy: false,
                status,
                reason: "not managed".to_string(),
            });
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));

        let healthy = records
            .iter()
            .filter(|r| r.status == HealthStatus::Healthy)
            .count();
        let total = records
            .iter()
            .filter(|r| matches!(r.status, HealthStatus::Healthy | HealthStatus::Inactive))
            .count();

        HealthReport {
            checked_at: Utc::now(),
            healthy,
            total,
            records,
        }
    }
}

/// Log a report: one summary line, then one line per unhealthy tool.
pub fn log_report(report: &HealthReport) {
    info!(
        healthy = report.healthy,
        total = report.total,
        "Health check: {}/{} tools healthy",
        report.healthy,
        report.total
    );
    for record in report.unhealthy() {
        warn!(
            tool = %record.name,
            port = ?record.port,
            log_healthy = record.log_healthy,
            port_healthy = record.port_healthy,
            reason = %record.reason,
            "Tool unhealthy"
        );
    }
}
