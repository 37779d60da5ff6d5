// ABOUTME: The long-lived control loop: periodic and on-demand reconciles, status passes, shutdown.
// ABOUTME: Also wires every component from a Config for the daemon.

use crate::cache::ToolSpecCache;
use crate::clock::{SharedClock, SystemClock};
use crate::health::{log_report, HealthChecker, HealthReport, TcpConnectProbe};
use crate::launcher::{ProcessLauncher, SharedLauncher};
use crate::listeners::SystemListenerInspector;
use crate::ports::{BindProbe, PortAllocator};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::restart::RestartPolicy;
use crate::state::{HealthSummary, StateFile};
use crate::status::{StatusChecker, StatusReport};
use crate::store::{self, SharedStore};
use crate::table::{ProcessInfo, ProcessTable};
use coven_tools_core::{Config, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fire-and-forget request for an immediate reconcile.
///
/// Capacity one: triggers that arrive while one is pending coalesce into it.
#[derive(Clone)]
pub struct ReconcileTrigger {
    tx: mpsc::Sender<()>,
}

impl ReconcileTrigger {
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Never blocks. Returns false only if the loop is gone.
    pub fn fire(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => {
                debug!("Reconcile already pending");
                true
            }
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }
}

/// Snapshot answered to `status` requests.
#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub running: Vec<ProcessInfo>,
    pub last_reconcile: Option<ReconcileReport>,
    pub last_status: Option<StatusReport>,
}

/// Requests from the control socket that need the loop's state.
pub enum ControlCommand {
    Status {
        reply: oneshot::Sender<StatusInfo>,
    },
    Health {
        reply: oneshot::Sender<HealthReport>,
    },
}

#[derive(Default)]
struct LastRuns {
    reconcile: Option<ReconcileReport>,
    status: Option<StatusReport>,
}

pub struct Supervisor {
    reconciler: Arc<Reconciler>,
    status: Arc<StatusChecker>,
    health: Arc<HealthChecker>,
    state: Arc<StateFile>,
    reconcile_interval: Duration,
    status_interval: Duration,
    last: Mutex<LastRuns>,
}

impl Supervisor {
    pub fn new(
        reconciler: Arc<Reconciler>,
        status: Arc<StatusChecker>,
        health: Arc<HealthChecker>,
        state: Arc<StateFile>,
        reconcile_interval: Duration,
        status_interval: Duration,
    ) -> Self {
        Self {
            reconciler,
            status,
            health,
            state,
            reconcile_interval,
            status_interval,
            last: Mutex::new(LastRuns::default()),
        }
    }

    /// Build production components from `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = store::from_config(config)?;
        Ok(Self::with_store(config, store, Arc::new(SystemClock)))
    }

    /// Production components around a given store and clock.
    pub fn with_store(config: &Config, store: SharedStore, clock: SharedClock) -> Self {
        let supervisor = &config.supervisor;
        let table = ProcessTable::default();
        let state = Arc::new(StateFile::new(config.state_file()));
        let probe_timeout = Duration::from_secs(supervisor.health_probe_timeout_secs);

        let cache = Arc::new(ToolSpecCache::new(
            store.clone(),
            clock.clone(),
            Duration::from_secs(supervisor.cache_ttl_secs),
        ));
        let allocator = Arc::new(PortAllocator::new(
            &config.ports,
            store,
            clock.clone(),
            Arc::new(BindProbe),
        ));
        let launcher: SharedLauncher = Arc::new(ProcessLauncher::new(
            config.logs_dir(),
            Duration::from_secs(supervisor.log_capture_secs),
            Duration::from_secs(supervisor.stop_timeout_secs),
        ));
        let policy = Arc::new(RestartPolicy::new(
            Duration::from_secs(config.restart.cooldown_secs),
            clock,
        ));

        let reconciler = Arc::new(Reconciler::new(
            cache.clone(),
            allocator.clone(),
            launcher.clone(),
            table.clone(),
            state.clone(),
            supervisor.proxy_binary.clone(),
        ));
        let status = Arc::new(StatusChecker::new(
            cache,
            Arc::new(SystemListenerInspector::new(probe_timeout)),
            launcher,
            table.clone(),
            allocator,
            policy,
            supervisor.proxy_binary.clone(),
            config.restart.predefined_company_id.clone(),
        ));
        let health = Arc::new(HealthChecker::new(
            table,
            Arc::new(TcpConnectProbe),
            supervisor.readiness_marker.clone(),
            probe_timeout,
        ));

        Self::new(
            reconciler,
            status,
            health,
            state,
            config.check_interval(),
            config.status_interval(),
        )
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// One reconcile followed by a health pass. Never fails; a skipped tick
    /// is logged.
    pub async fn tick(&self, force_refresh: bool) -> Option<ReconcileReport> {
        let report = match self.reconciler.reconcile(force_refresh).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Desired state unavailable, skipping tick");
                return None;
            }
        };
        self.lock_last().reconcile = Some(report.clone());

        let health = self.check_health().await;
        log_report(&health);
        let summary = HealthSummary::from(&health);
        if let Err(e) = self.state.update(|s| s.health = Some(summary)).await {
            warn!(error = %e, "Failed to save health summary");
        }
        Some(report)
    }

    pub async fn status_pass(&self) -> Option<StatusReport> {
        match self.status.run_once().await {
            Ok(report) => {
                self.lock_last().status = Some(report.clone());
                Some(report)
            }
            Err(e) => {
                warn!(error = %e, "Desired state unavailable, skipping status check");
                None
            }
        }
    }

    pub async fn check_health(&self) -> HealthReport {
        let desired = self
            .reconciler
            .cache()
            .get_tool_specs(false)
            .await
            .unwrap_or_default();
        self.health.check(&desired).await
    }

    pub async fn status_info(&self) -> StatusInfo {
        let running = self.reconciler.table().snapshot().await;
        let last = self.lock_last();
        StatusInfo {
            running,
            last_reconcile: last.reconcile.clone(),
            last_status: last.status.clone(),
        }
    }

    fn lock_last(&self) -> std::sync::MutexGuard<'_, LastRuns> {
        self.last.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn handle(&self, command: ControlCommand) {
        match command {
            ControlCommand::Status { reply } => {
                let _ = reply.send(self.status_info().await);
            }
            ControlCommand::Health { reply } => {
                let _ = reply.send(self.check_health().await);
            }
        }
    }

    /// Run until `cancel` fires, then stop every owned process.
    ///
    /// The first reconcile happens immediately; status passes start one
    /// interval later.
    pub async fn run(
        &self,
        mut triggers: mpsc::Receiver<()>,
        mut commands: mpsc::Receiver<ControlCommand>,
        cancel: CancellationToken,
    ) {
        let mut reconcile_timer = interval(self.reconcile_interval);
        reconcile_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut status_timer = interval_at(Instant::now() + self.status_interval, self.status_interval);
        status_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            reconcile_every_secs = self.reconcile_interval.as_secs(),
            status_every_secs = self.status_interval.as_secs(),
            "Supervisor loop started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = reconcile_timer.tick() => {
                    self.tick(false).await;
                }
                Some(()) = triggers.recv() => {
                    info!("On-demand reconcile");
                    self.tick(true).await;
                }
                _ = status_timer.tick() => {
                    self.status_pass().await;
                }
                Some(command) = commands.recv() => {
                    self.handle(command).await;
                }
            }
        }

        info!("Supervisor shutting down");
        let stopped = self.reconciler.stop_all().await;
        info!(stopped = stopped.len(), "Stopped tool processes");
    }
}
