// ABOUTME: coven-tools library: supervisor for store-configured MCP proxy processes.
// ABOUTME: Reconciles desired tool state into running processes and keeps them healthy.

pub mod cache;
pub mod clock;
pub mod health;
pub mod launcher;
pub mod listeners;
pub mod logging;
pub mod orphans;
pub mod ports;
pub mod reconcile;
pub mod restart;
pub mod signature;
#[cfg(unix)]
pub mod socket;
pub mod state;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod table;
pub mod translate;

pub use cache::ToolSpecCache;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use coven_tools_core::{Config, Error, Result, ToolSpec, ToolStatus};
pub use health::{HealthChecker, HealthRecord, HealthReport, HealthStatus};
pub use launcher::{LaunchError, Launcher, ProcessLauncher, RunningProcess, SharedLauncher};
pub use ports::{PortAllocator, PortProbe};
pub use reconcile::{ReconcileReport, Reconciler};
pub use restart::RestartPolicy;
pub use status::{StatusChecker, StatusReport};
pub use store::{SharedStore, ToolStore};
pub use supervisor::{ControlCommand, ReconcileTrigger, Supervisor};
pub use table::ProcessTable;
pub use translate::{translate, ProcessSpec, TranslateError};
