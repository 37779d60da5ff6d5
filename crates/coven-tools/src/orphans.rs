// ABOUTME: Degraded-mode recovery after a supervisor crash: find and terminate stray proxies.
// ABOUTME: Only used at start-up when enabled; normal stops go through owned child handles.

use std::ffi::OsString;
use std::ops::RangeInclusive;
use std::path::Path;
use tracing::{info, warn};

/// The `--sse-port` of a leftover proxy process, if `cmd` is one of ours.
pub fn orphan_port(cmd: &[String], proxy_binary: &str, range: &RangeInclusive<u16>) -> Option<u16> {
    let program = cmd.first()?;
    let wanted = Path::new(proxy_binary).file_name()?;
    if Path::new(program).file_name()? != wanted {
        return None;
    }
    cmd.iter()
        .skip(1)
        .take_while(|arg| arg.as_str() != "--")
        .find_map(|arg| arg.strip_prefix("--sse-port=")?.parse::<u16>().ok())
        .filter(|port| range.contains(port))
}

fn lossy(args: &[OsString]) -> Vec<String> {
    args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
}

/// SIGTERM every process that looks like a proxy we launched on a port in
/// `range`. Returns (pid, port) of each process signalled.
pub async fn reap_orphans(proxy_binary: String, range: RangeInclusive<u16>) -> Vec<(u32, u16)> {
    let result = tokio::task::spawn_blocking(move || {
        let mut sys = sysinfo::System::new();
        sys.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::All,
            true,
            sysinfo::ProcessRefreshKind::nothing().with_cmd(sysinfo::UpdateKind::Always),
        );
        let me = sysinfo::get_current_pid().ok();

        let mut reaped = Vec::new();
        for (pid, process) in sys.processes() {
            if Some(*pid) == me {
                continue;
            }
            let Some(port) = orphan_port(&lossy(process.cmd()), &proxy_binary, &range) else {
                continue;
            };
            match process.kill_with(sysinfo::Signal::Term) {
                Some(true) => {
                    info!(pid = pid.as_u32(), port, "Terminated orphaned tool process");
                    reaped.push((pid.as_u32(), port));
                }
                Some(false) => warn!(pid = pid.as_u32(), port, "Failed to signal orphaned tool process"),
                None => warn!("SIGTERM is not supported on this platform"),
            }
        }
        reaped
    })
    .await;

    match result {
        Ok(reaped) => reaped,
        Err(e) => {
            warn!(error = %e, "Orphan scan failed");
            Vec::new()
        }
    }
}
