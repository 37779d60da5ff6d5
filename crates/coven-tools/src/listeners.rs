// ABOUTME: OS-level view of listening TCP sockets and the command lines that own them.
// ABOUTME: Linux reads /proc/net/tcp{,6} and /proc/<pid>/fd; elsewhere a connect probe.

use crate::health::{ConnectProbe, TcpConnectProbe};
use crate::translate::collapse_whitespace;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Who is listening on a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub port: u16,
    pub pid: Option<u32>,
    /// Whitespace-collapsed command line, when the owner is visible to us.
    pub cmdline: Option<String>,
}

#[async_trait]
pub trait ListenerInspector: Send + Sync {
    /// Listeners among `ports`; ports nobody listens on are absent.
    async fn inspect(&self, ports: &[u16]) -> HashMap<u16, Listener>;
}

/// TCP socket state code for LISTEN in /proc/net/tcp.
const TCP_LISTEN: &str = "0A";

/// (port, socket inode) of every LISTEN row in a /proc/net/tcp{,6} table.
pub fn parse_proc_net_tcp(content: &str) -> Vec<(u16, u64)> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let port_hex = fields[1].rsplit(':').next()?;
            let port = u16::from_str_radix(port_hex, 16).ok()?;
            let inode = fields[9].parse::<u64>().ok()?;
            Some((port, inode))
        })
        .collect()
}

/// Inode from a `socket:[12345]` fd link target.
fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

pub struct SystemListenerInspector {
    probe_timeout: Duration,
}

impl SystemListenerInspector {
    pub fn new(probe_timeout: Duration) -> Self {
        Self { probe_timeout }
    }
}

#[async_trait]
impl ListenerInspector for SystemListenerInspector {
    async fn inspect(&self, ports: &[u16]) -> HashMap<u16, Listener> {
        if cfg!(target_os = "linux") {
            let wanted = ports.to_vec();
            match tokio::task::spawn_blocking(move || proc_listeners(&wanted)).await {
                Ok(found) => return found,
                Err(e) => warn!(error = %e, "Listener scan task failed, falling back to probes"),
            }
        }

        let mut found = HashMap::new();
        for &port in ports {
            if TcpConnectProbe.can_connect(port, self.probe_timeout).await {
                found.insert(
                    port,
                    Listener {
                        port,
                        pid: None,
                        cmdline: None,
                    },
                );
            }
        }
        found
    }
}

fn proc_listeners(ports: &[u16]) -> HashMap<u16, Listener> {
    let mut by_inode: HashMap<u64, u16> = HashMap::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        match std::fs::read_to_string(table) {
            Ok(content) => {
                for (port, inode) in parse_proc_net_tcp(&content) {
                    if ports.contains(&port) {
                        by_inode.insert(inode, port);
                    }
                }
            }
            Err(e) => debug!(table, error = %e, "Cannot read socket table"),
        }
    }

    let mut found: HashMap<u16, Listener> = by_inode
        .values()
        .map(|&port| {
            (
                port,
                Listener {
                    port,
                    pid: None,
                    cmdline: None,
                },
            )
        })
        .collect();
    if by_inode.is_empty() {
        return found;
    }

    let owners = socket_owners(&by_inode);
    if owners.is_empty() {
        return found;
    }

    let pids: Vec<sysinfo::Pid> = owners.values().map(|p| sysinfo::Pid::from_u32(*p)).collect();
    let mut sys = sysinfo::System::new();
    sys.refresh_processes_specifics(
        sysinfo::ProcessesToUpdate::Some(&pids),
        false,
        sysinfo::ProcessRefreshKind::nothing().with_cmd(sysinfo::UpdateKind::Always),
    );

    for (port, pid) in owners {
        let cmdline = sys.process(sysinfo::Pid::from_u32(pid)).and_then(|p| {
            let joined = p
                .cmd()
                .iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");
            let collapsed = collapse_whitespace(&joined);
            (!collapsed.is_empty()).then_some(collapsed)
        });
        if let Some(listener) = found.get_mut(&port) {
            listener.pid = Some(pid);
            listener.cmdline = cmdline;
        }
    }
    found
}

/// Map port to owning pid by walking /proc/<pid>/fd. Processes we may not
/// inspect are skipped.
fn socket_owners(by_inode: &HashMap<u64, u16>) -> HashMap<u16, u32> {
    let mut owners = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return owners;
    };

    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(target) = std::fs::read_link(fd.path()) else {
                continue;
            };
            if let Some(port) = target
                .to_str()
                .and_then(socket_inode)
                .and_then(|inode| by_inode.get(&inode))
            {
                owners.entry(*port).or_insert(pid);
            }
        }
        if owners.len() == by_inode.len() {
            break;
        }
    }
    owners
}
