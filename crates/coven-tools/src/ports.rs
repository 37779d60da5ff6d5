// ABOUTME: TCP port allocation inside a configured range, plus duplicate-port repair.
// ABOUTME: Skips ports claimed by any stored tool, samples candidates, bind-probes them.

use crate::clock::{expired, SharedClock};
use crate::store::SharedStore;
use chrono::{DateTime, Duration, Utc};
use coven_tools_core::{PortsConfig, ToolSpec, ToolVersion};
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, BTreeSet};
use std::net::TcpListener;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Checks whether a port can be bound right now. Blocking.
pub trait PortProbe: Send + Sync {
    fn is_free(&self, host: &str, port: u16) -> bool;
}

/// Bind-and-release probe against the real network stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct BindProbe;

impl PortProbe for BindProbe {
    fn is_free(&self, host: &str, port: u16) -> bool {
        // The listener is dropped immediately, releasing the port.
        TcpListener::bind((host, port)).is_ok()
    }
}

struct ClaimedPorts {
    refreshed_at: DateTime<Utc>,
    ports: BTreeSet<u16>,
}

pub struct PortAllocator {
    host: String,
    range: RangeInclusive<u16>,
    sample_size: usize,
    ttl: Duration,
    clock: SharedClock,
    store: SharedStore,
    probe: Arc<dyn PortProbe>,
    // Held for the whole allocation so two callers never get the same port.
    claimed: Mutex<Option<ClaimedPorts>>,
}

impl PortAllocator {
    pub fn new(
        config: &PortsConfig,
        store: SharedStore,
        clock: SharedClock,
        probe: Arc<dyn PortProbe>,
    ) -> Self {
        Self {
            host: config.host.clone(),
            range: config.start..=config.end,
            sample_size: config.sample_size.max(1),
            ttl: Duration::seconds(config.used_cache_ttl_secs as i64),
            clock,
            store,
            probe,
            claimed: Mutex::new(None),
        }
    }

    pub fn range(&self) -> &RangeInclusive<u16> {
        &self.range
    }

    pub fn contains(&self, port: u16) -> bool {
        self.range.contains(&port)
    }

    /// Find a free port in range that no known tool claims.
    ///
    /// `None` means the range is exhausted; callers treat that as a soft,
    /// per-tool failure.
    pub async fn allocate(&self) -> Option<u16> {
        let mut claimed = self.claimed.lock().await;
        self.refresh_if_stale(&mut claimed).await;

        let taken = claimed
            .as_ref()
            .map(|c| c.ports.clone())
            .unwrap_or_default();
        let candidates: Vec<u16> = self.range.clone().filter(|p| !taken.contains(p)).collect();
        if candidates.is_empty() {
            warn!(start = self.range.start(), end = self.range.end(), "All ports in range are claimed");
            return None;
        }

        let probe = self.probe.clone();
        let host = self.host.clone();
        let sample_size = self.sample_size;
        let found = tokio::task::spawn_blocking(move || {
            probe_candidates(probe.as_ref(), &host, &candidates, sample_size)
        })
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "Port probe task failed");
            None
        });

        match found {
            Some(port) => {
                if let Some(c) = claimed.as_mut() {
                    c.ports.insert(port);
                }
                debug!(port, "Allocated port");
                Some(port)
            }
            None => {
                warn!(start = self.range.start(), end = self.range.end(), "No bindable port left in range");
                None
            }
        }
    }

    /// Mark a port as owned so it is not handed out before the next refresh.
    pub async fn note_claimed(&self, port: u16) {
        let mut claimed = self.claimed.lock().await;
        self.refresh_if_stale(&mut claimed).await;
        if let Some(c) = claimed.as_mut() {
            c.ports.insert(port);
        }
    }

    /// Forget a claim, e.g. after an offline tool's port was cleared.
    pub async fn release(&self, port: u16) {
        if let Some(c) = self.claimed.lock().await.as_mut() {
            c.ports.remove(&port);
        }
    }

    async fn refresh_if_stale(&self, claimed: &mut Option<ClaimedPorts>) {
        if let Some(c) = claimed.as_ref() {
            if !expired(self.clock.as_ref(), c.refreshed_at, self.ttl) {
                return;
            }
        }

        match self.store.fetch_tools().await {
            Ok(tools) => {
                let ports = claimed_ports(&tools, &self.range);
                debug!(claimed = ports.len(), "Refreshed claimed ports");
                *claimed = Some(ClaimedPorts {
                    refreshed_at: self.clock.now(),
                    ports,
                });
            }
            Err(e) => {
                // Keep the previous set; an empty start still gets bind-probed.
                warn!(error = %e, "Could not refresh claimed ports from store");
                if claimed.is_none() {
                    *claimed = Some(ClaimedPorts {
                        refreshed_at: self.clock.now(),
                        ports: BTreeSet::new(),
                    });
                }
            }
        }
    }
}

/// Every in-range port declared by any version of any tool.
fn claimed_ports(tools: &[ToolSpec], range: &RangeInclusive<u16>) -> BTreeSet<u16> {
    tools
        .iter()
        .flat_map(|t| t.versions.iter())
        .filter_map(|v| v.released.as_ref())
        .filter_map(|r| r.port_number())
        .filter(|p| range.contains(p))
        .collect()
}

fn probe_candidates(
    probe: &dyn PortProbe,
    host: &str,
    candidates: &[u16],
    sample_size: usize,
) -> Option<u16> {
    if candidates.len() <= sample_size {
        return candidates.iter().copied().find(|p| probe.is_free(host, *p));
    }

    let mut sample: Vec<u16> = candidates
        .choose_multiple(&mut rand::thread_rng(), sample_size)
        .copied()
        .collect();
    for anchor in [
        candidates[0],
        candidates[candidates.len() / 2],
        candidates[candidates.len() - 1],
    ] {
        if !sample.contains(&anchor) {
            sample.push(anchor);
        }
    }

    if let Some(port) = sample.iter().copied().find(|p| probe.is_free(host, *p)) {
        return Some(port);
    }

    debug!(sampled = sample.len(), "Sampled ports busy, scanning the rest");
    let sampled: BTreeSet<u16> = sample.into_iter().collect();
    candidates
        .iter()
        .copied()
        .filter(|p| !sampled.contains(p))
        .find(|p| probe.is_free(host, *p))
}

/// A port rewrite that must be persisted back to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct PortReassignment {
    pub tool_id: String,
    pub name: String,
    /// `None` when the tool had no port at all.
    pub old_port: Option<u16>,
    pub new_port: u16,
    pub versions: Vec<ToolVersion>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PortRepair {
    pub reassigned: Vec<PortReassignment>,
    /// Tools (id, name) that needed a port but none was left.
    pub exhausted: Vec<(String, String)>,
}

/// Give every tool in `tools` a unique declared port, in place.
///
/// Among tools declaring the same port the smallest `tool_id` (then name)
/// keeps it; the others, and tools with an empty port, get a fresh one.
pub async fn repair_ports(tools: &mut [ToolSpec], allocator: &PortAllocator) -> PortRepair {
    let mut order: Vec<usize> = (0..tools.len()).collect();
    order.sort_by(|&a, &b| {
        (&tools[a].tool_id, &tools[a].name).cmp(&(&tools[b].tool_id, &tools[b].name))
    });

    let mut owners: BTreeMap<u16, String> = BTreeMap::new();
    let mut needs_port = Vec::new();

    for index in order {
        let tool = &tools[index];
        let Some(released) = tool.latest_released() else {
            continue;
        };
        match released.port_number() {
            Some(port) => {
                if let Some(owner) = owners.get(&port) {
                    warn!(
                        tool = tool.display_name(),
                        port,
                        owner = %owner,
                        "Duplicate port, reassigning"
                    );
                    needs_port.push((index, Some(port)));
                } else {
                    owners.insert(port, tool.display_name().to_string());
                }
            }
            None if released.port.trim().is_empty() => needs_port.push((index, None)),
            // Garbage ports are left for the translator to reject.
            None => {}
        }
    }

    for port in owners.keys() {
        allocator.note_claimed(*port).await;
    }

    let mut repair = PortRepair::default();
    for (index, old_port) in needs_port {
        let tool = &mut tools[index];
        let Some(new_port) = allocator.allocate().await else {
            repair
                .exhausted
                .push((tool.tool_id.clone(), tool.display_name().to_string()));
            continue;
        };
        if let Some(released) = tool.latest_released_mut() {
            released.port = new_port.to_string();
        }
        info!(tool = tool.display_name(), old_port, new_port, "Assigned port");
        repair.reassigned.push(PortReassignment {
            tool_id: tool.tool_id.clone(),
            name: tool.display_name().to_string(),
            old_port,
            new_port,
            versions: tool.versions.clone(),
        });
    }
    repair
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::ToolStore;
    use async_trait::async_trait;
    use coven_tools_core::{Released, Result, StatusUpdate};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticStore {
        tools: std::sync::Mutex<Vec<ToolSpec>>,
        fetches: AtomicUsize,
    }

    impl StaticStore {
        fn new(tools: Vec<ToolSpec>) -> Arc<Self> {
            Arc::new(Self {
                tools: std::sync::Mutex::new(tools),
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ToolStore for StaticStore {
        async fn fetch_tools(&self) -> Result<Vec<ToolSpec>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.tools.lock().unwrap().clone())
        }
        async fn update_versions(&self, _: &str, _: &[ToolVersion]) -> Result<()> {
            Ok(())
        }
        async fn update_statuses(&self, _: &[StatusUpdate]) -> Result<()> {
            Ok(())
        }
    }

    /// Ports listed here fail the bind probe.
    struct BusyProbe(BTreeSet<u16>);

    impl PortProbe for BusyProbe {
        fn is_free(&self, _host: &str, port: u16) -> bool {
            !self.0.contains(&port)
        }
    }

    fn tool(id: &str, port: &str) -> ToolSpec {
        ToolSpec {
            tool_id: id.into(),
            name: format!("tool-{id}"),
            versions: vec![ToolVersion {
                version: "1".into(),
                released: Some(Released {
                    args: "uvx thing".into(),
                    port: port.into(),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            on_status: "Online".into(),
            ..Default::default()
        }
    }

    fn allocator(
        start: u16,
        end: u16,
        sample_size: usize,
        store: Arc<StaticStore>,
        busy: &[u16],
    ) -> (PortAllocator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let config = PortsConfig {
            start,
            end,
            sample_size,
            ..PortsConfig::default()
        };
        let probe = Arc::new(BusyProbe(busy.iter().copied().collect()));
        (
            PortAllocator::new(&config, store, clock.clone(), probe),
            clock,
        )
    }

    #[tokio::test]
    async fn test_never_returns_port_outside_range() {
        let store = StaticStore::new(vec![]);
        let busy: Vec<u16> = (10_000..10_400).filter(|p| p % 3 == 0).collect();
        let (alloc, _) = allocator(10_000, 10_399, 100, store, &busy);

        let mut seen = BTreeSet::new();
        for _ in 0..50 {
            let port = alloc.allocate().await.unwrap();
            assert!((10_000..=10_399).contains(&port));
            assert!(port % 3 != 0, "busy port {port} returned");
            assert!(seen.insert(port), "port {port} handed out twice");
        }
    }

    #[tokio::test]
    async fn test_skips_ports_claimed_by_stored_tools() {
        let store = StaticStore::new(vec![tool("a", "10000"), tool("b", "10001")]);
        let (alloc, _) = allocator(10_000, 10_002, 100, store, &[]);
        assert_eq!(alloc.allocate().await, Some(10_002));
        assert_eq!(alloc.allocate().await, None);
    }

    #[tokio::test]
    async fn test_falls_back_to_full_scan() {
        let store = StaticStore::new(vec![]);
        // Only one bindable port, far outside any small sample.
        let busy: Vec<u16> = (20_000..=20_999).filter(|p| *p != 20_777).collect();
        let (alloc, _) = allocator(20_000, 20_999, 2, store, &busy);
        assert_eq!(alloc.allocate().await, Some(20_777));
    }

    #[tokio::test]
    async fn test_exhaustion_is_soft() {
        let store = StaticStore::new(vec![]);
        let busy: Vec<u16> = (30_000..=30_009).collect();
        let (alloc, _) = allocator(30_000, 30_009, 100, store, &busy);
        assert_eq!(alloc.allocate().await, None);
    }

    #[tokio::test]
    async fn test_claimed_set_refreshes_after_ttl() {
        let store = StaticStore::new(vec![]);
        let (alloc, clock) = allocator(10_000, 10_001, 100, store.clone(), &[]);

        alloc.allocate().await.unwrap();
        alloc.allocate().await.unwrap();
        assert_eq!(store.fetches.load(Ordering::SeqCst), 1);

        clock.advance(Duration::seconds(30));
        // Nothing stored claims either port, so both come back.
        assert!(alloc.allocate().await.is_some());
        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_repair_keeps_smallest_id_on_duplicate() {
        let mut tools = vec![tool("b", "10005"), tool("a", "10005")];
        let store = StaticStore::new(tools.clone());
        let (alloc, _) = allocator(10_000, 10_010, 100, store, &[]);

        let repair = repair_ports(&mut tools, &alloc).await;

        assert_eq!(repair.reassigned.len(), 1);
        let moved = &repair.reassigned[0];
        assert_eq!(moved.tool_id, "b");
        assert_eq!(moved.old_port, Some(10_005));
        assert_ne!(moved.new_port, 10_005);
        assert!((10_000..=10_010).contains(&moved.new_port));
        assert_eq!(tools[1].declared_port(), Some(10_005));
        assert_eq!(tools[0].declared_port(), Some(moved.new_port));
        assert_eq!(moved.versions, tools[0].versions);
    }

    #[tokio::test]
    async fn test_repair_assigns_missing_ports() {
        let mut tools = vec![tool("a", ""), tool("b", "10001")];
        let store = StaticStore::new(tools.clone());
        let (alloc, _) = allocator(10_000, 10_001, 100, store, &[]);

        let repair = repair_ports(&mut tools, &alloc).await;
        assert_eq!(repair.reassigned.len(), 1);
        assert_eq!(repair.reassigned[0].old_port, None);
        assert_eq!(tools[0].declared_port(), Some(10_000));
    }

    #[tokio::test]
    async fn test_repair_reports_exhaustion() {
        let mut tools = vec![tool("a", "10000"), tool("b", "10000")];
        let store = StaticStore::new(tools.clone());
        let (alloc, _) = allocator(10_000, 10_000, 100, store, &[]);

        let repair = repair_ports(&mut tools, &alloc).await;
        assert!(repair.reassigned.is_empty());
        assert_eq!(repair.exhausted, vec![("b".to_string(), "tool-b".to_string())]);
    }
}
