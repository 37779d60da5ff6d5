// ABOUTME: Integration tests for the listener-based status checker and restart cooldown.
// ABOUTME: Drives scripted listening sockets and a manual clock through full status passes.

mod common;

use chrono::Duration;
use common::{tool, tool_with_env, Harness};

const ONLINE_CMD: &str = "/usr/bin/python3 /usr/local/bin/mcp-proxy --sse-port=10001 -- uvx server-a";

fn status_of(h: &Harness, tool_id: &str) -> String {
    h.store.last_statuses()[tool_id].on_status.clone()
}

// ============================================================================
// Status texts
// ============================================================================

#[tokio::test]
async fn test_matching_listener_is_online() {
    let h = Harness::new(vec![tool("a", "A", "10001", "uvx   server-a")]);
    h.listeners.listen(10001, Some(ONLINE_CMD));

    let report = h.status.run_once().await.unwrap();

    assert_eq!(status_of(&h, "a"), "Online");
    assert!(report.restarted.is_empty());
    assert!(h.launcher.events().is_empty());
}

#[tokio::test]
async fn test_missing_listener_is_inactive_and_restarted() {
    let h = Harness::new(vec![tool("a", "A", "10001", "uvx server-a")]);

    let report = h.status.run_once().await.unwrap();

    assert_eq!(
        status_of(&h, "a"),
        "Inactive, Port 10001 not found in running processes"
    );
    assert_eq!(report.restarted, vec!["A"]);
    assert_eq!(h.launcher.starts(), vec!["A"]);
    assert!(h.table.contains("A").await);
}

#[tokio::test]
async fn test_foreign_listener_is_reported_not_restarted() {
    let h = Harness::new(vec![tool("a", "A", "10001", "uvx server-a")]);
    h.listeners.listen(10001, Some("python -m http.server 10001"));

    let report = h.status.run_once().await.unwrap();

    assert_eq!(
        status_of(&h, "a"),
        "Inactive, Port is used by: python -m http.server 10001"
    );
    assert!(report.restarted.is_empty());
}

#[tokio::test]
async fn test_invisible_listener_depends_on_ownership() {
    let h = Harness::new(vec![tool("a", "A", "10001", "uvx server-a")]);
    h.listeners.listen(10001, None);

    h.status.run_once().await.unwrap();
    assert_eq!(
        status_of(&h, "a"),
        "Inactive, Port is used by an unknown or inaccessible process"
    );

    // Once we own the process on that port, an opaque listener is ours.
    h.reconciler.reconcile(false).await.unwrap();
    h.status.run_once().await.unwrap();
    assert_eq!(status_of(&h, "a"), "Online");
}

#[tokio::test]
async fn test_unlaunchable_tool_is_plain_inactive() {
    let h = Harness::new(vec![tool("a", "A", "", "uvx server-a")]);
    let report = h.status.run_once().await.unwrap();

    assert_eq!(status_of(&h, "a"), "Inactive");
    assert!(report.restarted.is_empty());
}

#[tokio::test]
async fn test_offline_tool_releases_its_port() {
    let mut offline = tool("o", "Off", "10009", "uvx off");
    offline.on_status = "Offline".into();
    let h = Harness::new(vec![offline]);

    let report = h.status.run_once().await.unwrap();

    assert_eq!(report.released_ports, vec![("Off".to_string(), 10009)]);
    let update = &h.store.last_statuses()["o"];
    assert_eq!(update.on_status, "Offline");
    let versions = update.versions.as_ref().unwrap();
    assert!(versions[0].released.as_ref().unwrap().port.is_empty());
    assert!(h.launcher.events().is_empty());

    // Already released: nothing more to write next time.
    h.expire_caches();
    let again = h.status.run_once().await.unwrap();
    assert!(again.released_ports.is_empty());
}

#[tokio::test]
async fn test_predefined_company_tools_with_env() {
    let mut with_env = tool_with_env("p", "Pre", "10001", "uvx pre", &[("TOKEN", "x")]);
    with_env.company_id = Some("predefined-co".into());
    let mut without_env = tool("q", "Plain", "10002", "uvx plain");
    without_env.company_id = Some("predefined-co".into());
    let mut other_company = tool_with_env("r", "Other", "10003", "uvx other", &[("TOKEN", "y")]);
    other_company.company_id = Some("someone-else".into());

    let h = Harness::new(vec![with_env, without_env, other_company]);
    let report = h.status.run_once().await.unwrap();

    assert_eq!(status_of(&h, "p"), "Predefined");
    assert!(status_of(&h, "q").starts_with("Inactive, Port 10002"));
    assert!(status_of(&h, "r").starts_with("Inactive, Port 10003"));
    assert_eq!(report.restarted, vec!["Other", "Plain"]);
}

// ============================================================================
// Restart cooldown
// ============================================================================

#[tokio::test]
async fn test_restart_cooldown_boundary() {
    let h = Harness::new(vec![tool("a", "A", "10001", "uvx server-a")]);

    let first = h.status.run_once().await.unwrap();
    assert_eq!(first.restarted, vec!["A"]);

    // Still down just before the cooldown ends: suppressed.
    h.clock.advance(Duration::minutes(15) - Duration::seconds(1));
    let early = h.status.run_once().await.unwrap();
    assert!(early.restarted.is_empty());
    assert_eq!(early.suppressed, vec!["A"]);

    // Just after: restarted, replacing the tracked entry.
    h.clock.advance(Duration::seconds(2));
    let late = h.status.run_once().await.unwrap();
    assert_eq!(late.restarted, vec!["A"]);
    assert_eq!(h.launcher.events(), vec!["start:A", "stop:A", "start:A"]);
}

#[tokio::test]
async fn test_failed_restart_still_counts_as_attempt() {
    let h = Harness::new(vec![tool("a", "A", "10001", "uvx server-a")]);
    h.launcher.fail("A");

    let first = h.status.run_once().await.unwrap();
    assert_eq!(first.restart_failed.len(), 1);

    h.launcher.heal("A");
    h.clock.advance(Duration::minutes(1));
    let second = h.status.run_once().await.unwrap();
    assert!(second.restarted.is_empty());
    assert_eq!(second.suppressed, vec!["A"]);
}

#[tokio::test]
async fn test_every_tool_gets_a_status_row() {
    let mut offline = tool("o", "Off", "10005", "uvx off");
    offline.on_status = "Offline".into();
    let h = Harness::new(vec![
        tool("a", "A", "10001", "uvx server-a"),
        tool("b", "B", "10002", "uvx b"),
        offline,
    ]);
    h.listeners.listen(10001, Some(ONLINE_CMD));

    let report = h.status.run_once().await.unwrap();
    assert_eq!(report.statuses.len(), 3);
    assert_eq!(h.store.last_statuses().len(), 3);
}

#[tokio::test]
async fn test_status_write_failure_is_not_fatal() {
    let h = Harness::new(vec![tool("a", "A", "10001", "uvx server-a")]);
    h.cache.get_tool_specs(false).await.unwrap();
    h.store.set_down(true);

    let report = h.status.run_once().await.unwrap();
    assert_eq!(report.statuses.len(), 1);
    assert!(h.store.status_writes.lock().unwrap().is_empty());
}
