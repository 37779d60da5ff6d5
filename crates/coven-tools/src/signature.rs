// ABOUTME: Content signatures of process specs for tick-to-tick change detection.
// ABOUTME: SHA256 over the canonical JSON of {command, name, port}, hex encoded.

use crate::translate::ProcessSpec;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Tool name to signature, as committed at the end of a reconcile.
pub type SignatureMap = BTreeMap<String, String>;

/// Signature of one process spec.
pub fn compute(spec: &ProcessSpec) -> String {
    // Keys are written in a fixed order, so the byte form is canonical.
    let canonical = serde_json::json!({
        "command": spec.command,
        "name": spec.name,
        "port": spec.port,
    })
    .to_string();

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Per-tool classification of desired state against the previous baseline.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Diff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
}

impl Diff {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// Classify every name in `current` and `previous`. Output lists are sorted.
pub fn diff(previous: &SignatureMap, current: &SignatureMap) -> Diff {
    let names: BTreeSet<&String> = previous.keys().chain(current.keys()).collect();
    let mut out = Diff::default();

    for name in names {
        match (previous.get(name), current.get(name)) {
            (None, Some(_)) => out.added.push(name.clone()),
            (Some(_), None) => out.removed.push(name.clone()),
            (Some(old), Some(new)) if old == new => out.unchanged.push(name.clone()),
            (Some(_), Some(_)) => out.modified.push(name.clone()),
            (None, None) => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, command: &str, port: u16) -> ProcessSpec {
        ProcessSpec {
            tool_id: format!("id-{name}"),
            name: name.into(),
            command: command.into(),
            port,
            argv: command.split(' ').map(str::to_string).collect(),
        }
    }

    #[test]
    fn test_signature_is_stable() {
        let a = spec("fetch", "mcp-proxy --sse-port=10001 -- uvx fetch", 10001);
        assert_eq!(compute(&a), compute(&a.clone()));
        assert_eq!(compute(&a).len(), 64);
    }

    #[test]
    fn test_any_field_change_changes_signature() {
        let base = spec("fetch", "mcp-proxy --sse-port=10001 -- uvx fetch", 10001);
        let sig = compute(&base);

        let mut renamed = base.clone();
        renamed.name = "fetch2".into();
        let mut recommanded = base.clone();
        recommanded.command.push_str(" --verbose");
        let mut reported = base.clone();
        reported.port = 10002;

        assert_ne!(sig, compute(&renamed));
        assert_ne!(sig, compute(&recommanded));
        assert_ne!(sig, compute(&reported));
    }

    #[test]
    fn test_tool_id_is_not_part_of_signature() {
        let a = spec("fetch", "cmd", 10001);
        let mut b = a.clone();
        b.tool_id = "other".into();
        assert_eq!(compute(&a), compute(&b));
    }

    #[test]
    fn test_diff_classifies_all_four_states() {
        let previous: SignatureMap = [("a", "1"), ("b", "2"), ("c", "3")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let current: SignatureMap = [("a", "1"), ("b", "changed"), ("d", "4")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let d = diff(&previous, &current);
        assert_eq!(d.added, vec!["d"]);
        assert_eq!(d.modified, vec!["b"]);
        assert_eq!(d.removed, vec!["c"]);
        assert_eq!(d.unchanged, vec!["a"]);
        assert!(!d.is_noop());
        assert!(diff(&current, &current).is_noop());
    }
}
