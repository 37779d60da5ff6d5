// ABOUTME: Turns a stored tool record into a concrete, launchable process spec.
// ABOUTME: Produces the `<proxy> --sse-port=<p> [-e K V]... -- <args>` command line.

use coven_tools_core::ToolSpec;
use thiserror::Error;

/// Why a tool record could not be turned into a process spec.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranslateError {
    #[error("tool has no versions")]
    NoVersions,

    #[error("latest version has no released config")]
    NoReleased,

    #[error("latest released config has empty args")]
    MissingArgs,

    #[error("invalid port '{0}'")]
    InvalidPort(String),
}

/// A fully expanded launch description for one tool. Recomputed every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub tool_id: String,
    pub name: String,
    /// Whitespace-collapsed command line; what signatures and listener
    /// matching compare against.
    pub command: String,
    pub port: u16,
    /// Program followed by its arguments.
    pub argv: Vec<String>,
}

impl ProcessSpec {
    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }
}

/// Collapse every run of whitespace into a single space.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Translate the latest version of `tool` into a process spec.
pub fn translate(tool: &ToolSpec, proxy_binary: &str) -> Result<ProcessSpec, TranslateError> {
    let version = tool.latest().ok_or(TranslateError::NoVersions)?;
    let released = version.released.as_ref().ok_or(TranslateError::NoReleased)?;

    if released.args.trim().is_empty() {
        return Err(TranslateError::MissingArgs);
    }
    let port = released
        .port_number()
        .ok_or_else(|| TranslateError::InvalidPort(released.port.clone()))?;

    let mut argv = vec![proxy_binary.to_string(), format!("--sse-port={}", port)];
    for (key, value) in &released.env {
        argv.push("-e".to_string());
        argv.push(key.clone());
        argv.push(value.clone());
    }
    argv.push("--".to_string());
    argv.extend(released.args.split_whitespace().map(str::to_string));

    let command = collapse_whitespace(&argv.join(" "));

    Ok(ProcessSpec {
        tool_id: tool.tool_id.clone(),
        name: tool.display_name().to_string(),
        command,
        port,
        argv,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use coven_tools_core::{Released, ToolVersion};

    fn tool(args: &str, port: &str, env: &[(&str, &str)]) -> ToolSpec {
        ToolSpec {
            tool_id: "t1".into(),
            name: "fetch mcp".into(),
            versions: vec![
                ToolVersion {
                    version: "0".into(),
                    released: Some(Released {
                        args: "old args".into(),
                        port: "10000".into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ToolVersion {
                    version: "1".into(),
                    released: Some(Released {
                        args: args.into(),
                        port: port.into(),
                        env: env
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ],
            on_status: "Online".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_command_shape() {
        let spec = translate(
            &tool("uvx   mcp-server-fetch", "10001", &[("API_KEY", "abc"), ("MODE", "x")]),
            "mcp-proxy",
        )
        .unwrap();

        assert_eq!(
            spec.command,
            "mcp-proxy --sse-port=10001 -e API_KEY abc -e MODE x -- uvx mcp-server-fetch"
        );
        assert_eq!(spec.port, 10001);
        assert_eq!(spec.program(), Some("mcp-proxy"));
        assert_eq!(spec.args().last().map(String::as_str), Some("mcp-server-fetch"));
    }

    #[test]
    fn test_env_flags_follow_store_order() {
        let tool: ToolSpec = serde_json::from_str(
            r#"{"tool_id": "t9", "name": "ordered", "versions": [{"released": {
                "args": "uvx a", "port": "10001",
                "env": {"ZED": "1", "ALPHA": "2"}
            }}]}"#,
        )
        .unwrap();
        let spec = translate(&tool, "p").unwrap();
        assert_eq!(spec.command, "p --sse-port=10001 -e ZED 1 -e ALPHA 2 -- uvx a");
    }

    #[test]
    fn test_uses_latest_version() {
        let spec = translate(&tool("npx thing", "10002", &[]), "mcp-proxy").unwrap();
        assert_eq!(spec.command, "mcp-proxy --sse-port=10002 -- npx thing");
    }

    #[test]
    fn test_translation_is_pure() {
        let t = tool("uvx a", "10003", &[("K", "V")]);
        assert_eq!(translate(&t, "p").unwrap(), translate(&t, "p").unwrap());
    }

    #[test]
    fn test_rejects_bad_records() {
        assert_eq!(
            translate(&tool("  ", "10001", &[]), "p"),
            Err(TranslateError::MissingArgs)
        );
        assert_eq!(
            translate(&tool("uvx a", "", &[]), "p"),
            Err(TranslateError::InvalidPort(String::new()))
        );
        assert_eq!(
            translate(&tool("uvx a", "70000", &[]), "p"),
            Err(TranslateError::InvalidPort("70000".into()))
        );
        assert_eq!(
            translate(&ToolSpec::default(), "p"),
            Err(TranslateError::NoVersions)
        );

        let mut legacy = tool("uvx a", "10001", &[]);
        legacy.versions[1].released = None;
        assert_eq!(translate(&legacy, "p"), Err(TranslateError::NoReleased));
    }

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(collapse_whitespace("  a \t b\n\nc "), "a b c");
    }
}
