// ABOUTME: Tool records as stored in the remote configuration store.
// ABOUTME: Lenient decoding of legacy rows plus the composite status vocabulary.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use indexmap::IndexMap;
use std::fmt;

/// One tool row from the configuration store.
///
/// The supervisor only ever writes back `versions` (port repairs) and
/// `on_status`; everything else is owned by the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    #[serde(default, deserialize_with = "string_or_number")]
    pub tool_id: String,

    #[serde(default, deserialize_with = "string_or_number")]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,

    /// Ordered oldest to newest; the last element is what gets launched.
    #[serde(default, deserialize_with = "null_as_default")]
    pub versions: Vec<ToolVersion>,

    #[serde(default, deserialize_with = "string_or_number")]
    pub on_status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolVersion {
    #[serde(default, deserialize_with = "string_or_number")]
    pub version: String,

    /// `None` when the row holds no usable launch config (legacy rows keep
    /// a release date string here).
    #[serde(default, deserialize_with = "lenient_released")]
    pub released: Option<Released>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Launch configuration of one released version.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Released {
    #[serde(default, deserialize_with = "string_or_number")]
    pub args: String,

    /// Kept as the store's string form; empty means "not assigned yet".
    #[serde(default, deserialize_with = "string_or_number")]
    pub port: String,

    /// In the store's order, which is the order of the `-e` flags.
    #[serde(default, deserialize_with = "env_map")]
    pub env: IndexMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, deserialize_with = "string_list")]
    pub required_env: Vec<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Released {
    /// The declared port, if it parses as a usable TCP port.
    pub fn port_number(&self) -> Option<u16> {
        self.port.trim().parse::<u16>().ok().filter(|p| *p != 0)
    }
}

impl ToolSpec {
    /// Name used in logs and file names; falls back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.tool_id
        } else {
            &self.name
        }
    }

    pub fn latest(&self) -> Option<&ToolVersion> {
        self.versions.last()
    }

    pub fn latest_released(&self) -> Option<&Released> {
        self.versions.last().and_then(|v| v.released.as_ref())
    }

    pub fn latest_released_mut(&mut self) -> Option<&mut Released> {
        self.versions.last_mut().and_then(|v| v.released.as_mut())
    }

    /// Declared port of the latest released version.
    pub fn declared_port(&self) -> Option<u16> {
        self.latest_released().and_then(Released::port_number)
    }

    pub fn status(&self) -> ToolStatus {
        ToolStatus::classify(&self.on_status)
    }

    /// Offline and Predefined tools are never launched by the supervisor.
    pub fn is_active(&self) -> bool {
        !matches!(self.status(), ToolStatus::Offline | ToolStatus::Predefined)
    }

    /// Whether any released version carries environment variables.
    pub fn has_env_vars(&self) -> bool {
        self.versions
            .iter()
            .filter_map(|v| v.released.as_ref())
            .any(|r| !r.env.is_empty())
    }
}

/// Composite status vocabulary shared with the store.
///
/// The store column is free text (`"Inactive, Port 10007 not found ..."`),
/// so classification only looks at the leading word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolStatus {
    Online,
    Inactive,
    Offline,
    Predefined,
}

impl ToolStatus {
    pub fn classify(raw: &str) -> Self {
        let head = raw.split(',').next().unwrap_or_default().trim();
        match head {
            "Online" => ToolStatus::Online,
            "Offline" => ToolStatus::Offline,
            "Predefined" => ToolStatus::Predefined,
            _ => ToolStatus::Inactive,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Online => "Online",
            ToolStatus::Inactive => "Inactive",
            ToolStatus::Offline => "Offline",
            ToolStatus::Predefined => "Predefined",
        }
    }

    /// Store text for this status with an optional human-readable reason.
    pub fn with_reason(&self, reason: Option<&str>) -> String {
        match reason {
            Some(r) if !r.is_empty() => format!("{}, {}", self.as_str(), r),
            _ => self.as_str().to_string(),
        }
    }
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status write-back row.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusUpdate {
    pub tool_id: String,
    pub name: String,
    pub on_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub versions: Option<Vec<ToolVersion>>,
}

fn scalar_to_string(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s,
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(scalar_to_string(Value::deserialize(deserializer)?))
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn lenient_released<'de, D>(deserializer: D) -> Result<Option<Released>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        value @ Value::Object(_) => Ok(serde_json::from_value(value).ok()),
        _ => Ok(None),
    }
}

fn env_map<'de, D>(deserializer: D) -> Result<IndexMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(k, v)| (k, scalar_to_string(v)))
            .collect()),
        _ => Ok(IndexMap::new()),
    }
}

fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Array(items) => Ok(items.into_iter().map(scalar_to_string).collect()),
        Value::String(s) if !s.trim().is_empty() => Ok(vec![s]),
        _ => Ok(Vec::new()),
    }
}
