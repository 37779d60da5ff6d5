// ABOUTME: Shared types and configuration for coven-tools.
// ABOUTME: Contains config parsing, the tool record model, and error types.

pub mod config;
pub mod error;
pub mod tool;

pub use config::{
    Config, PortsConfig, RestartConfig, StoreConfig, StoreKind, SupervisorConfig,
};
pub use error::{Error, Result};
pub use tool::{Released, StatusUpdate, ToolSpec, ToolStatus, ToolVersion};
