// ABOUTME: Configuration store boundary: where desired tool state is read and written.
// ABOUTME: ToolStore trait plus REST (Supabase/PostgREST) and JSON-file adapters.

mod file;
mod rest;

pub use file::FileToolStore;
pub use rest::RestToolStore;

use async_trait::async_trait;
use coven_tools_core::{Config, Result, StatusUpdate, StoreKind, ToolSpec, ToolVersion};
use std::sync::Arc;

/// Read/write access to the tool configuration store.
#[async_trait]
pub trait ToolStore: Send + Sync {
    /// All tool records, in the store's order.
    async fn fetch_tools(&self) -> Result<Vec<ToolSpec>>;

    /// Replace a tool's `versions` (used for port repairs).
    async fn update_versions(&self, tool_id: &str, versions: &[ToolVersion]) -> Result<()>;

    /// Write composite statuses for a set of tools.
    async fn update_statuses(&self, updates: &[StatusUpdate]) -> Result<()>;
}

pub type SharedStore = Arc<dyn ToolStore>;

/// Build the store adapter selected in the config.
pub fn from_config(config: &Config) -> Result<SharedStore> {
    match config.store.kind {
        StoreKind::Rest => Ok(Arc::new(RestToolStore::new(&config.store)?)),
        StoreKind::File => {
            let path = config.store_path().ok_or_else(|| {
                coven_tools_core::Error::Config("store.path is required for the file store".into())
            })?;
            Ok(Arc::new(FileToolStore::new(path)))
        }
    }
}
