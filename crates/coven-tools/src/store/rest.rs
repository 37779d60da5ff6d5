// ABOUTME: Supabase/PostgREST tool store over reqwest.
// ABOUTME: Reads the decrypted-keys view, patches versions, upserts statuses in batches.

use super::ToolStore;
use async_trait::async_trait;
use coven_tools_core::{Error, Result, StatusUpdate, StoreConfig, ToolSpec, ToolVersion};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Status rows per upsert request.
const STATUS_BATCH_SIZE: usize = 5;
const MAX_ATTEMPTS: u32 = 3;

pub struct RestToolStore {
    client: reqwest::Client,
    base_url: String,
    key: String,
    read_table: String,
    write_table: String,
    retry_delay: Duration,
}

impl RestToolStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(Error::Config(
                "store.url (or SUPABASE_URL) must be set for the rest store".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            key: config.key.clone(),
            read_table: config.read_table.clone(),
            write_table: config.write_table.clone(),
            retry_delay: Duration::from_secs(2),
        })
    }

    /// Base delay between retries; attempt `n` waits `n * delay`.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn endpoint(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.key.is_empty() {
            request
        } else {
            request.header("apikey", &self.key).bearer_auth(&self.key)
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::Store {
            status: status.as_u16(),
            body,
        })
    }

    /// Retry timeouts with linear backoff; anything else fails immediately.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_timeout() && attempt < MAX_ATTEMPTS => {
                    let wait = self.retry_delay * attempt;
                    warn!(
                        operation = what,
                        attempt,
                        max_attempts = MAX_ATTEMPTS,
                        wait_ms = wait.as_millis() as u64,
                        "Store request timed out, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ToolStore for RestToolStore {
    async fn fetch_tools(&self) -> Result<Vec<ToolSpec>> {
        let url = self.endpoint(&self.read_table);
        debug!(url = %url, "Fetching tools from store");
        let response = self
            .authed(self.client.get(&url).query(&[("select", "*")]))
            .send()
            .await?;
        let response = Self::check(response).await?;
        let tools: Option<Vec<ToolSpec>> = response.json().await?;
        Ok(tools.unwrap_or_default())
    }

    async fn update_versions(&self, tool_id: &str, versions: &[ToolVersion]) -> Result<()> {
        let url = self.endpoint(&self.write_table);
        let filter = format!("eq.{}", tool_id);
        let body = serde_json::json!({ "versions": versions });
        let (url, filter, body) = (url.as_str(), filter.as_str(), &body);

        self.with_retry("update_versions", move || async move {
            let response = self
                .authed(self.client.patch(url).query(&[("tool_id", filter)]))
                .json(body)
                .send()
                .await?;
            Self::check(response).await.map(|_| ())
        })
        .await?;

        info!(tool_id, "Updated tool versions in store");
        Ok(())
    }

    async fn update_statuses(&self, updates: &[StatusUpdate]) -> Result<()> {
        let url = self.endpoint(&self.write_table);
        let url = url.as_str();
        let grouped = status_batches(updates);
        let batches = grouped.len();
        let mut failed = 0usize;
        let mut last_error = None;

        for (index, batch) in grouped.iter().enumerate() {
            debug!(batch = index + 1, of = batches, rows = batch.len(), "Writing status batch");
            let result = self
                .with_retry("update_statuses", move || async move {
                    let response = self
                        .authed(self.client.post(url).query(&[("on_conflict", "tool_id")]))
                        .header("Prefer", "resolution=merge-duplicates")
                        .json(batch)
                        .send()
                        .await?;
                    Self::check(response).await.map(|_| ())
                })
                .await;

            if let Err(e) = result {
                warn!(batch = index + 1, error = %e, "Failed to write status batch");
                failed += 1;
                last_error = Some(e);
            }
        }

        match last_error {
            None => Ok(()),
            Some(e) => Err(Error::StoreUnavailable(format!(
                "{} of {} status batches failed, last error: {}",
                failed, batches, e
            ))),
        }
    }
}

/// Split status rows into upsert batches of at most `STATUS_BATCH_SIZE`.
///
/// PostgREST rejects a bulk upsert whose objects have different keys, so
/// rows carrying `versions` never share a batch with rows that do not.
fn status_batches(updates: &[StatusUpdate]) -> Vec<Vec<&StatusUpdate>> {
    let (plain, with_versions): (Vec<&StatusUpdate>, Vec<&StatusUpdate>) =
        updates.iter().partition(|u| u.versions.is_none());
    plain
        .chunks(STATUS_BATCH_SIZE)
        .chain(with_versions.chunks(STATUS_BATCH_SIZE))
        .map(<[&StatusUpdate]>::to_vec)
        .collect()
}
