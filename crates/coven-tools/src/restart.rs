// ABOUTME: Per-tool restart rate limiting.
// ABOUTME: One attempt per cooldown window; every attempt is recorded before it runs.

use crate::clock::SharedClock;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

pub struct RestartPolicy {
    cooldown: Duration,
    clock: SharedClock,
    attempts: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl RestartPolicy {
    pub fn new(cooldown: std::time::Duration, clock: SharedClock) -> Self {
        Self {
            cooldown: Duration::from_std(cooldown).unwrap_or_else(|_| Duration::minutes(15)),
            clock,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Claim a restart attempt for `tool`.
    ///
    /// Returns false while the tool is cooling down. On true the attempt is
    /// already recorded, whatever the restart's outcome turns out to be.
    pub fn try_acquire(&self, tool: &str) -> bool {
        let now = self.clock.now();
        let mut attempts = self.attempts.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(last) = attempts.get(tool) {
            let elapsed = now - *last;
            if elapsed < self.cooldown {
                debug!(
                    tool,
                    remaining_secs = (self.cooldown - elapsed).num_seconds(),
                    "Restart suppressed by cooldown"
                );
                return false;
            }
        }
        attempts.insert(tool.to_string(), now);
        true
    }

    pub fn last_attempt(&self, tool: &str) -> Option<DateTime<Utc>> {
        self.attempts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(tool)
            .copied()
    }
}
