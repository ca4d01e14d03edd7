use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::QuireResult;

/// What happens to a client that sends something it must not
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationPolicy {
    /// Close the connection; the client reconnects and gets a fresh snapshot
    #[default]
    Disconnect,
    /// Answer with an `error` event and keep the connection open
    Reject,
}

/// Frame type used for outbound messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// JSON in text frames
    #[default]
    Text,
    /// lib0-framed JSON in binary frames
    Lib0,
}

/// Tunables for sessions, the session manager and client connections
///
/// Every field may be omitted from a TOML file; durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub save_interval_ms: u64,
    pub idle_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    /// Accepted edits between two history garbage collection passes
    pub gc_threshold: usize,
    pub join_retry_backoff_ms: u64,
    pub join_retry_limit: u32,
    pub session_queue_capacity: usize,
    pub manager_queue_capacity: usize,
    pub violation_policy: ViolationPolicy,
    pub framing: Framing,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            save_interval_ms: 60_000,
            idle_timeout_ms: 30_000,
            keepalive_interval_ms: 30_000,
            gc_threshold: 200,
            join_retry_backoff_ms: 50,
            join_retry_limit: 200,
            session_queue_capacity: 256,
            manager_queue_capacity: 1024,
            violation_policy: ViolationPolicy::Disconnect,
            framing: Framing::Text,
        }
    }
}

impl CollabConfig {
    /// Parse a configuration from TOML
    pub fn from_toml_str(source: &str) -> QuireResult<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Load a configuration from a TOML file
    pub async fn load(path: impl AsRef<Path>) -> QuireResult<Self> {
        let source = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&source)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn join_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.join_retry_backoff_ms)
    }
}
