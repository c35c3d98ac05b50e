//! Client configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use eaves_common::{Error, Result};

/// Default pin name used when none is given.
pub const DEFAULT_PIN_NAME: &str = "_default";

/// Backoff settings for replaying queued commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRetryConfig {
    /// Delay after the first transient failure, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound on the delay, in milliseconds.
    pub max_backoff_ms: u64,
    /// Backoff growth factor.
    pub multiplier: f64,
}

impl QueueRetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for QueueRetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

/// Client configuration.
///
/// Stored as JSON next to the local datastore so that operator tools can
/// open the same data directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Remote service base URL.
    pub server: String,
    /// Application identifier sent with every request.
    pub application_id: String,
    /// Client key, if the service requires one.
    #[serde(default)]
    pub client_key: Option<String>,
    /// Whether pinned data and query results are persisted locally.
    #[serde(default)]
    pub local_datastore_enabled: bool,
    /// Directory holding the datastore, command journal and session.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Attempts for direct (non-queued) network calls.
    #[serde(default = "default_retry_attempts")]
    pub network_retry_attempts: u32,
    /// Deadline for a single remote request, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Backoff for queued commands.
    #[serde(default)]
    pub queue_retry: QueueRetryConfig,
    /// Pin used when callers do not name one.
    #[serde(default = "default_pin_name")]
    pub default_pin_name: String,
    /// Evaluate object ACLs locally before saves and deletes.
    #[serde(default)]
    pub local_acl_checks: bool,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_pin_name() -> String {
    DEFAULT_PIN_NAME.to_string()
}

impl ClientConfig {
    /// Create a configuration with defaults for everything but the endpoint.
    pub fn new(server: impl Into<String>, application_id: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            application_id: application_id.into(),
            client_key: None,
            local_datastore_enabled: false,
            data_dir: None,
            network_retry_attempts: default_retry_attempts(),
            request_timeout_ms: default_request_timeout_ms(),
            queue_retry: QueueRetryConfig::default(),
            default_pin_name: default_pin_name(),
            local_acl_checks: false,
        }
    }

    /// Persist the command journal and session under `data_dir` without
    /// enabling the local datastore.
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    /// Enable the local datastore under `data_dir`.
    pub fn with_local_datastore(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.local_datastore_enabled = true;
        self.data_dir = Some(data_dir.into());
        self
    }

    pub fn with_client_key(mut self, key: impl Into<String>) -> Self {
        self.client_key = Some(key.into());
        self
    }

    pub fn with_network_retry_attempts(mut self, attempts: u32) -> Self {
        self.network_retry_attempts = attempts;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn with_queue_retry(mut self, retry: QueueRetryConfig) -> Self {
        self.queue_retry = retry;
        self
    }

    pub fn with_local_acl_checks(mut self, enabled: bool) -> Self {
        self.local_acl_checks = enabled;
        self
    }

    /// Check the configuration for contradictions.
    ///
    /// # Errors
    /// - Empty server URL or application id
    /// - Datastore enabled without a data directory
    /// - Empty default pin name
    /// - Zero request timeout
    pub fn validate(&self) -> Result<()> {
        if self.server.trim().is_empty() {
            return Err(Error::InvalidInput("Server URL must not be empty".to_string()));
        }
        if self.application_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "Application id must not be empty".to_string(),
            ));
        }
        if self.local_datastore_enabled && self.data_dir.is_none() {
            return Err(Error::InvalidInput(
                "Local datastore requires a data directory".to_string(),
            ));
        }
        if self.default_pin_name.is_empty() {
            return Err(Error::InvalidInput(
                "Default pin name must not be empty".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::InvalidInput(
                "Request timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Configuration file name in the data directory.
pub const CONFIG_FILENAME: &str = "eaves.config.json";

/// Datastore file name in the data directory.
pub const DATASTORE_FILENAME: &str = "datastore.sqlite";

/// Command journal file name in the data directory.
pub const JOURNAL_FILENAME: &str = "command_queue.json";

/// Persisted session file name in the data directory.
pub const SESSION_FILENAME: &str = "current_session.json";
