//! Configuration for the sync engine.

use std::time::Duration;
use vaultsync_protocol::Version;

/// Configuration shared by every session of one engine instance.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Stable id of this client installation.
    pub client_id: String,
    /// Version of the running client build.
    pub client_version: Version,
    /// Minimum version this build remains compatible with.
    pub compatibility_minimal: Version,
    /// Base URL of the remote service.
    pub base_url: String,
    /// Maximum number of changes per outbound batch.
    pub batch_size: usize,
    /// Capacity of each session's input mailbox.
    pub mailbox_capacity: usize,
    /// Ceiling for the realtime connect handshake.
    pub realtime_handshake_timeout: Duration,
    /// Retry behavior for outbound sends.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration for the given client identity.
    pub fn new(
        client_id: impl Into<String>,
        client_version: Version,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_version,
            compatibility_minimal: client_version,
            base_url: base_url.into(),
            batch_size: 20,
            mailbox_capacity: 256,
            realtime_handshake_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the minimum version this build is compatible with.
    pub fn with_compatibility_minimal(mut self, version: Version) -> Self {
        self.compatibility_minimal = version;
        self
    }

    /// Sets the outbound batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the session mailbox capacity.
    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    /// Sets the realtime handshake ceiling.
    pub fn with_realtime_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.realtime_handshake_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            Version::new(0, 0, 0),
            "",
        )
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay unit for exponential backoff.
    pub base: Duration,
    /// Batch retry rounds before the session gives up and reconnects.
    pub max_batch_rounds: u32,
}

impl RetryConfig {
    /// Creates a retry configuration with the given backoff base.
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            max_batch_rounds: 5,
        }
    }

    /// Sets the batch retry round limit.
    pub fn with_max_batch_rounds(mut self, rounds: u32) -> Self {
        self.max_batch_rounds = rounds;
        self
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}
