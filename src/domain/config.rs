use serde::{Deserialize, Serialize};

/// Backend collaborator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the conversation backend.
    pub base_url: String,
    /// Hosts the HTTP client is allowed to reach.
    /// The host of `base_url` is always allowed.
    pub allowed_hosts: Vec<String>,
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".to_string(),
            allowed_hosts: vec!["127.0.0.1".to_string(), "localhost".to_string()],
            request_timeout_ms: 15_000,
        }
    }
}

impl BackendConfig {
    /// Allow-list including the host of `base_url`.
    pub fn effective_allowed_hosts(&self) -> Vec<String> {
        let mut hosts = self.allowed_hosts.clone();
        if let Some(host) = url::Url::parse(&self.base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
        {
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        hosts
    }
}

/// Realtime transport connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Connect attempts before giving up.
    pub max_attempts: u32,
    /// Linear backoff step: attempt `n` waits `n * backoff_ms`.
    pub backoff_ms: u64,
    /// Delay after transport teardown before finalizing the session.
    pub drain_ms: u64,
    /// Delay before an automatic connect once a session is ready.
    pub autostart_delay_ms: u64,
    /// Automatic connect attempts.
    pub autostart_attempts: u32,
    /// Voice requested for the counterpart.
    pub voice: String,
    /// Recognition language (BCP-47).
    pub language: String,
    /// Preferred microphone by name; the system default when unset or missing.
    pub input_device: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1_000,
            drain_ms: 2_000,
            autostart_delay_ms: 300,
            autostart_attempts: 2,
            voice: "alloy".to_string(),
            language: "en".to_string(),
            input_device: None,
        }
    }
}

/// Transcript reconciliation windows.
///
/// These are empirical and expected to be tuned against real usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptConfig {
    /// Window in which a repeated final for the same role is dropped.
    pub final_dedup_window_ms: u64,
    /// Window in which a voice final echoing typed text is dropped.
    pub typed_echo_window_ms: u64,
    /// Window in which a voice fragment folds into a same-role text turn.
    pub cross_channel_fold_ms: u64,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            final_dedup_window_ms: 4_000,
            typed_echo_window_ms: 3_000,
            cross_channel_fold_ms: 2_000,
        }
    }
}

/// Persistence relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Lifetime of a persistence failure notice.
    pub notice_ttl_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            notice_ttl_ms: 5_000,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Enable file logging with rotation.
    pub file_logging: bool,
    /// Maximum number of log files to keep.
    pub max_files: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_logging: true,
            max_files: 7,
        }
    }
}

/// Main configuration of the conversation core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CoreConfig {
    pub backend: BackendConfig,
    pub connection: ConnectionConfig,
    pub transcript: TranscriptConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
}

impl CoreConfig {
    /// Create a new CoreConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }
}
