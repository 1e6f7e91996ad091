use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `DRIP__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: i64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: i64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: i64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntakeConfig {
    #[serde(default = "default_intake_buffer")]
    pub buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// JSON snapshot loaded at startup and written at shutdown.
    #[serde(default)]
    pub snapshot_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_poll_interval_secs() -> u64 {
    60
}
fn default_batch_size() -> usize {
    500
}
fn default_lease_secs() -> i64 {
    300
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base_secs() -> i64 {
    30
}
fn default_backoff_max_secs() -> i64 {
    3600
}
fn default_send_timeout_ms() -> u64 {
    10_000
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_intake_buffer() -> usize {
    1024
}
fn default_lock_timeout_ms() -> u64 {
    2_000
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_batch_size(),
            lease_secs: default_lease_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            buffer: default_intake_buffer(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            snapshot_path: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            host: default_host(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            dispatch: DispatchConfig::default(),
            sweeper: SweeperConfig::default(),
            intake: IntakeConfig::default(),
            store: StoreConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// A delivery makes three external calls (contact lookup, render, send),
    /// each bounded by `send_timeout_ms`. The lease must outlast all three or
    /// the sweeper can release a claim whose send is still in flight.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let lease_ms = self.lease_secs.max(0) as u64 * 1000;
        if lease_ms <= self.send_timeout_ms.saturating_mul(3) {
            return Err(config::ConfigError::Message(format!(
                "dispatch.lease_secs ({}s) must exceed 3 x dispatch.send_timeout_ms ({}ms)",
                self.lease_secs, self.send_timeout_ms
            )));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("DRIP")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.dispatch.validate()?;
        Ok(config)
    }
}
