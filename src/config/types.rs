use serde::{Deserialize, Serialize};

/// Root configuration for relayd.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listeners accept incoming connections
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,

    /// Global settings
    #[serde(default)]
    pub settings: Settings,

    /// Telemetry configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Number of worker threads (0 = number of CPUs)
    #[serde(default)]
    pub workers: usize,

    /// Process-wide cap on accepted connections
    #[serde(default)]
    pub max_connections: Option<u64>,

    /// How long shutdown waits for connections to drain
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 0,
            max_connections: None,
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON logs
    #[serde(default)]
    pub json_logs: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

/// Transport a listener accepts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListenerProtocol {
    #[default]
    Tcp,
    Udp,
    /// In-process listener; `address` is the internal listener id.
    Internal,
}

/// One listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Listener name (for logging/metrics)
    pub name: String,

    /// Bind address, or the internal listener id for internal listeners
    pub address: String,

    #[serde(default)]
    pub protocol: ListenerProtocol,

    /// Pre-connection filters, run in order on every accepted socket
    #[serde(default)]
    pub listener_filters: Vec<ListenerFilterConfig>,

    /// Filter chains; the first match by destination port / server name wins
    #[serde(default)]
    pub filter_chains: Vec<FilterChainConfig>,

    /// Listener filter timeout in milliseconds (0 disables the timer)
    #[serde(default = "default_listener_filters_timeout_ms")]
    pub listener_filters_timeout_ms: u64,

    /// On timeout, skip the stuck filter instead of closing the socket
    #[serde(default)]
    pub continue_on_listener_filters_timeout: bool,

    /// Per-listener cap on accepted connections
    #[serde(default)]
    pub max_connections: Option<u64>,

    /// Cross-worker connection balancing
    #[serde(default)]
    pub balance: BalanceKind,

    /// Mark restored-destination sockets for hand-off
    #[serde(default)]
    pub hand_off_restored_destinations: bool,
}

fn default_listener_filters_timeout_ms() -> u64 {
    15_000
}

/// Cross-worker balancing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalanceKind {
    #[default]
    None,
    /// Route each accept to the least-loaded worker.
    Exact,
}

/// A configured listener filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ListenerFilterConfig {
    ProxyProtocol,
    ServerName,
    InternalHandoff { target: String },
}

/// A configured filter chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterChainConfig {
    pub name: String,

    #[serde(default, rename = "match")]
    pub match_: FilterChainMatchConfig,

    /// Network filters applied to the connection's byte stream
    #[serde(default)]
    pub filters: Vec<NetworkFilterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FilterChainMatchConfig {
    #[serde(default)]
    pub destination_port: Option<u16>,

    #[serde(default)]
    pub server_names: Vec<String>,
}

/// A configured network filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkFilterConfig {
    Echo,
    Blackhole,
}
