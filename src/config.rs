//! Router configuration model.
//!
//! The core consumes a materialised [`Configuration`] value. Two file
//! formats produce one: the native TOML format and an equivalent JSON
//! format that accepts both snake_case and camelCase key spellings.
//! Unknown keys are ignored; invalid structure is rejected.
//!
//! # Example
//! ```toml
//! [general]
//! tcp_server_port = 5760
//! deduplication_period_ms = 100
//! sniffer_sysid = 254
//!
//! [[udp_endpoints]]
//! name = "gcs"
//! address = "0.0.0.0"
//! port = 14550
//! mode = "server"
//!
//! [[uart_endpoints]]
//! name = "fc"
//! device = "/dev/ttyACM0"
//! baudrates = [57600, 115200]
//! ```

use crate::error::{Result, RouterError};
use crate::filter::EndpointFilters;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Full router configuration: general settings plus endpoint lists.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Configuration {
    /// General router settings.
    pub general: GeneralConfig,
    /// Flight-log settings.
    pub log: LogConfig,
    /// Statistics reporting settings.
    pub statistics: StatisticsConfig,
    /// UART endpoints.
    #[serde(alias = "uartEndpoints", skip_serializing_if = "Vec::is_empty")]
    pub uart_endpoints: Vec<UartEndpointConfig>,
    /// UDP endpoints.
    #[serde(alias = "udpEndpoints", skip_serializing_if = "Vec::is_empty")]
    pub udp_endpoints: Vec<UdpEndpointConfig>,
    /// TCP client endpoints.
    #[serde(alias = "tcpEndpoints", skip_serializing_if = "Vec::is_empty")]
    pub tcp_endpoints: Vec<TcpEndpointConfig>,
}

/// `[general]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Port of the router-owned TCP listening server, if any.
    #[serde(alias = "tcpServerPort")]
    pub tcp_server_port: Option<u16>,
    /// Enables the periodic statistics report.
    #[serde(alias = "reportStats")]
    pub report_stats: bool,
    /// Log verbosity of the process.
    #[serde(alias = "debugLogLevel")]
    pub debug_log_level: LogLevel,
    /// Sliding dedup window in milliseconds; 0 disables deduplication.
    #[serde(alias = "deduplicationPeriodMs", alias = "deduplication_period")]
    pub deduplication_period_ms: u64,
    /// System id whose endpoints receive all traffic regardless of routing.
    #[serde(alias = "snifferSysid")]
    pub sniffer_sysid: Option<u8>,
    /// Directory holding persisted extension configurations.
    #[serde(alias = "extensionConfDir")]
    pub extension_conf_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            tcp_server_port: None,
            report_stats: false,
            debug_log_level: LogLevel::Info,
            deduplication_period_ms: 0,
            sniffer_sysid: None,
            extension_conf_dir: None,
        }
    }
}

/// `[log]` section: the flight-log endpoint.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directory for `.tlog` files; unset disables the log endpoint.
    #[serde(alias = "logDir")]
    pub dir: Option<PathBuf>,
    /// Whether the log endpoint is armed at startup.
    #[serde(alias = "logTelemetry")]
    pub telemetry: bool,
}

/// `[statistics]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatisticsConfig {
    /// Seconds between endpoint summaries in the log.
    #[serde(alias = "reportIntervalSecs")]
    pub report_interval_secs: u64,
    /// Optional JSON snapshot file, rewritten on each cadence tick.
    #[serde(alias = "jsonOutputPath")]
    pub json_output_path: Option<PathBuf>,
    /// Seconds between JSON snapshot writes.
    #[serde(alias = "jsonIntervalSecs")]
    pub json_interval_secs: u64,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 30,
            json_output_path: None,
            json_interval_secs: 10,
        }
    }
}

/// Process log verbosity, `error` through `trace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[serde(alias = "warn")]
    Warning,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// The equivalent tracing filter directive.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(RouterError::config(format!("unknown log level '{other}'"))),
        }
    }
}

fn default_baudrates() -> Vec<u32> {
    vec![57600]
}

fn default_retry_timeout_ms() -> u64 {
    5000
}

/// One UART endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UartEndpointConfig {
    /// Endpoint name, used in logs and as an extension-point key.
    pub name: String,
    /// Serial device path.
    pub device: String,
    /// Candidate baudrates for the auto-baud scan, tried in order.
    #[serde(
        default = "default_baudrates",
        alias = "baud",
        alias = "baudRates"
    )]
    pub baudrates: Vec<u32>,
    /// Enables RTS/CTS hardware flow control.
    #[serde(default, alias = "flowControl", alias = "flowcontrol")]
    pub flow_control: bool,
    /// Optional group tag shared with other endpoints.
    #[serde(default)]
    pub group: Option<String>,
    /// Allow/block filters.
    #[serde(flatten)]
    pub filters: EndpointFilters,
}

/// Operating mode of a UDP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UdpMode {
    /// Fixed peer; writes go to the configured address.
    #[serde(alias = "Client", alias = "normal")]
    Client,
    /// Bound locally; the peer is learned from inbound datagrams.
    #[serde(alias = "Server")]
    Server,
}

/// One UDP endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UdpEndpointConfig {
    /// Endpoint name.
    pub name: String,
    /// Peer address (client) or bind address (server).
    pub address: String,
    /// Peer or bind port.
    pub port: u16,
    /// Client or server mode.
    #[serde(default = "UdpEndpointConfig::default_mode")]
    pub mode: UdpMode,
    /// Optional group tag.
    #[serde(default)]
    pub group: Option<String>,
    /// Allow/block filters.
    #[serde(flatten)]
    pub filters: EndpointFilters,
}

impl UdpEndpointConfig {
    fn default_mode() -> UdpMode {
        UdpMode::Server
    }

    /// `address:port` form.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// One outbound TCP endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcpEndpointConfig {
    /// Endpoint name.
    pub name: String,
    /// Peer address.
    pub address: String,
    /// Peer port.
    pub port: u16,
    /// Reconnect interval in milliseconds; 0 means a failed connection is
    /// final and the router prunes the endpoint.
    #[serde(
        default = "default_retry_timeout_ms",
        alias = "retry_timeout",
        alias = "retryTimeout",
        alias = "retryTimeoutMs"
    )]
    pub retry_timeout_ms: u64,
    /// Optional group tag.
    #[serde(default)]
    pub group: Option<String>,
    /// Allow/block filters.
    #[serde(flatten)]
    pub filters: EndpointFilters,
}

impl TcpEndpointConfig {
    /// `address:port` form.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

// MAVLink message ids are 24-bit on the wire
const MAX_MSG_ID: u32 = 0xFF_FFFF;

impl Configuration {
    /// Parses the native TOML format.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Configuration = toml::from_str(content)
            .map_err(|e| RouterError::config(format!("failed to parse TOML config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Parses the JSON format (camelCase and snake_case keys accepted).
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Configuration = serde_json::from_str(content)
            .map_err(|e| RouterError::config(format!("failed to parse JSON config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and parses a TOML config file.
    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RouterError::filesystem(path.display().to_string(), e))?;
        Self::from_toml_str(&content)
    }

    /// Loads and parses a JSON config file.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RouterError::filesystem(path.display().to_string(), e))?;
        Self::from_json_str(&content)
    }

    /// Looks up a UDP endpoint by name (extension-point assignment).
    pub fn find_udp(&self, name: &str) -> Option<&UdpEndpointConfig> {
        self.udp_endpoints.iter().find(|ep| ep.name == name)
    }

    /// Looks up a TCP endpoint by name.
    pub fn find_tcp(&self, name: &str) -> Option<&TcpEndpointConfig> {
        self.tcp_endpoints.iter().find(|ep| ep.name == name)
    }

    /// Checks addresses, ports, baudrates, filter ids and duplicate binds.
    pub fn validate(&self) -> Result<()> {
        let mut bound_ports = HashSet::new();
        if let Some(port) = self.general.tcp_server_port {
            if port == 0 {
                return Err(RouterError::config("tcp_server_port must be non-zero"));
            }
            bound_ports.insert(port);
        }

        for ep in &self.uart_endpoints {
            if ep.name.is_empty() {
                return Err(RouterError::config("UART endpoint without a name"));
            }
            if ep.device.is_empty() {
                return Err(RouterError::config(format!(
                    "UART endpoint '{}' without a device",
                    ep.name
                )));
            }
            if ep.baudrates.is_empty() {
                return Err(RouterError::config(format!(
                    "UART endpoint '{}' needs at least one baudrate",
                    ep.name
                )));
            }
            for &baud in &ep.baudrates {
                if !(300..=4_000_000).contains(&baud) {
                    return Err(RouterError::config(format!(
                        "UART endpoint '{}': baudrate {} out of range (300-4000000)",
                        ep.name, baud
                    )));
                }
            }
            check_filters(&ep.name, &ep.filters)?;
        }

        for ep in &self.udp_endpoints {
            if ep.name.is_empty() {
                return Err(RouterError::config("UDP endpoint without a name"));
            }
            if ep.address.is_empty() || ep.port == 0 {
                return Err(RouterError::config(format!(
                    "UDP endpoint '{}' needs an address and a non-zero port",
                    ep.name
                )));
            }
            // A server binds the port locally; two servers cannot share it
            if ep.mode == UdpMode::Server && !bound_ports.insert(ep.port) {
                return Err(RouterError::config(format!(
                    "UDP endpoint '{}': port {} already bound",
                    ep.name, ep.port
                )));
            }
            check_filters(&ep.name, &ep.filters)?;
        }

        for ep in &self.tcp_endpoints {
            if ep.name.is_empty() {
                return Err(RouterError::config("TCP endpoint without a name"));
            }
            if ep.address.is_empty() || ep.port == 0 {
                return Err(RouterError::config(format!(
                    "TCP endpoint '{}' needs an address and a non-zero port",
                    ep.name
                )));
            }
            check_filters(&ep.name, &ep.filters)?;
        }

        Ok(())
    }
}

fn check_filters(name: &str, filters: &EndpointFilters) -> Result<()> {
    for set in [
        &filters.allow_msg_id_in,
        &filters.block_msg_id_in,
        &filters.allow_msg_id_out,
        &filters.block_msg_id_out,
    ] {
        for &msg_id in set {
            if msg_id > MAX_MSG_ID {
                return Err(RouterError::config(format!(
                    "endpoint '{name}': msg_id {msg_id} exceeds 24-bit range"
                )));
            }
        }
    }
    Ok(())
}
