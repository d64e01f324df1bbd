//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the telemetry runtime."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::fs;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_pv_prefix() -> String {
    "PLANT1:BUS0".to_owned()
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_fault_probability() -> f64 {
    0.01
}

fn default_resubscribe_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_resubscribe_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_true() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5001))
}

fn default_broadcast_capacity() -> usize {
    1024
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_owned()]
}

/// Primary configuration object for the telemetry daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
///
/// `source` is `None` when no candidate file existed and built-in defaults
/// were used.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "DEAAS_CONFIG";
    pub const ENV_PROVIDER: &str = "TELEMETRY_PROVIDER";
    pub const ENV_PV_PREFIX: &str = "PV_PREFIX";
    pub const ENV_CA_ADDR_LIST: &str = "EPICS_CA_ADDR_LIST";
    pub const ENV_CA_AUTO_ADDR_LIST: &str = "EPICS_CA_AUTO_ADDR_LIST";
    pub const ENV_HOST: &str = "HOST";
    pub const ENV_PORT: &str = "PORT";
    pub const ENV_CORS_ORIGINS: &str = "CORS_ORIGINS";

    /// Load configuration from disk, respecting the `DEAAS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// An explicit `DEAAS_CONFIG` path must exist. Otherwise the first existing
    /// candidate wins, and defaults are used when none exists. Environment
    /// overrides are applied last and the result is validated.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        let mut loaded = Self::locate(candidates)?;
        loaded
            .config
            .apply_overrides_from(|key| std::env::var(key).ok())?;
        loaded.config.validate()?;
        Ok(loaded)
    }

    fn locate<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path.to_path_buf()),
                });
            }
        }

        let inspected = candidates
            .iter()
            .map(|p| p.as_ref().display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        debug!(%inspected, "no configuration file found; using defaults");
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Apply the process-level overrides recognised by the service.
    ///
    /// `lookup` resolves a variable name to its value; the daemon passes the
    /// process environment, tests pass a map.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(provider) = lookup(Self::ENV_PROVIDER) {
            self.telemetry.provider = provider
                .parse()
                .map_err(|err: String| anyhow!("{}: {}", Self::ENV_PROVIDER, err))?;
        }
        if let Some(prefix) = lookup(Self::ENV_PV_PREFIX) {
            if !prefix.trim().is_empty() {
                self.telemetry.pv_prefix = prefix;
            }
        }
        if let Some(addr_list) = lookup(Self::ENV_CA_ADDR_LIST) {
            self.telemetry.live.ca_addr_list = Some(addr_list);
        }
        if let Some(auto) = lookup(Self::ENV_CA_AUTO_ADDR_LIST) {
            self.telemetry.live.ca_auto_addr_list = Some(auto);
        }
        if let Some(host) = lookup(Self::ENV_HOST) {
            self.api.listen.set_ip(resolve_host(&host)?);
        }
        if let Some(port) = lookup(Self::ENV_PORT) {
            let port: u16 = port
                .trim()
                .parse()
                .with_context(|| format!("{}: invalid port {:?}", Self::ENV_PORT, port))?;
            self.api.listen.set_port(port);
        }
        if let Some(origins) = lookup(Self::ENV_CORS_ORIGINS) {
            self.api.cors_origins = split_origins(&origins);
        }
        Ok(())
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.telemetry.validate()?;
        self.api.validate()
    }

    /// Validate for a long-running daemon, which can only be fed by an
    /// external link.
    pub fn validate_for_daemon(&self) -> Result<()> {
        self.validate()?;
        self.telemetry.validate_for_daemon()
    }

    /// Render the configuration back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render configuration as toml")
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Telemetry backend selected once at process start.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Mock,
    Live,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Mock => "mock",
            ProviderKind::Live => "live",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mock" => Ok(ProviderKind::Mock),
            // `epics` is the historical name of the live backend.
            "live" | "epics" => Ok(ProviderKind::Live),
            other => Err(format!("unknown telemetry provider: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default = "default_pv_prefix")]
    pub pv_prefix: String,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub live: LiveConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            pv_prefix: default_pv_prefix(),
            simulation: SimulationConfig::default(),
            live: LiveConfig::default(),
        }
    }
}

impl TelemetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pv_prefix.trim_end_matches(':').trim().is_empty() {
            return Err(anyhow!("telemetry.pv_prefix must not be empty"));
        }
        self.simulation.validate()?;
        self.live.resubscribe.validate()?;
        Ok(())
    }

    /// The loopback link is in-process; a daemon built on it has no writer
    /// and every live value would stay unknown.
    pub fn validate_for_daemon(&self) -> Result<()> {
        if self.provider == ProviderKind::Live && self.live.link == LinkKind::Loopback {
            return Err(anyhow!(
                "telemetry.live.link = \"loopback\" has no external writer; use \"channel-access\" for the daemon"
            ));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(rename = "tick_interval_ms", default = "default_tick_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub tick_interval: Duration,
    #[serde(default = "default_fault_probability")]
    pub fault_probability: f64,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            fault_probability: default_fault_probability(),
            seed: None,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(anyhow!("telemetry.simulation.tick_interval_ms must be positive"));
        }
        if !(0.0..=1.0).contains(&self.fault_probability) {
            return Err(anyhow!(
                "telemetry.simulation.fault_probability must be within [0, 1], got {}",
                self.fault_probability
            ));
        }
        Ok(())
    }
}

/// Hardware link backing the live provider.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LinkKind {
    Loopback,
    #[default]
    ChannelAccess,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default)]
    pub link: LinkKind,
    #[serde(default)]
    pub ca_addr_list: Option<String>,
    #[serde(default)]
    pub ca_auto_addr_list: Option<String>,
    #[serde(default)]
    pub resubscribe: ResubscribeConfig,
}

/// Background retry of subscriptions that failed to establish.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResubscribeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "base_delay_ms", default = "default_resubscribe_base_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", default = "default_resubscribe_max_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
}

impl Default for ResubscribeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay: default_resubscribe_base_delay(),
            max_delay: default_resubscribe_max_delay(),
        }
    }
}

impl ResubscribeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_delay.is_zero() {
            return Err(anyhow!("telemetry.live.resubscribe.base_delay_ms must be positive"));
        }
        if self.max_delay < self.base_delay {
            return Err(anyhow!(
                "telemetry.live.resubscribe.max_delay_ms must not be below base_delay_ms"
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    #[serde(default = "default_true")]
    pub file_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            file_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    /// Browser origins allowed to call the API. `"*"` allows any origin.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_api_listen(),
            broadcast_capacity: default_broadcast_capacity(),
            cors_origins: default_cors_origins(),
        }
    }
}

impl ApiConfig {
    pub fn validate(&self) -> Result<()> {
        if self.broadcast_capacity == 0 {
            return Err(anyhow!("api.broadcast_capacity must be greater than zero"));
        }
        if self.cors_origins.iter().any(|o| o == "*") && self.cors_origins.len() > 1 {
            return Err(anyhow!("api.cors_origins cannot mix \"*\" with explicit origins"));
        }
        Ok(())
    }

    pub fn allows_any_origin(&self) -> bool {
        self.cors_origins.iter().any(|o| o == "*")
    }
}

fn resolve_host(host: &str) -> Result<IpAddr> {
    let host = host.trim();
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    (host, 0)
        .to_socket_addrs()
        .with_context(|| format!("{}: cannot resolve {:?}", AppConfig::ENV_HOST, host))?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| anyhow!("{}: {:?} resolved to no address", AppConfig::ENV_HOST, host))
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_owned)
        .collect()
}
