//! Configuration loading and validation.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::dns::SinkholeAddress;
use crate::error::{ConfigError, Result, ValidationError};
use crate::network::TunnelParams;
use crate::policy::FailureMode;

/// Main configuration for the dnsgate tunnel.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Identifier sent to the policy service with every lookup.
    #[serde(default)]
    pub client_id: String,

    /// Upstream DNS resolver, "1.1.1.1" or "1.1.1.1:53". Port defaults to 53.
    #[serde(
        default = "default_upstream_resolver",
        deserialize_with = "deserialize_resolver_addr"
    )]
    pub upstream_resolver: SocketAddr,

    #[serde(default)]
    pub policy: PolicySettings,

    #[serde(default)]
    pub upstream: UpstreamSettings,

    #[serde(default)]
    pub sinkhole: SinkholeSettings,

    #[serde(default)]
    pub tunnel: TunnelSettings,

    #[serde(default)]
    pub dispatch: DispatchSettings,

    #[serde(default)]
    pub reconnect: ReconnectSettings,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Remote policy service settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySettings {
    /// URL the allow/deny request is POSTed to.
    #[serde(default = "default_policy_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_policy_timeout")]
    pub timeout_secs: u64,

    /// What to answer when the policy service cannot be asked.
    #[serde(default)]
    pub on_error: FailureMode,
}

impl PolicySettings {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            endpoint: default_policy_endpoint(),
            timeout_secs: default_policy_timeout(),
            on_error: FailureMode::default(),
        }
    }
}

/// Upstream resolver exchange settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamSettings {
    /// Bound on the wait for the resolver's reply.
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

impl UpstreamSettings {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_upstream_timeout(),
        }
    }
}

/// Answer synthesized for blocked domains.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkholeSettings {
    /// `"loopback"` or an IPv4 literal.
    #[serde(default, deserialize_with = "deserialize_sinkhole_address")]
    pub address: SinkholeAddress,

    #[serde(default = "default_sinkhole_ttl")]
    pub ttl_secs: u32,
}

impl Default for SinkholeSettings {
    fn default() -> Self {
        Self {
            address: SinkholeAddress::default(),
            ttl_secs: default_sinkhole_ttl(),
        }
    }
}

/// Virtual interface parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelSettings {
    /// Interface name. If None, the OS picks one.
    pub name: Option<String>,

    #[serde(default = "default_tunnel_address")]
    pub address: Ipv4Addr,

    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,

    /// DNS server advertised inside the tunnel; queries to it are intercepted.
    #[serde(default = "default_dns_server")]
    pub dns_server: Ipv4Addr,

    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Physical interface that protected sockets are bound to.
    pub bypass_interface: Option<String>,
}

impl TunnelSettings {
    /// Parameters handed to the tunnel provider when establishing.
    pub fn params(&self) -> TunnelParams {
        TunnelParams {
            name: self.name.clone(),
            address: self.address,
            prefix_len: self.prefix_len,
            dns_server: self.dns_server,
            mtu: self.mtu,
            bypass_interface: self.bypass_interface.clone(),
        }
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            name: None,
            address: default_tunnel_address(),
            prefix_len: default_prefix_len(),
            dns_server: default_dns_server(),
            mtu: default_mtu(),
            bypass_interface: None,
        }
    }
}

/// Dispatch pool sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

/// Reconnect backoff bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectSettings {
    #[serde(default = "default_min_delay")]
    pub min_delay_secs: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

impl ReconnectSettings {
    pub const fn min_delay(&self) -> Duration {
        Duration::from_secs(self.min_delay_secs)
    }

    pub const fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            min_delay_secs: default_min_delay(),
            max_delay_secs: default_max_delay(),
        }
    }
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

const DNS_PORT: u16 = 53;

fn default_upstream_resolver() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), DNS_PORT)
}

fn default_policy_endpoint() -> String {
    "http://172.17.0.1:7860/check".to_owned()
}

const fn default_policy_timeout() -> u64 {
    10
}

const fn default_upstream_timeout() -> u64 {
    5
}

const fn default_sinkhole_ttl() -> u32 {
    10
}

const fn default_tunnel_address() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 50, 1)
}

const fn default_prefix_len() -> u8 {
    24
}

const fn default_dns_server() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 50, 5)
}

const fn default_mtu() -> u16 {
    1500
}

const fn default_workers() -> usize {
    32
}

const fn default_min_delay() -> u64 {
    5
}

const fn default_max_delay() -> u64 {
    120
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn deserialize_resolver_addr<'de, D>(deserializer: D) -> std::result::Result<SocketAddr, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .map_err(serde::de::Error::custom)
}

fn deserialize_sinkhole_address<'de, D>(
    deserializer: D,
) -> std::result::Result<SinkholeAddress, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    fn validate(&self) -> std::result::Result<(), ValidationError> {
        let endpoint = self.policy.endpoint.as_str();
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ValidationError::InvalidPolicyEndpoint {
                endpoint: endpoint.to_owned(),
            });
        }
        if self.policy.timeout_secs == 0 {
            return Err(ValidationError::ZeroPolicyTimeout);
        }
        if self.upstream.timeout_secs == 0 {
            return Err(ValidationError::ZeroUpstreamTimeout);
        }
        if self.sinkhole.ttl_secs == 0 {
            return Err(ValidationError::ZeroSinkholeTtl);
        }

        let tunnel = &self.tunnel;
        if tunnel.prefix_len > 32 {
            return Err(ValidationError::InvalidPrefixLen {
                prefix_len: tunnel.prefix_len,
            });
        }
        if tunnel.mtu < 576 {
            return Err(ValidationError::MtuTooSmall { mtu: tunnel.mtu });
        }
        let params = tunnel.params();
        if !params.contains(tunnel.dns_server) {
            let (network, prefix_len) = params.route();
            return Err(ValidationError::DnsServerOutsideTunnel {
                dns_server: tunnel.dns_server.to_string(),
                network: format!("{network}/{prefix_len}"),
            });
        }

        if self.dispatch.workers == 0 {
            return Err(ValidationError::ZeroWorkers);
        }
        if self.reconnect.min_delay_secs == 0 {
            return Err(ValidationError::ZeroMinDelay);
        }
        if self.reconnect.max_delay_secs < self.reconnect.min_delay_secs {
            return Err(ValidationError::MaxDelayBelowMin {
                min: self.reconnect.min_delay_secs,
                max: self.reconnect.max_delay_secs,
            });
        }

        Ok(())
    }
}

/// Where a session reads its configuration from when it (re)starts.
pub trait ConfigSource: Send + Sync + 'static {
    fn load(&self) -> Result<Config>;
}

impl ConfigSource for Config {
    fn load(&self) -> Result<Config> {
        Ok(self.clone())
    }
}

/// A TOML file re-read at every session start.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for ConfigFile {
    fn load(&self) -> Result<Config> {
        Config::load(&self.path)
    }
}
