//! Error types for the dnsgate tunnel core.
//!
//! Errors carry a coarse classification used by the session loop:
//! [`Error::is_recoverable`] tells whether a failure came from the network
//! around the tunnel (and should trigger a reconnect) or from a single
//! query that can simply be dropped.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::policy::PolicyError;

/// Main error type for dnsgate operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("DNS protocol error: {0}")]
    Protocol(#[from] hickory_proto::ProtoError),

    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("metrics error: {0}")]
    Metrics(String),
}

impl Error {
    /// Whether this failure means the tunnel's network path is broken.
    ///
    /// Recoverable failures move the session to `Reconnecting`; everything
    /// else only ends the task that hit it.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Network(err) => err.is_recoverable(),
            Self::Policy(err) => err.is_connectivity(),
            Self::Upstream(err) => err.is_recoverable(),
            Self::Config(_) | Self::Protocol(_) | Self::Io(_) | Self::Metrics(_) => false,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

/// Validation errors for configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("policy.endpoint must start with http:// or https://: {endpoint:?}")]
    InvalidPolicyEndpoint { endpoint: String },

    #[error("policy.timeout_secs must be greater than 0")]
    ZeroPolicyTimeout,

    #[error("upstream.timeout_secs must be greater than 0")]
    ZeroUpstreamTimeout,

    #[error("sinkhole.ttl_secs must be greater than 0")]
    ZeroSinkholeTtl,

    #[error("sinkhole.address must be \"loopback\" or an IPv4 address: {value:?}")]
    InvalidSinkholeAddress { value: String },

    #[error("tunnel.prefix_len must be at most 32, got {prefix_len}")]
    InvalidPrefixLen { prefix_len: u8 },

    #[error("tunnel.mtu must be at least 576, got {mtu}")]
    MtuTooSmall { mtu: u16 },

    #[error("tunnel.dns_server {dns_server} is outside the tunnel network {network}")]
    DnsServerOutsideTunnel { dns_server: String, network: String },

    #[error("dispatch.workers must be greater than 0")]
    ZeroWorkers,

    #[error("reconnect.min_delay_secs must be greater than 0")]
    ZeroMinDelay,

    #[error("reconnect.max_delay_secs ({max}) must not be below min_delay_secs ({min})")]
    MaxDelayBelowMin { min: u64, max: u64 },
}

/// Errors coming from the tunnel device and packet construction.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to establish tunnel: {0}")]
    Establish(#[source] io::Error),

    #[error("failed to read from tunnel: {0}")]
    Read(#[source] io::Error),

    #[error("failed to write to tunnel: {0}")]
    Write(#[source] io::Error),

    #[error("packet construction failed: {0}")]
    PacketConstruction(String),
}

impl NetworkError {
    /// Device failures are recoverable; a packet that cannot be built is not.
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::PacketConstruction(_))
    }
}

/// Errors from forwarding a query to the upstream resolver.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to open forwarding socket: {0}")]
    Bind(#[source] io::Error),

    #[error("failed to protect forwarding socket: {0}")]
    Protect(#[source] io::Error),

    #[error("upstream resolver unreachable: {0}")]
    Unreachable(#[source] io::Error),

    #[error("exchange with upstream resolver failed: {0}")]
    Exchange(#[source] io::Error),

    #[error("upstream resolver did not answer within {0:?}")]
    Timeout(Duration),
}

impl UpstreamError {
    /// Classify an I/O error raised while talking to the upstream resolver.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkDown
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::AddrNotAvailable => Self::Unreachable(err),
            _ => Self::Exchange(err),
        }
    }

    /// A timeout only loses one query, it says nothing about the path.
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Protect(_) | Self::Unreachable(_))
    }
}

/// Why a raw packet read from the tunnel is not a DNS query we handle.
///
/// This is not a failure: the session loop silently drops such packets.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum NotDns {
    #[error("not an IPv4 packet")]
    NotIpv4,

    #[error("malformed IPv4 header")]
    BadHeader,

    #[error("fragmented datagram")]
    Fragmented,

    #[error("transport is not UDP")]
    NotUdp,

    #[error("malformed UDP header")]
    BadUdp,

    #[error("payload is not a DNS message")]
    NotDnsMessage,

    #[error("DNS message has no question")]
    NoQuestion,
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
