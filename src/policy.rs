//! Remote policy client.
//!
//! Every intercepted query is checked against the policy service with a
//! single JSON request. Decisions are never cached.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// User-Agent header value for HTTP requests.
const USER_AGENT: &str = concat!("dnsgate/", env!("CARGO_PKG_VERSION"));

/// Outcome of a policy lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allowed: bool,
}

impl PolicyDecision {
    pub const ALLOW: Self = Self { allowed: true };
    pub const BLOCK: Self = Self { allowed: false };
}

/// What to answer when the policy service could not be asked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Resolve the query normally.
    #[default]
    Allow,
    /// Answer with the sinkhole.
    Block,
}

impl FailureMode {
    pub const fn decision(self) -> PolicyDecision {
        match self {
            Self::Allow => PolicyDecision::ALLOW,
            Self::Block => PolicyDecision::BLOCK,
        }
    }
}

/// Error type for policy lookups.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The service could not be connected to.
    #[error("policy service unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),

    #[error("policy request timed out")]
    Timeout,

    /// HTTP request failed with a non-success status code.
    #[error("policy service answered with status {status}")]
    Status { status: u16 },

    #[error("malformed policy response: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("policy request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// Failed to create HTTP client.
    #[error("failed to create HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

impl PolicyError {
    /// Whether the failure says the network path to the service is down.
    pub const fn is_connectivity(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout)
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Unreachable(err)
        } else {
            Self::Request(err)
        }
    }
}

/// Trait for allow/deny lookups.
pub trait PolicyChecker: Send + Sync + Clone + 'static {
    fn check(
        &self,
        domain: &str,
    ) -> impl Future<Output = Result<PolicyDecision, PolicyError>> + Send;
}

#[derive(Serialize)]
struct PolicyRequest<'a> {
    uid: &'a str,
    domain: &'a str,
}

#[derive(Deserialize)]
struct PolicyResponse {
    allow: bool,
}

/// Policy client speaking JSON over HTTP.
///
/// Cloning is cheap: clones share the connection pool.
#[derive(Clone)]
pub struct HttpPolicyClient {
    client: Client,
    endpoint: Arc<str>,
    client_id: Arc<str>,
}

impl HttpPolicyClient {
    /// Create a client bound to `endpoint` and `client_id`.
    ///
    /// When `bypass_interface` is set, connections are pinned to that
    /// interface so lookups do not travel through the tunnel.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(
        endpoint: &str,
        client_id: &str,
        timeout: Duration,
        bypass_interface: Option<&str>,
    ) -> Result<Self, PolicyError> {
        let builder = Client::builder().timeout(timeout).user_agent(USER_AGENT);
        let builder = with_interface(builder, bypass_interface);
        let client = builder.build().map_err(PolicyError::ClientBuild)?;

        Ok(Self {
            client,
            endpoint: Arc::from(endpoint),
            client_id: Arc::from(client_id),
        })
    }
}

impl PolicyChecker for HttpPolicyClient {
    async fn check(&self, domain: &str) -> Result<PolicyDecision, PolicyError> {
        let request = PolicyRequest {
            uid: &self.client_id,
            domain,
        };
        let response = self
            .client
            .post(&*self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(PolicyError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(PolicyError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(PolicyError::from_reqwest)?;
        let parsed: PolicyResponse = serde_json::from_slice(&body).map_err(PolicyError::Malformed)?;
        debug!(domain, allowed = parsed.allow, "policy decision");

        Ok(PolicyDecision {
            allowed: parsed.allow,
        })
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
fn with_interface(
    builder: reqwest::ClientBuilder,
    interface: Option<&str>,
) -> reqwest::ClientBuilder {
    match interface {
        Some(interface) => builder.interface(interface),
        None => builder,
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "fuchsia")))]
fn with_interface(
    builder: reqwest::ClientBuilder,
    interface: Option<&str>,
) -> reqwest::ClientBuilder {
    if let Some(interface) = interface {
        tracing::warn!(interface, "cannot pin policy requests to an interface on this platform");
    }
    builder
}
