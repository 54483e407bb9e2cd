//! Per-query pipeline run by dispatch workers.
//!
//! A worker asks the policy service about the queried domain, then either
//! forwards the query upstream or synthesizes a blocked answer, wraps the
//! DNS reply back into an IP packet and writes it to the tunnel.

use hickory_proto::op::Message;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::dns::{Sinkhole, UpstreamResolver};
use crate::error::{Error, NetworkError, Result};
use crate::network::{DnsQueryPacket, PacketBuilder, TunnelDevice};
use crate::policy::{FailureMode, PolicyChecker, PolicyDecision, PolicyError};

/// Outcome of [`QueryHandler::handle_query`].
#[derive(Debug)]
pub struct HandledQuery {
    /// DNS reply to send back to the client.
    pub payload: Vec<u8>,
    pub decision: PolicyDecision,
    /// Set when the decision came from the failure mode instead of the service.
    pub policy_error: Option<PolicyError>,
}

/// DNS query handler that processes queries using the provided dependencies.
pub struct QueryHandler<P, R>
where
    P: PolicyChecker,
    R: UpstreamResolver,
{
    policy: P,
    upstream: R,
    sinkhole: Sinkhole,
    on_error: FailureMode,
}

impl<P, R> QueryHandler<P, R>
where
    P: PolicyChecker,
    R: UpstreamResolver,
{
    pub const fn new(policy: P, upstream: R, sinkhole: Sinkhole, on_error: FailureMode) -> Self {
        Self {
            policy,
            upstream,
            sinkhole,
            on_error,
        }
    }

    /// Decide on a query and produce the DNS reply for it.
    ///
    /// Policy failures never fail the query: the configured failure mode
    /// decides instead and the error is handed back in the result.
    #[instrument(skip(self, query), fields(domain = %query.domain))]
    pub async fn handle_query(&self, query: &DnsQueryPacket) -> Result<HandledQuery> {
        let (decision, policy_error) = match self.policy.check(&query.domain).await {
            Ok(decision) => (decision, None),
            Err(err) => {
                crate::metrics::record_policy_error();
                let decision = self.on_error.decision();
                warn!(error = %err, allowed = decision.allowed, "policy lookup failed, using failure mode");
                (decision, Some(err))
            }
        };

        let payload = if decision.allowed {
            debug!("forwarding to upstream");
            self.upstream.resolve(&query.dns_payload).await?
        } else {
            info!("blocked");
            self.blocked_answer(&query.message)?
        };

        Ok(HandledQuery {
            payload,
            decision,
            policy_error,
        })
    }

    fn blocked_answer(&self, message: &Message) -> Result<Vec<u8>> {
        self.sinkhole.blocked_answer_bytes(message)
    }
}

impl<P, R> Clone for QueryHandler<P, R>
where
    P: PolicyChecker,
    R: UpstreamResolver,
{
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            upstream: self.upstream.clone(),
            sinkhole: self.sinkhole,
            on_error: self.on_error,
        }
    }
}

/// Answer one query end to end and write the reply into the tunnel.
///
/// Returns the policy error, if any, that the answer was produced under.
pub async fn process_query<P, R, D>(
    query: &DnsQueryPacket,
    handler: &QueryHandler<P, R>,
    packet_builder: &PacketBuilder,
    device: &D,
) -> Result<Option<PolicyError>>
where
    P: PolicyChecker,
    R: UpstreamResolver,
    D: TunnelDevice,
{
    let handled = handler.handle_query(query).await?;
    let packet = packet_builder.build_response(query, &handled.payload)?;
    device.send(&packet).await.map_err(NetworkError::Write)?;
    crate::metrics::record_query(handled.decision.allowed);
    Ok(handled.policy_error)
}

/// Worker body: process a query and report network failures to the session.
///
/// Only recoverable errors are reported. A policy error that is not a
/// connectivity failure has already been answered under the failure mode and
/// is not reported. The channel is bounded and a full channel means a
/// reconnect is already pending, so extra reports are dropped.
pub async fn serve_query<P, R, D>(
    query: DnsQueryPacket,
    handler: QueryHandler<P, R>,
    packet_builder: PacketBuilder,
    device: &D,
    failures: mpsc::Sender<Error>,
) where
    P: PolicyChecker,
    R: UpstreamResolver,
    D: TunnelDevice,
{
    let err = match process_query(&query, &handler, &packet_builder, device).await {
        Ok(None) => return,
        Ok(Some(policy_err)) if !policy_err.is_connectivity() => return,
        Ok(Some(policy_err)) => Error::from(policy_err),
        Err(err) => err,
    };

    if err.is_recoverable() {
        warn!(domain = %query.domain, error = %err, "network failure while serving query");
        let _ = failures.try_send(err);
    } else {
        debug!(domain = %query.domain, error = %err, "query dropped");
    }
}
