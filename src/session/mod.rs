//! Tunnel session loop.
//!
//! A session owns the tunnel device for its lifetime. It reads packets one
//! at a time, hands DNS queries to the dispatch pool and keeps the tunnel
//! up: any failure of the device or of the network around it tears the
//! attempt down and starts a new one after an exponential backoff delay.
//!
//! ```text
//! Stopped -> Starting -> Running -> Reconnecting -> Starting -> ...
//!                 \          \            \
//!                  +----------+------------+--> Stopping -> Stopped
//! ```

mod backoff;
mod pool;
mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub use backoff::Backoff;
pub use pool::DispatchPool;
pub use state::SessionState;

use crate::config::{Config, ConfigSource, ReconnectSettings};
use crate::dns::{Sinkhole, UdpUpstream, UpstreamResolver};
use crate::error::{Error, NetworkError, Result};
use crate::handler::{QueryHandler, serve_query};
use crate::network::{BufferPool, PacketBuilder, TunnelDevice, TunnelProvider, parse_query};
use crate::policy::{HttpPolicyClient, PolicyChecker};

/// Size of the buffer packets are read into.
pub const READ_BUFFER_SIZE: usize = 32_767;

/// How long [`SessionHandle::stop`] waits for the loop to finish.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// A tunnel session, ready to run.
pub struct TunnelSession<T, C> {
    provider: T,
    source: C,
    reconnect: ReconnectSettings,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
}

impl<T, C> TunnelSession<T, C>
where
    T: TunnelProvider,
    C: ConfigSource,
{
    pub fn new(provider: T, source: C) -> Self {
        let (state, _) = watch::channel(SessionState::Stopped);
        Self {
            provider,
            source,
            reconnect: ReconnectSettings::default(),
            state,
            cancel: CancellationToken::new(),
        }
    }

    /// Override the reconnect backoff bounds.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectSettings) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Token that stops the session when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the session on a new task.
    pub fn spawn(self) -> SessionHandle {
        let state = self.subscribe();
        let cancel = self.cancellation_token();
        let task = tokio::spawn(self.run());
        SessionHandle {
            state,
            cancel,
            task,
        }
    }

    /// Run until cancelled, reconnecting on failure.
    pub async fn run(self) {
        let mut backoff = Backoff::from(&self.reconnect);

        loop {
            self.publish(SessionState::Starting);
            let err = match self.attempt().await {
                Ok(()) => break,
                Err(err) => err,
            };
            if self.cancel.is_cancelled() {
                break;
            }

            if err.is_recoverable() {
                warn!(error = %err, "tunnel session failed");
            } else {
                error!(error = %err, "tunnel session failed");
            }
            crate::metrics::record_reconnect();
            self.publish(SessionState::Reconnecting);

            let delay = backoff.next_delay();
            info!(delay_secs = delay.as_secs(), "reconnecting");
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.publish(SessionState::Stopping);
        self.publish(SessionState::Stopped);
        info!("tunnel session stopped");
    }

    /// One establish-and-serve cycle. `Ok` means the session was cancelled.
    async fn attempt(&self) -> Result<()> {
        let config = self.source.load()?;
        let params = config.tunnel.params();

        let device = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(()),
            device = self.provider.establish(&params) => {
                Arc::new(device.map_err(NetworkError::Establish)?)
            }
        };

        let policy = HttpPolicyClient::new(
            &config.policy.endpoint,
            &config.client_id,
            config.policy.timeout(),
            params.bypass_interface.as_deref(),
        )?;
        let upstream = UdpUpstream::new(
            config.upstream_resolver,
            config.upstream.timeout(),
            Arc::clone(&device),
        );
        let handler = QueryHandler::new(
            policy,
            upstream,
            Sinkhole::new(config.sinkhole.address, config.sinkhole.ttl_secs),
            config.policy.on_error,
        );
        let mut pool = DispatchPool::new(config.dispatch.workers);

        let result = self.serve(&config, &device, &handler, &mut pool).await;
        pool.shutdown_now();
        result
    }

    async fn serve<D, P, R>(
        &self,
        config: &Config,
        device: &Arc<D>,
        handler: &QueryHandler<P, R>,
        pool: &mut DispatchPool,
    ) -> Result<()>
    where
        D: TunnelDevice,
        P: PolicyChecker,
        R: UpstreamResolver,
    {
        let (failures_tx, mut failures_rx) = mpsc::channel::<Error>(1);
        let packet_builder = PacketBuilder::new(BufferPool::new(pool.capacity()));
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        self.publish(SessionState::Running);
        info!(
            upstream = %config.upstream_resolver,
            policy = %config.policy.endpoint,
            workers = pool.capacity(),
            "tunnel session running"
        );

        loop {
            let len = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    self.publish(SessionState::Stopping);
                    return Ok(());
                }
                Some(err) = failures_rx.recv() => return Err(err),
                read = device.recv(&mut buffer) => read.map_err(NetworkError::Read)?,
            };

            if len == 0 {
                warn!("read an empty packet from the tunnel");
                continue;
            }

            let query = match parse_query(&buffer[..len]) {
                Ok(query) => query,
                Err(reason) => {
                    trace!(%reason, len, "ignoring packet");
                    continue;
                }
            };
            trace!(domain = %query.domain, "intercepted query");

            let handler = handler.clone();
            let packet_builder = packet_builder.clone();
            let device = Arc::clone(device);
            let failures = failures_tx.clone();
            let accepted = pool.try_submit(async move {
                serve_query(query, handler, packet_builder, &*device, failures).await;
            });
            if !accepted {
                debug!(active = pool.active(), "dispatch pool saturated, dropping query");
                crate::metrics::record_dispatch_rejected();
            }
        }
    }

    fn publish(&self, state: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = %current, to = %state, "session state");
            *current = state;
            true
        });
    }
}

/// Handle to a session running on its own task.
pub struct SessionHandle {
    state: watch::Receiver<SessionState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Cancel the session and wait up to [`STOP_TIMEOUT`] for it to end.
    pub async fn stop(self) {
        self.cancel.cancel();
        match tokio::time::timeout(STOP_TIMEOUT, self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("session task failed: {err}"),
            Err(_) => warn!(
                "session did not stop within {} seconds",
                STOP_TIMEOUT.as_secs()
            ),
        }
    }

    /// Wait for the session to end on its own.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            error!("session task failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::TunnelParams;
    use crate::network::device::tests::MemoryDevice;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider whose establish always fails.
    #[derive(Clone, Default)]
    struct FailingProvider {
        attempts: Arc<AtomicUsize>,
    }

    impl TunnelProvider for FailingProvider {
        type Device = MemoryDevice;

        async fn establish(&self, _params: &TunnelParams) -> io::Result<MemoryDevice> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        }
    }

    /// Provider whose establish never completes.
    struct HangingProvider;

    impl TunnelProvider for HangingProvider {
        type Device = MemoryDevice;

        async fn establish(&self, _params: &TunnelParams) -> io::Result<MemoryDevice> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn should_start_stopped_and_end_stopped() {
        let provider = FailingProvider::default();
        let session = TunnelSession::new(provider.clone(), Config::parse("").unwrap());
        let mut states = session.subscribe();
        assert_eq!(*states.borrow(), SessionState::Stopped);

        let handle = session.spawn();
        states
            .wait_for(|s| *s == SessionState::Reconnecting)
            .await
            .unwrap();
        handle.stop().await;

        assert_eq!(*states.borrow(), SessionState::Stopped);
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_cancel_pending_establish() {
        let handle = TunnelSession::new(HangingProvider, Config::parse("").unwrap()).spawn();
        let mut states = handle.subscribe();
        states
            .wait_for(|s| *s == SessionState::Starting)
            .await
            .unwrap();

        handle.stop().await;
        assert!(states.borrow().is_terminal());
    }

    #[tokio::test]
    async fn should_reconnect_when_config_cannot_be_loaded() {
        let provider = FailingProvider::default();
        let source = crate::config::ConfigFile::new("/nonexistent/dnsgate.toml");
        let handle = TunnelSession::new(provider.clone(), source).spawn();
        let mut states = handle.subscribe();

        states
            .wait_for(|s| *s == SessionState::Reconnecting)
            .await
            .unwrap();
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 0);
        handle.stop().await;
    }
}
