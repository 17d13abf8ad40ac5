//! SSH transport establishment.
//!
//! ## Connection Lifecycle
//!
//! 1. **TCP connect** to the SSH server, bounded by the connect timeout.
//! 2. **Handshake** over that stream with a persistent client config
//!    (keepalive on, no inactivity timeout), also bounded by the timeout.
//! 3. **Authentication** as described in [`auth`](super::auth).
//!
//! Setup calls [`connect_transport`] once and never retries. The engine
//! calls [`connect_with_retry`] to re-establish a lost transport, using
//! exponential backoff with jitter via the `backon` crate:
//!
//! - **Initial delay**: `reconnect_delay` (default: 1000ms)
//! - **Maximum delay**: Capped at [`MAX_RETRY_DELAY`] (10 seconds)
//! - **Maximum attempts**: `reconnect_attempts` (default: 3)
//!
//! Authentication failures are never retried to avoid account lockouts.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use russh::{Disconnect, client};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::auth;
use super::config::{Config, MAX_RETRY_DELAY, TunnelTuning};
use super::error::{Result, TunnelError};
use super::handler::SshClientHandler;

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Build russh client configuration for a long-lived tunnel transport.
///
/// - Inactivity timeout disabled when `persistent` is true
/// - Keepalive interval of 30 seconds with max 3 keepalives
/// - ZLIB compression preferred when `compress` is set
pub(crate) fn build_client_config(
    timeout: Duration,
    compress: bool,
    persistent: bool,
) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    let inactivity_timeout = if persistent { None } else { Some(timeout) };

    Arc::new(client::Config {
        inactivity_timeout,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// An authenticated SSH connection.
pub(crate) struct SshTransport {
    pub(crate) handle: Arc<client::Handle<SshClientHandler>>,
    /// Cancelled once the russh session task has ended.
    pub(crate) lost: CancellationToken,
    pub(crate) server: SocketAddr,
    /// Name of the authentication method the server accepted.
    pub(crate) auth_method: &'static str,
}

impl SshTransport {
    pub(crate) fn is_closed(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Disconnect politely; the session task ends once the handle drops.
    ///
    /// A transport wedged on a full socket gets `DISCONNECT_TIMEOUT` to
    /// take the message before it is simply dropped.
    pub(crate) async fn disconnect(self) {
        if self.is_closed() {
            return;
        }
        let disconnect = self
            .handle
            .disconnect(Disconnect::ByApplication, "Tunnel closed", "en");
        match tokio::time::timeout(DISCONNECT_TIMEOUT, disconnect).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Error while disconnecting from {}: {}", self.server, e),
            Err(_) => debug!("Disconnect from {} timed out", self.server),
        }
    }
}

/// Connect, handshake and authenticate once.
pub(crate) async fn connect_transport(config: &Config) -> Result<SshTransport> {
    let tuning: &TunnelTuning = &config.tuning;
    let addr = config.ssh_address();
    let timeout = tuning.connect_timeout;

    let stream = tokio::time::timeout(
        timeout,
        TcpStream::connect((config.ssh_server_ip.as_str(), config.ssh_server_port)),
    )
    .await
    .map_err(|_| TunnelError::ConnectTimeout {
        addr: addr.clone(),
        timeout,
    })?
    .map_err(|source| TunnelError::Connect {
        addr: addr.clone(),
        source,
    })?;
    stream.set_nodelay(true)?;
    let server = stream.peer_addr()?;
    debug!("TCP connection to {} established ({})", addr, server);

    let lost = CancellationToken::new();
    let handler = SshClientHandler::new(lost.clone());
    let client_config = build_client_config(timeout, tuning.compression, true);

    let mut handle = tokio::time::timeout(timeout, client::connect_stream(client_config, stream, handler))
        .await
        .map_err(|_| TunnelError::ConnectTimeout {
            addr: addr.clone(),
            timeout,
        })?
        .map_err(TunnelError::Handshake)?;

    let auth_method = auth::authenticate(&mut handle, config).await?;

    Ok(SshTransport {
        handle: Arc::new(handle),
        lost,
        server,
        auth_method,
    })
}

/// Re-establish the transport with exponential backoff.
///
/// Returns the transport and the number of retries it took. When the
/// attempts run out, or the failure is not retryable, the last error is
/// wrapped in [`TunnelError::ReconnectExhausted`].
pub(crate) async fn connect_with_retry(config: &Config) -> Result<(SshTransport, u32)> {
    let tuning = &config.tuning;
    let attempt_counter = AtomicU32::new(0);

    let backoff = ExponentialBuilder::default()
        .with_min_delay(tuning.reconnect_delay)
        .with_max_delay(MAX_RETRY_DELAY)
        .with_max_times(tuning.reconnect_attempts as usize)
        .with_jitter();

    let result = (|| async {
        attempt_counter.fetch_add(1, Ordering::SeqCst);
        connect_transport(config).await
    })
    .retry(backoff)
    .when(|e: &TunnelError| e.is_retryable())
    .notify(|err, dur| {
        warn!(
            "SSH reconnect to {} failed, retrying in {:?}: {}",
            config.ssh_address(),
            dur,
            err
        );
    })
    .await;

    let attempts = attempt_counter.load(Ordering::SeqCst);
    match result {
        Ok(transport) => {
            let retries = attempts.saturating_sub(1);
            info!(
                "Reconnected to SSH server {} after {} retries",
                config.ssh_address(),
                retries
            );
            Ok((transport, retries))
        }
        Err(e) => Err(TunnelError::ReconnectExhausted {
            attempts,
            last_error: e.to_string(),
        }),
    }
}
