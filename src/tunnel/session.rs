//! Tunnel session lifecycle.
//!
//! A [`TunnelSession`] owns the local listening socket, the SSH transport,
//! the channel registry and its own copy of the [`Config`]. It is driven by
//! a single task: `create` validates, `setup` connects, authenticates and
//! binds, [`open_tunnel`](TunnelSession::open_tunnel) runs the engine, and
//! `close` tears everything down in order (listener, channels, SSH session).

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::array::Registry;
use super::channel::{Channel, ChannelId, Teardown};
use super::client::{self, SshTransport};
use super::config::{AuthType, Config};
use super::error::{Result, TunnelError};
use super::log::SessionLogger;
use super::types::{SessionState, TunnelInfo};

const LISTEN_BACKLOG: u32 = 128;

/// Requests a running tunnel to stop. Cloneable and usable from any task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub struct TunnelSession {
    pub(super) id: Uuid,
    pub(super) config: Config,
    pub(super) state: SessionState,
    pub(super) log: SessionLogger,
    pub(super) listener: Option<TcpListener>,
    pub(super) local_addr: Option<SocketAddr>,
    pub(super) transport: Option<SshTransport>,
    pub(super) channels: Registry<Channel>,
    pub(super) next_channel: u64,
    pub(super) shutdown: CancellationToken,
    pub(super) connected_at: Option<DateTime<Utc>>,
    pub(super) reconnects: u32,
    pub(super) status: watch::Sender<TunnelInfo>,
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("local_addr", &self.local_addr)
            .field("remote", &self.config.remote_address())
            .field("channels", &self.channels.len())
            .finish()
    }
}

impl TunnelSession {
    /// Validate `config` and build a session. No network I/O happens here.
    pub fn create(config: Config) -> Result<Self> {
        config.validate()?;

        let id = Uuid::new_v4();
        let log = SessionLogger::new(
            id,
            config.log_level,
            config.log_callback.clone(),
            config.user_context.clone(),
        );

        let session = Self {
            id,
            config,
            state: SessionState::Created,
            log,
            listener: None,
            local_addr: None,
            transport: None,
            channels: Registry::new(),
            next_channel: 0,
            shutdown: CancellationToken::new(),
            connected_at: None,
            reconnects: 0,
            status: watch::channel(placeholder_info(id)).0,
        };
        session.publish();
        Ok(session)
    }

    /// Connect and authenticate to the SSH server, then bind the local
    /// listening socket.
    ///
    /// Only valid on a freshly created session. On failure every partially
    /// acquired resource is released, the error is recorded as the last
    /// error and the session is left `Closed`.
    pub async fn setup(&mut self) -> Result<()> {
        if self.state != SessionState::Created {
            return Err(TunnelError::InvalidState(self.state));
        }

        match self.try_setup().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.log.error(&e.to_string());
                self.close().await;
                Err(e)
            }
        }
    }

    async fn try_setup(&mut self) -> Result<()> {
        self.set_state(SessionState::ConnectingSsh);
        self.log.debug(&format!(
            "Connecting to SSH server ({}) as {}...",
            self.config.ssh_address(),
            self.config.username
        ));

        let transport = client::connect_transport(&self.config).await?;
        if transport.auth_method == "none" && self.config.auth_type != AuthType::None {
            self.log.warn(&format!(
                "Server accepted 'none' authentication, configured {} credentials were not used",
                self.config.auth_type
            ));
        }
        self.transport = Some(transport);
        self.connected_at = Some(Utc::now());
        self.set_state(SessionState::Authenticated);
        self.log.info(&format!(
            "Authenticated to SSH server {}",
            self.config.ssh_address()
        ));

        let listener = bind_listener(SocketAddr::new(self.config.local_ip, self.config.local_port))?;
        let local_addr = listener.local_addr()?;
        self.config.local_port = local_addr.port();
        self.listener = Some(listener);
        self.local_addr = Some(local_addr);
        self.set_state(SessionState::Listening);
        self.log.info(&format!(
            "Waiting for TCP connection on {} (forwarding to {})",
            local_addr,
            self.config.remote_address()
        ));

        Ok(())
    }

    /// Tear down the listener, every channel and the SSH session.
    ///
    /// Idempotent: resources already released are skipped.
    pub async fn close(&mut self) {
        if self.listener.take().is_some() {
            self.log.debug("Closing local accept socket");
        }
        self.local_addr = None;
        self.release_transport(Teardown::Close).await;

        if self.state != SessionState::Closed {
            self.set_state(SessionState::Closed);
            self.log.debug("SSH tunnel closed");
        }
    }

    /// Destroy every channel, then drop the SSH session. The listener is
    /// left alone.
    pub(super) async fn release_transport(&mut self, teardown: Teardown) {
        let channels = self.channels.drain();
        if !channels.is_empty() {
            self.log.debug(&format!("Closing {} channel(s)", channels.len()));
        }
        for mut channel in channels {
            channel.close(teardown).await;
        }

        if let Some(transport) = self.transport.take() {
            self.log.debug("Closing SSH session");
            transport.disconnect().await;
        }
        self.publish();
    }

    pub(super) fn next_channel_id(&mut self) -> ChannelId {
        self.next_channel += 1;
        ChannelId(self.next_channel)
    }

    pub(super) fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.publish();
    }

    /// Push the current snapshot to status subscribers.
    pub(super) fn publish(&self) {
        self.status.send_replace(self.info());
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The session's own configuration copy, including the bound local port.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The most recent error-severity message, empty if none.
    pub fn last_error(&self) -> &str {
        self.log.last_error()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| !t.is_closed())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    /// Receive a fresh [`TunnelInfo`] whenever the state or the channel
    /// count changes.
    pub fn subscribe(&self) -> watch::Receiver<TunnelInfo> {
        self.status.subscribe()
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            session_id: self.id,
            state: self.state,
            local_address: self.local_addr.map(|addr| addr.to_string()),
            remote_address: self.config.remote_address(),
            ssh_server: self.config.ssh_address(),
            username: self.config.username.clone(),
            channels: self.channels.len(),
            connected_at: self.connected_at.map(|at| at.to_rfc3339()),
            reconnects: self.reconnects,
        }
    }
}

fn placeholder_info(id: Uuid) -> TunnelInfo {
    TunnelInfo {
        session_id: id,
        state: SessionState::Created,
        local_address: None,
        remote_address: String::new(),
        ssh_server: String::new(),
        username: String::new(),
        channels: 0,
        connected_at: None,
        reconnects: 0,
    }
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let bind_err = |source| TunnelError::Bind { addr, source };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(addr).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)
}
