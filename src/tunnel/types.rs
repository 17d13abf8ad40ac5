use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a [`TunnelSession`](crate::tunnel::TunnelSession).
///
/// `Created → ConnectingSsh → Authenticated → Listening → Running → Closed`.
/// A failed setup goes straight to `Closed`; a running session passes back
/// through `ConnectingSsh` while it reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    ConnectingSsh,
    Authenticated,
    Listening,
    Running,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::ConnectingSsh => "connecting_ssh",
            SessionState::Authenticated => "authenticated",
            SessionState::Listening => "listening",
            SessionState::Running => "running",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why [`open_tunnel`](crate::tunnel::TunnelSession::open_tunnel) returned
/// without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelExit {
    /// The shutdown handle was triggered.
    Shutdown,
    /// The SSH transport went away while no channel was open.
    TransportClosed,
}

impl fmt::Display for TunnelExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelExit::Shutdown => f.write_str("shutdown requested"),
            TunnelExit::TransportClosed => f.write_str("SSH transport closed with no open channels"),
        }
    }
}

/// Point-in-time view of a session, suitable for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub session_id: Uuid,
    pub state: SessionState,
    /// Local listening address, once bound.
    pub local_address: Option<String>,
    /// Destination the SSH server connects to, as `host:port`.
    pub remote_address: String,
    /// SSH server, as `host:port`.
    pub ssh_server: String,
    pub username: String,
    pub channels: usize,
    /// RFC 3339 timestamp of the last successful SSH connection.
    pub connected_at: Option<String>,
    pub reconnects: u32,
}
