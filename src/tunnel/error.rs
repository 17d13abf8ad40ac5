//! Tunnel errors and retry classification.
//!
//! [`TunnelError`] covers every failure the crate reports. Errors fall into
//! four groups:
//!
//! 1. **Setup errors**: connect, handshake, authentication, key loading,
//!    bind. They fail [`setup`](crate::tunnel::TunnelSession::setup) and
//!    leave the session closed.
//! 2. **Per-channel errors**: accept hiccups, exhausted channel-open
//!    retries, EOF or I/O errors on either side of a channel. They are logged
//!    and only destroy the affected channel.
//! 3. **Transport errors**: SSH transport lost, too many stalled write
//!    passes. The engine reconnects.
//! 4. **Resource errors**: registry allocation failures. They fail the
//!    operation that triggered them.
//!
//! Reconnect decisions go through [`TunnelError::is_retryable`], which falls
//! back to message classification with [`is_retryable_error`] for errors
//! coming out of the SSH library.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::array::ArrayError;
use super::types::SessionState;

pub type Result<T> = std::result::Result<T, TunnelError>;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid tunnel configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to connect to SSH server {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection to SSH server {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("Error when starting up SSH session: {0}")]
    Handshake(#[source] russh::Error),

    #[error("No supported authentication methods found (server offers: {offered})")]
    NoSupportedAuthMethod { offered: String },

    #[error("Authentication by {method} failed")]
    AuthenticationFailed { method: &'static str },

    #[error("Failed to load key from {path:?}: {reason}")]
    KeyLoad { path: PathBuf, reason: String },

    #[error("Public key {path:?} does not match the private key")]
    KeyMismatch { path: PathBuf },

    #[error("Cannot bind local socket to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Could not open the direct TCP/IP channel to {target}: {source}")]
    ChannelOpen {
        target: String,
        #[source]
        source: russh::Error,
    },

    #[error("Channel registry error: {0}")]
    Registry(#[from] ArrayError),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("SSH transport lost")]
    TransportLost,

    #[error("SSH transport stalled: {passes} successive passes without write progress")]
    Stalled { passes: u32 },

    #[error("Failed to accept a local connection: {0}")]
    Accept(#[source] io::Error),

    #[error("Reconnecting to the SSH server failed after {attempts} attempt(s): {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    #[error("Operation not allowed while the session is {0}")]
    InvalidState(SessionState),

    #[error("Tunnel runtime is not initialized; call init() first")]
    NotInitialized,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Whether retrying the connection could succeed.
    ///
    /// Credential, key and configuration problems never are; network and
    /// transport problems are; SSH library errors are classified by message.
    pub fn is_retryable(&self) -> bool {
        match self {
            TunnelError::Connect { .. }
            | TunnelError::ConnectTimeout { .. }
            | TunnelError::TransportLost
            | TunnelError::Stalled { .. }
            | TunnelError::Io(_) => true,
            TunnelError::Handshake(e) | TunnelError::Ssh(e) => is_retryable_error(&e.to_string()),
            TunnelError::InvalidConfig(_)
            | TunnelError::NoSupportedAuthMethod { .. }
            | TunnelError::AuthenticationFailed { .. }
            | TunnelError::KeyLoad { .. }
            | TunnelError::KeyMismatch { .. }
            | TunnelError::Bind { .. }
            | TunnelError::ChannelOpen { .. }
            | TunnelError::Registry(_)
            | TunnelError::Accept(_)
            | TunnelError::ReconnectExhausted { .. }
            | TunnelError::InvalidState(_)
            | TunnelError::NotInitialized => false,
        }
    }
}

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "authentication by",
    "no supported authentication",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
    "would block",
    "transport lost",
];

/// Determines if an error message describes a transient failure.
///
/// Authentication patterns are checked first and always win. Known
/// connection patterns are retryable. Anything else is retried unless it
/// looks like an SSH protocol error without a timeout or connect keyword.
pub(crate) fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    if AUTH_ERRORS.iter().any(|pattern| error_lower.contains(pattern)) {
        return false;
    }

    if RETRYABLE_ERRORS
        .iter()
        .any(|pattern| error_lower.contains(pattern))
    {
        return true;
    }

    !error_lower.contains("ssh") || error_lower.contains("timeout") || error_lower.contains("connect")
}

/// Whether a channel-open failure is worth another attempt.
///
/// Only resource shortage on the server, or a local would-block, is retried.
/// A refused or prohibited destination fails straight away.
pub(crate) fn is_channel_open_retryable(error: &russh::Error) -> bool {
    match error {
        russh::Error::ChannelOpenFailure(reason) => {
            matches!(reason, russh::ChannelOpenFailure::ResourceShortage)
        }
        russh::Error::Disconnect | russh::Error::SendError => false,
        other => {
            let message = other.to_string().to_lowercase();
            message.contains("would block") || message.contains("resource temporarily unavailable")
        }
    }
}

/// Accept errors that only concern the connection being accepted.
pub(crate) fn is_transient_accept_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    mod auth_errors_not_retryable {
        use super::*;

        #[test]
        fn test_authentication_failed() {
            assert!(!is_retryable_error("Authentication failed"));
            assert!(!is_retryable_error("AUTHENTICATION FAILED"));
        }

        #[test]
        fn test_no_supported_methods() {
            let err = TunnelError::NoSupportedAuthMethod {
                offered: "password".to_string(),
            };
            assert!(!is_retryable_error(&err.to_string()));
            assert!(!err.is_retryable());
        }

        #[test]
        fn test_authentication_by_method_failed() {
            let err = TunnelError::AuthenticationFailed { method: "password" };
            assert!(!is_retryable_error(&err.to_string()));
            assert!(!err.is_retryable());
        }

        #[test]
        fn test_permission_denied() {
            assert!(!is_retryable_error("Permission denied"));
            assert!(!is_retryable_error("permission denied (publickey)"));
        }

        #[test]
        fn test_auth_error_takes_precedence_over_connection() {
            assert!(!is_retryable_error(
                "Connection timeout during authentication failed"
            ));
        }
    }

    mod connection_errors_retryable {
        use super::*;

        #[test]
        fn test_connection_refused() {
            assert!(is_retryable_error("Connection refused"));
            assert!(is_retryable_error("connection refused by server"));
        }

        #[test]
        fn test_connection_reset() {
            assert!(is_retryable_error("connection reset by peer"));
        }

        #[test]
        fn test_timeout() {
            assert!(is_retryable_error("Operation timeout"));
        }

        #[test]
        fn test_network_unreachable() {
            assert!(is_retryable_error("Network is unreachable"));
        }

        #[test]
        fn test_broken_pipe() {
            assert!(is_retryable_error("Broken pipe"));
        }

        #[test]
        fn test_would_block() {
            assert!(is_retryable_error("operation would block"));
        }

        #[test]
        fn test_transport_lost() {
            assert!(is_retryable_error(&TunnelError::TransportLost.to_string()));
            assert!(TunnelError::TransportLost.is_retryable());
        }
    }

    mod edge_cases {
        use super::*;

        #[test]
        fn test_unknown_error_without_ssh() {
            assert!(is_retryable_error("Something went wrong"));
        }

        #[test]
        fn test_ssh_protocol_error_not_retryable() {
            assert!(!is_retryable_error("SSH protocol error"));
        }

        #[test]
        fn test_ssh_with_connect_is_retryable() {
            assert!(is_retryable_error("SSH failed to connect"));
        }
    }

    mod tunnel_error {
        use super::*;

        #[test]
        fn test_connect_error_is_retryable() {
            let err = TunnelError::Connect {
                addr: "bastion:22".to_string(),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            };
            assert!(err.is_retryable());
            assert!(err.to_string().contains("bastion:22"));
        }

        #[test]
        fn test_config_error_is_not_retryable() {
            let err = TunnelError::InvalidConfig("username is empty".to_string());
            assert!(!err.is_retryable());
        }

        #[test]
        fn test_key_errors_are_not_retryable() {
            let err = TunnelError::KeyLoad {
                path: PathBuf::from("/nonexistent"),
                reason: "No such file".to_string(),
            };
            assert!(!err.is_retryable());
            let err = TunnelError::KeyMismatch {
                path: PathBuf::from("/id.pub"),
            };
            assert!(!err.is_retryable());
        }

        #[test]
        fn test_registry_error_converts() {
            let err: TunnelError = ArrayError::Allocation.into();
            assert!(matches!(err, TunnelError::Registry(ArrayError::Allocation)));
        }
    }

    mod channel_open {
        use super::*;

        #[test]
        fn test_resource_shortage_is_retried() {
            let err = russh::Error::ChannelOpenFailure(russh::ChannelOpenFailure::ResourceShortage);
            assert!(is_channel_open_retryable(&err));
        }

        #[test]
        fn test_connect_failed_is_not_retried() {
            let err = russh::Error::ChannelOpenFailure(russh::ChannelOpenFailure::ConnectFailed);
            assert!(!is_channel_open_retryable(&err));
        }

        #[test]
        fn test_prohibited_is_not_retried() {
            let err = russh::Error::ChannelOpenFailure(
                russh::ChannelOpenFailure::AdministrativelyProhibited,
            );
            assert!(!is_channel_open_retryable(&err));
        }

        #[test]
        fn test_disconnect_is_not_retried() {
            assert!(!is_channel_open_retryable(&russh::Error::Disconnect));
        }
    }

    mod accept {
        use super::*;

        #[test]
        fn test_connection_level_errors_are_transient() {
            for kind in [
                io::ErrorKind::ConnectionAborted,
                io::ErrorKind::ConnectionReset,
                io::ErrorKind::Interrupted,
                io::ErrorKind::WouldBlock,
            ] {
                assert!(is_transient_accept_error(&io::Error::from(kind)), "{kind:?}");
            }
        }

        #[test]
        fn test_other_errors_are_fatal() {
            assert!(!is_transient_accept_error(&io::Error::from(
                io::ErrorKind::PermissionDenied
            )));
            assert!(!is_transient_accept_error(&io::Error::other("too many open files")));
        }
    }
}
