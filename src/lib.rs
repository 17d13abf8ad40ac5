//! Point-to-point SSH tunnel.
//!
//! A [`TunnelSession`] authenticates to an SSH server, listens on a local
//! TCP port and forwards every accepted connection to a fixed remote
//! `host:port` through its own `direct-tcpip` channel.
//!
//! ```no_run
//! use ssh_tunnel::{Config, TunnelSession};
//!
//! # async fn run() -> ssh_tunnel::Result<()> {
//! let config = Config::new("bastion.example.com", "deploy", "10.0.0.5", 5432)
//!     .private_key("/home/deploy/.ssh/id_ed25519");
//! let mut session = TunnelSession::create(config)?;
//! session.setup().await?;
//! println!("listening on {:?}", session.local_addr());
//! session.open_tunnel().await?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(test), deny(clippy::unwrap_used))]

pub mod tunnel;

#[cfg(feature = "blocking")]
pub use tunnel::BlockingSession;
pub use tunnel::{
    AuthType, ChannelId, Config, LogCallback, LogContext, LogLevel, Result, SessionState,
    ShutdownHandle, TunnelError, TunnelExit, TunnelInfo, TunnelSession, TunnelTuning,
    UserContext, cleanup, init,
};
