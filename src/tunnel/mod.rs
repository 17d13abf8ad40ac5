//! SSH tunnel module forwarding one local TCP port to a remote host:port.
//!
//! This module is organized into the following submodules:
//!
//! - `array`: Order-preserving owned registry used for live channels
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error types and classification for retry logic
//! - `log`: Per-session log fan-out (tracing, callback, last error)
//! - `auth`: Authentication strategies
//! - `client`: SSH connection, authentication and reconnect logic
//! - `channel`: One forwarded client connection
//! - `session`: Session lifecycle (create, setup, close)
//! - `engine`: The event loop behind `open_tunnel`
//! - `global`: Process-wide init/cleanup
//! - `blocking`: Synchronous facade (feature-gated)

pub mod array;
pub(crate) mod auth;
#[cfg(feature = "blocking")]
pub mod blocking;
pub(crate) mod channel;
pub(crate) mod client;
pub mod config;
mod engine;
pub mod error;
pub mod global;
pub(crate) mod handler;
pub mod log;
pub mod session;
pub mod types;

#[cfg(feature = "blocking")]
pub use blocking::BlockingSession;
pub use channel::ChannelId;
pub use config::{AuthType, Config, LogLevel, TunnelTuning};
pub use error::{Result, TunnelError};
pub use global::{cleanup, init};
pub use log::{LogCallback, LogContext, UserContext};
pub use session::{ShutdownHandle, TunnelSession};
pub use types::{SessionState, TunnelExit, TunnelInfo};
