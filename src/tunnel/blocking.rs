//! Synchronous facade for controllers that dedicate a thread per tunnel.
//!
//! Each call blocks the current thread on the runtime built by
//! [`init`](super::global::init). It must not be called from inside an
//! async context.

use std::sync::Arc;

use tokio::runtime::Runtime;

use super::config::Config;
use super::error::Result;
use super::global;
use super::session::{ShutdownHandle, TunnelSession};
use super::types::{TunnelExit, TunnelInfo};

#[derive(Debug)]
pub struct BlockingSession {
    runtime: Arc<Runtime>,
    inner: TunnelSession,
}

impl BlockingSession {
    /// Create a session. Fails with `NotInitialized` before `init()`.
    pub fn create(config: Config) -> Result<Self> {
        let runtime = global::runtime()?;
        let inner = TunnelSession::create(config)?;
        Ok(Self { runtime, inner })
    }

    pub fn setup(&mut self) -> Result<()> {
        self.runtime.block_on(self.inner.setup())
    }

    /// Run the tunnel on the calling thread until it stops. Use
    /// [`shutdown_handle`](Self::shutdown_handle) from another thread to
    /// stop it.
    pub fn open_tunnel(&mut self) -> Result<TunnelExit> {
        self.runtime.block_on(self.inner.open_tunnel())
    }

    pub fn close(&mut self) {
        self.runtime.block_on(self.inner.close())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.inner.shutdown_handle()
    }

    pub fn info(&self) -> TunnelInfo {
        self.inner.info()
    }

    pub fn last_error(&self) -> &str {
        self.inner.last_error()
    }

    pub fn session(&self) -> &TunnelSession {
        &self.inner
    }
}
