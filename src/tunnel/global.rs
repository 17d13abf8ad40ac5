//! Process-wide initialization.
//!
//! [`init`] builds the shared multi-threaded runtime the blocking facade runs
//! sessions on; [`cleanup`] releases it. Both are guarded and idempotent.
//! Async callers that drive [`TunnelSession`](super::TunnelSession) on
//! their own runtime do not need either.

use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use super::error::{Result, TunnelError};

static RUNTIME: Lazy<Mutex<Option<Arc<Runtime>>>> = Lazy::new(|| Mutex::new(None));

/// Build the shared runtime. Calling it again is a no-op.
pub fn init() -> Result<()> {
    let mut slot = RUNTIME.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
        return Ok(());
    }

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name("ssh-tunnel")
        .build()?;
    *slot = Some(Arc::new(runtime));
    debug!("ssh-tunnel runtime initialized");
    Ok(())
}

/// Release the shared runtime. Sessions still holding it keep it alive
/// until they are dropped.
pub fn cleanup() {
    let taken = RUNTIME
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();

    match taken.map(Arc::try_unwrap) {
        Some(Ok(runtime)) => {
            runtime.shutdown_background();
            debug!("ssh-tunnel runtime shut down");
        }
        Some(Err(_)) => debug!("ssh-tunnel runtime still used by open sessions"),
        None => {}
    }
}

pub fn is_initialized() -> bool {
    RUNTIME
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
}

pub(crate) fn runtime() -> Result<Arc<Runtime>> {
    RUNTIME
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or(TunnelError::NotInitialized)
}

/// Serializes tests that touch the process-wide runtime.
#[cfg(test)]
pub(crate) static TEST_LOCK: Mutex<()> = Mutex::new(());
