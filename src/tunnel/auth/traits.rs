//! Authentication strategy trait definition.

use async_trait::async_trait;
use russh::{MethodKind, client};

use crate::tunnel::error::Result;
use crate::tunnel::handler::SshClientHandler;

/// One way of proving the user's identity to the SSH server.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across
/// async tasks.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate with the SSH server.
    ///
    /// * `Ok(true)` - Authentication succeeded
    /// * `Ok(false)` - The server rejected the credentials
    /// * `Err(_)` - Local or protocol error during the attempt
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool>;

    /// Name used in log and error messages.
    fn name(&self) -> &'static str;

    /// The server-advertised method this strategy needs.
    fn method(&self) -> MethodKind;
}
