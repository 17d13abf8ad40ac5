//! russh client handler for the tunnel transport.
//!
//! The handler lives inside the russh session task. When that task ends, for
//! whatever reason, the handler cancels the transport-lost token the engine
//! watches. russh reports the disconnect, and drops the handler, before it
//! drops the channel senders, so the token is always cancelled by the time
//! channel streams of a dead session read EOF.

use russh::client;
use russh::keys::{self, ssh_key::HashAlg};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Accepts every server host key, logging its fingerprint, and signals
/// transport loss on drop.
///
/// Host keys are not checked against a known-hosts file, similar to
/// `StrictHostKeyChecking=no` in OpenSSH.
pub struct SshClientHandler {
    transport_lost: CancellationToken,
}

impl SshClientHandler {
    pub(crate) fn new(transport_lost: CancellationToken) -> Self {
        Self { transport_lost }
    }
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Server host key {} {}",
            server_public_key.algorithm(),
            server_public_key.fingerprint(HashAlg::Sha256)
        );
        Ok(true)
    }

    async fn disconnected(
        &mut self,
        reason: client::DisconnectReason<Self::Error>,
    ) -> Result<(), Self::Error> {
        self.transport_lost.cancel();
        match reason {
            client::DisconnectReason::ReceivedDisconnect(info) => {
                debug!("Server closed the SSH session: {:?}", info);
                Ok(())
            }
            client::DisconnectReason::Error(e) => {
                debug!("SSH session ended: {}", e);
                Err(e)
            }
        }
    }
}

impl Drop for SshClientHandler {
    fn drop(&mut self) {
        self.transport_lost.cancel();
    }
}
