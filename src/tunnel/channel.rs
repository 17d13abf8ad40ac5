//! One forwarded connection: a client socket paired with a `direct-tcpip`
//! SSH channel.
//!
//! Each direction moves one buffer at a time. The engine reads into the
//! buffer, then lends the matching writer out of the [`Channel`] to a write
//! future that owns reader, writer and buffer until every byte is out. The
//! reader is only armed again once the write is done, so a slow side
//! applies backpressure to the other instead of piling up data.
//!
//! Writes wait on real readiness. Writes towards the client wait as long as
//! the client takes. Writes towards the SSH channel count every retry period
//! without progress against a bounded budget. Running out of it, or any
//! other teardown with data still in flight, resets the client socket so
//! the client never mistakes the cut for a clean end of stream.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use russh::ChannelStream;
use russh::client;
use tokio::io::{AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::{Result, TunnelError, is_channel_open_retryable};
use super::handler::SshClientHandler;

pub(crate) type SshStream = ChannelStream<client::Msg>;
pub(crate) type SshReader = ReadHalf<SshStream>;
pub(crate) type SshWriter = WriteHalf<SshStream>;

/// Session-local channel identifier, never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub(crate) enum WriteResult {
    Done,
    /// The writer made no progress for the whole attempt budget.
    Exhausted,
    Failed(io::Error),
    Cancelled,
}

/// Write all of `data`, waiting as long as the writer needs.
pub(crate) async fn write_unbounded<W>(
    writer: &mut W,
    data: &[u8],
    cancel: &CancellationToken,
) -> WriteResult
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => WriteResult::Cancelled,
        written = writer.write_all(data) => match written {
            Ok(()) => WriteResult::Done,
            Err(e) => WriteResult::Failed(e),
        },
    }
}

/// Write all of `data`, giving up after `max_attempts` periods of `period`
/// in a row without a single byte going out.
///
/// Every byte written is added to `progress`.
pub(crate) async fn write_bounded<W>(
    writer: &mut W,
    data: &[u8],
    max_attempts: u32,
    period: Duration,
    progress: &AtomicU64,
    cancel: &CancellationToken,
) -> WriteResult
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    let mut attempts = 0;

    while written < data.len() {
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => return WriteResult::Cancelled,
            step = tokio::time::timeout(period, writer.write(&data[written..])) => step,
        };

        match step {
            Ok(Ok(0)) => return WriteResult::Failed(io::ErrorKind::WriteZero.into()),
            Ok(Ok(n)) => {
                written += n;
                attempts = 0;
                progress.fetch_add(n as u64, Ordering::Relaxed);
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
            Ok(Err(e)) => return WriteResult::Failed(e),
            Err(_) => {
                attempts += 1;
                if attempts >= max_attempts {
                    return WriteResult::Exhausted;
                }
            }
        }
    }
    WriteResult::Done
}

/// Write half of a client socket that never sends EOF on drop.
///
/// Dropping it leaves the socket to the read half; once both are gone the
/// connection resets. Only [`shutdown_client`] ends the stream cleanly.
pub(crate) struct ClientWriter(Option<OwnedWriteHalf>);

impl ClientWriter {
    pub(crate) fn new(writer: OwnedWriteHalf) -> Self {
        Self(Some(writer))
    }

    fn inner(&mut self) -> io::Result<Pin<&mut OwnedWriteHalf>> {
        self.0
            .as_mut()
            .map(Pin::new)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl AsyncWrite for ClientWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().inner() {
            Ok(writer) => writer.poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner() {
            Ok(writer) => writer.poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner() {
            Ok(writer) => writer.poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl Drop for ClientWriter {
    fn drop(&mut self) {
        if let Some(writer) = self.0.take() {
            writer.forget();
        }
    }
}

/// How a channel is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Teardown {
    /// Send EOF on both sides.
    Close,
    /// Drop both sides without EOF; the client socket resets.
    Abort,
}

pub(crate) struct Channel {
    id: ChannelId,
    peer: SocketAddr,
    client_tx: Option<ClientWriter>,
    ssh_tx: Option<SshWriter>,
    cancel: CancellationToken,
    closed: bool,
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        peer: SocketAddr,
        client_tx: OwnedWriteHalf,
        ssh_tx: SshWriter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer,
            client_tx: Some(ClientWriter::new(client_tx)),
            ssh_tx: Some(ssh_tx),
            cancel,
            closed: false,
        }
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Token that stops this channel's reads and writes in flight.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Lend the client writer to a write in flight.
    pub(crate) fn take_client_writer(&mut self) -> Option<ClientWriter> {
        self.client_tx.take()
    }

    pub(crate) fn restore_client_writer(&mut self, writer: ClientWriter) {
        if !self.closed {
            self.client_tx = Some(writer);
        }
    }

    /// Lend the SSH writer to a write in flight.
    pub(crate) fn take_ssh_writer(&mut self) -> Option<SshWriter> {
        self.ssh_tx.take()
    }

    pub(crate) fn restore_ssh_writer(&mut self, writer: SshWriter) {
        if !self.closed {
            self.ssh_tx = Some(writer);
        }
    }

    /// Release everything the channel still holds. Safe to call twice.
    ///
    /// Writers lent to a write in flight are dropped by their owner once
    /// the cancellation reaches it; the client socket then resets.
    pub(crate) async fn close(&mut self, teardown: Teardown) {
        self.closed = true;
        self.cancel.cancel();

        match teardown {
            Teardown::Close => {
                if let Some(mut ssh_tx) = self.ssh_tx.take() {
                    // Sends EOF on the SSH channel
                    if let Err(e) = ssh_tx.shutdown().await {
                        debug!("Channel {}: SSH side already gone: {}", self.id, e);
                    }
                }
                if let Some(client_tx) = self.client_tx.take() {
                    shutdown_client(client_tx, self.id).await;
                }
            }
            Teardown::Abort => {
                self.ssh_tx = None;
                self.client_tx = None;
            }
        }
    }
}

/// Make the last close of `socket` send a reset instead of a FIN.
///
/// Client sockets are switched to this as soon as their channel opens, so
/// any path that drops them with data still in flight resets the client.
pub(crate) fn reset_on_close(socket: &TcpStream, id: ChannelId) {
    if let Err(e) = socket.set_linger(Some(Duration::ZERO)) {
        debug!("Channel {}: cannot set linger on client socket: {}", id, e);
    }
}

/// Orderly end of stream towards the client.
async fn shutdown_client(mut client_tx: ClientWriter, id: ChannelId) {
    let Some(mut writer) = client_tx.0.take() else {
        return;
    };
    if let Err(e) = writer.as_ref().set_linger(None) {
        debug!("Channel {}: cannot clear linger on client socket: {}", id, e);
    }
    if let Err(e) = writer.shutdown().await {
        debug!("Channel {}: client side already gone: {}", id, e);
    }
}

/// Open a `direct-tcpip` channel to `remote_host:remote_port`.
///
/// Resource shortage on the server is retried every `delay`, up to
/// `attempts` tries in total; any other failure is returned at once.
pub(crate) async fn open_direct_channel(
    handle: &client::Handle<SshClientHandler>,
    remote_host: &str,
    remote_port: u16,
    originator: SocketAddr,
    attempts: u32,
    delay: Duration,
) -> Result<russh::Channel<client::Msg>> {
    let backoff = ConstantBuilder::default()
        .with_delay(delay)
        .with_max_times(attempts.saturating_sub(1) as usize);

    (|| async {
        handle
            .channel_open_direct_tcpip(
                remote_host,
                remote_port as u32,
                originator.ip().to_string(),
                originator.port() as u32,
            )
            .await
    })
    .retry(backoff)
    .when(is_channel_open_retryable)
    .notify(|err, dur| {
        debug!(
            "Channel to {}:{} not available yet, retrying in {:?}: {}",
            remote_host, remote_port, dur, err
        );
    })
    .await
    .map_err(|source| TunnelError::ChannelOpen {
        target: format!("{remote_host}:{remote_port}"),
        source,
    })
}
