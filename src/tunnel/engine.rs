//! The tunnel event loop.
//!
//! One task drives every channel of a session. Each pass waits on a biased
//! `select!` over, in order:
//!
//! 1. the shutdown token,
//! 2. the local listener (new client connections),
//! 3. the transport-lost token of the SSH session,
//! 4. channel opens in flight,
//! 5. reads from SSH channels,
//! 6. reads from client sockets,
//! 7. writes to client sockets,
//! 8. writes to SSH channels,
//! 9. the stall check, while any SSH write is in flight.
//!
//! Reads and writes are boxed futures that own their stream halves and
//! their buffer, so the loop keeps sole ownership of the channel registry
//! and needs no locking. A completed read turns into a write of the same
//! buffer to the other side; a completed write re-arms the read. Every
//! future is woken by its own stream, so a busy channel never delays a
//! quiet one.
//!
//! The stall check runs on a fixed interval. When a whole interval passes
//! with SSH writes in flight and not one byte written, a stall counter is
//! bumped. Too many stalled intervals in a row, or the SSH session ending
//! while channels are open, is a transport failure: all channels are reset,
//! the SSH leg is re-established with backoff and the listener keeps
//! accepting. If the transport ends with no channel open, the loop exits.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::channel::{
    self, Channel, ChannelId, ClientWriter, SshReader, SshWriter, Teardown, WriteResult,
};
use super::client;
use super::config::TunnelTuning;
use super::error::{Result, TunnelError, is_transient_accept_error};
use super::session::TunnelSession;
use super::types::{SessionState, TunnelExit};

enum ReadResult {
    Data(usize),
    Eof,
    Failed(io::Error),
    Cancelled,
}

struct ReadOutcome<R> {
    id: ChannelId,
    reader: R,
    buf: Vec<u8>,
    result: ReadResult,
}

/// A finished write hands back both halves so the read can be re-armed.
struct WriteOutcome<R, W> {
    id: ChannelId,
    reader: R,
    writer: W,
    buf: Vec<u8>,
    result: WriteResult,
}

type ToClient = WriteOutcome<SshReader, ClientWriter>;
type ToSsh = WriteOutcome<OwnedReadHalf, SshWriter>;

struct OpenOutcome {
    stream: TcpStream,
    peer: SocketAddr,
    result: Result<russh::Channel<russh::client::Msg>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ToSsh,
    ToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToSsh => f.write_str("SSH channel"),
            Direction::ToClient => f.write_str("client socket"),
        }
    }
}

enum Event {
    Shutdown,
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    TransportLost,
    Opened(OpenOutcome),
    FromSsh(ReadOutcome<SshReader>),
    FromClient(ReadOutcome<OwnedReadHalf>),
    WroteToClient(ToClient),
    WroteToSsh(ToSsh),
    StallCheck,
}

/// Counts stall intervals: intervals in which SSH writes were in flight
/// and none of them wrote a byte.
struct StallMonitor {
    progress: Arc<AtomicU64>,
    last_seen: u64,
    passes: u32,
    max_passes: u32,
}

impl StallMonitor {
    fn new(max_passes: u32) -> Self {
        Self {
            progress: Arc::new(AtomicU64::new(0)),
            last_seen: 0,
            passes: 0,
            max_passes,
        }
    }

    /// Counter the SSH writes add their written bytes to.
    fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.progress)
    }

    fn check(&mut self, writes_in_flight: bool) -> Result<()> {
        let seen = self.progress.load(Ordering::Relaxed);
        if !writes_in_flight || seen != self.last_seen {
            self.last_seen = seen;
            self.passes = 0;
            return Ok(());
        }

        self.passes += 1;
        if self.passes >= self.max_passes {
            return Err(TunnelError::Stalled {
                passes: self.passes,
            });
        }
        Ok(())
    }
}

/// Everything in flight for the current SSH transport.
struct Pump {
    opening: FuturesUnordered<BoxFuture<'static, OpenOutcome>>,
    ssh_reads: FuturesUnordered<BoxFuture<'static, ReadOutcome<SshReader>>>,
    client_reads: FuturesUnordered<BoxFuture<'static, ReadOutcome<OwnedReadHalf>>>,
    to_client: FuturesUnordered<BoxFuture<'static, ToClient>>,
    to_ssh: FuturesUnordered<BoxFuture<'static, ToSsh>>,
    stall: StallMonitor,
    stall_tick: Interval,
}

impl Pump {
    fn new(tuning: &TunnelTuning) -> Self {
        let period = tuning.write_retry_delay;
        let mut stall_tick = tokio::time::interval_at(Instant::now() + period, period);
        stall_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            opening: FuturesUnordered::new(),
            ssh_reads: FuturesUnordered::new(),
            client_reads: FuturesUnordered::new(),
            to_client: FuturesUnordered::new(),
            to_ssh: FuturesUnordered::new(),
            stall: StallMonitor::new(tuning.max_stalled_passes),
            stall_tick,
        }
    }
}

fn arm_read<R>(
    id: ChannelId,
    mut reader: R,
    mut buf: Vec<u8>,
    cancel: CancellationToken,
) -> BoxFuture<'static, ReadOutcome<R>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async move {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => ReadResult::Cancelled,
            read = reader.read(&mut buf) => match read {
                Ok(0) => ReadResult::Eof,
                Ok(n) => ReadResult::Data(n),
                Err(e) => ReadResult::Failed(e),
            },
        };
        ReadOutcome {
            id,
            reader,
            buf,
            result,
        }
    }
    .boxed()
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn transport_lost(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

impl TunnelSession {
    /// Run the tunnel until shutdown or an unrecoverable error.
    ///
    /// Requires a session that completed [`setup`](Self::setup). The session
    /// is closed when this returns, whatever the outcome.
    pub async fn open_tunnel(&mut self) -> Result<TunnelExit> {
        if self.state != SessionState::Listening {
            return Err(TunnelError::InvalidState(self.state));
        }
        self.set_state(SessionState::Running);

        let mut pump = Pump::new(&self.config.tuning);
        let outcome = self.run(&mut pump).await;
        drop(pump);

        match &outcome {
            Ok(exit) => self.log.info(&format!("SSH tunnel stopped: {exit}")),
            Err(e) => self.log.error(&format!("SSH tunnel failed: {e}")),
        }
        self.close().await;
        outcome
    }

    async fn run(&mut self, pump: &mut Pump) -> Result<TunnelExit> {
        loop {
            let event = {
                let lost = self.transport.as_ref().map(|t| &t.lost);
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => Event::Shutdown,
                    accepted = accept(self.listener.as_ref()) => Event::Accepted(accepted),
                    _ = transport_lost(lost) => Event::TransportLost,
                    Some(opened) = pump.opening.next() => Event::Opened(opened),
                    Some(read) = pump.ssh_reads.next() => Event::FromSsh(read),
                    Some(read) = pump.client_reads.next() => Event::FromClient(read),
                    Some(wrote) = pump.to_client.next() => Event::WroteToClient(wrote),
                    Some(wrote) = pump.to_ssh.next() => Event::WroteToSsh(wrote),
                    _ = pump.stall_tick.tick(), if !pump.to_ssh.is_empty() => Event::StallCheck,
                }
            };

            match event {
                Event::Shutdown => return Ok(TunnelExit::Shutdown),
                Event::Accepted(Ok((stream, peer))) => self.on_accept(pump, stream, peer),
                Event::Accepted(Err(e)) if is_transient_accept_error(&e) => {
                    self.log.warn(&format!("Failed to accept connection: {e}"));
                }
                Event::Accepted(Err(e)) => return Err(TunnelError::Accept(e)),
                Event::TransportLost => {
                    if self.channels.is_empty() {
                        return Ok(TunnelExit::TransportClosed);
                    }
                    if let Some(exit) = self.reconnect(pump, TunnelError::TransportLost).await? {
                        return Ok(exit);
                    }
                }
                Event::Opened(outcome) => self.on_opened(pump, outcome),
                Event::FromSsh(read) => self.on_ssh_read(pump, read).await,
                Event::FromClient(read) => self.on_client_read(pump, read).await,
                Event::WroteToClient(wrote) => self.on_client_written(pump, wrote).await,
                Event::WroteToSsh(wrote) => self.on_ssh_written(pump, wrote).await,
                Event::StallCheck => {
                    let in_flight = !pump.to_ssh.is_empty();
                    if let Err(e) = pump.stall.check(in_flight)
                        && let Some(exit) = self.reconnect(pump, e).await?
                    {
                        return Ok(exit);
                    }
                }
            }
        }
    }

    fn transport_is_lost(&self) -> bool {
        self.transport.as_ref().is_none_or(|t| t.is_closed())
    }

    fn on_accept(&mut self, pump: &mut Pump, stream: TcpStream, peer: SocketAddr) {
        self.log.debug(&format!("Received connection from {peer}"));

        let Some(transport) = &self.transport else {
            self.log.warn("No SSH transport, dropping the connection");
            return;
        };
        if let Err(e) = stream.set_nodelay(true) {
            self.log.debug(&format!("Cannot set TCP_NODELAY for {peer}: {e}"));
        }

        let handle = Arc::clone(&transport.handle);
        let remote_host = self.config.remote_host.clone();
        let remote_port = self.config.remote_port;
        let attempts = self.config.tuning.channel_open_attempts;
        let delay = self.config.tuning.channel_open_delay;

        pump.opening.push(
            async move {
                let result = channel::open_direct_channel(
                    &handle,
                    &remote_host,
                    remote_port,
                    peer,
                    attempts,
                    delay,
                )
                .await;
                OpenOutcome {
                    stream,
                    peer,
                    result,
                }
            }
            .boxed(),
        );
    }

    fn on_opened(&mut self, pump: &mut Pump, outcome: OpenOutcome) {
        let OpenOutcome {
            stream,
            peer,
            result,
        } = outcome;

        // Dropping the stream closes the client socket
        let ssh_channel = match result {
            Ok(ssh_channel) => ssh_channel,
            Err(e) => {
                self.log.warn(&format!("Channel creation failed for {peer}: {e}"));
                return;
            }
        };

        let id = self.next_channel_id();
        channel::reset_on_close(&stream, id);
        let (client_rx, client_tx) = stream.into_split();
        let (ssh_rx, ssh_tx) = tokio::io::split(ssh_channel.into_stream());
        let cancel = self.shutdown.child_token();

        let channel = Channel::new(id, peer, client_tx, ssh_tx, cancel.clone());
        if let Err(e) = self.channels.push(channel) {
            self.log.error(&format!("Cannot register channel for {peer}: {e}"));
            return;
        }

        let size = self.config.tuning.buffer_size;
        pump.client_reads
            .push(arm_read(id, client_rx, vec![0; size], cancel.clone()));
        pump.ssh_reads.push(arm_read(id, ssh_rx, vec![0; size], cancel));

        self.log.debug(&format!(
            "Channel {id} opened: {peer} -> {}",
            self.config.remote_address()
        ));
        self.publish();
    }

    async fn on_ssh_read(&mut self, pump: &mut Pump, read: ReadOutcome<SshReader>) {
        let ReadOutcome {
            id,
            reader,
            buf,
            result,
        } = read;
        // Channel streams end with their transport; that teardown is the
        // transport-lost branch's job
        let lost = self.transport_is_lost();
        let Some(channel) = self.channels.find_mut(|c| c.id() == id) else {
            return;
        };

        match result {
            ReadResult::Cancelled => {}
            ReadResult::Eof | ReadResult::Failed(_) if lost => {}
            ReadResult::Eof => {
                self.log.debug(&format!("Channel {id}: remote end disconnected"));
                self.destroy_channel(id, Teardown::Close).await;
            }
            ReadResult::Failed(e) => {
                self.log.warn(&format!("Channel {id}: error reading from SSH channel: {e}"));
                self.destroy_channel(id, Teardown::Close).await;
            }
            ReadResult::Data(n) => {
                let cancel = channel.cancel_token();
                let Some(mut writer) = channel.take_client_writer() else {
                    self.destroy_channel(id, Teardown::Abort).await;
                    return;
                };
                pump.to_client.push(
                    async move {
                        let result = channel::write_unbounded(&mut writer, &buf[..n], &cancel).await;
                        WriteOutcome {
                            id,
                            reader,
                            writer,
                            buf,
                            result,
                        }
                    }
                    .boxed(),
                );
            }
        }
    }

    async fn on_client_read(&mut self, pump: &mut Pump, read: ReadOutcome<OwnedReadHalf>) {
        let ReadOutcome {
            id,
            reader,
            buf,
            result,
        } = read;
        let tuning = &self.config.tuning;
        let (max_attempts, period) = (tuning.write_attempts, tuning.write_retry_delay);
        let Some(channel) = self.channels.find_mut(|c| c.id() == id) else {
            return;
        };

        match result {
            ReadResult::Cancelled => {}
            ReadResult::Eof => {
                let peer = channel.peer();
                self.log.debug(&format!("Channel {id}: client {peer} disconnected"));
                self.destroy_channel(id, Teardown::Close).await;
            }
            ReadResult::Failed(e) => {
                self.log.warn(&format!("Channel {id}: error reading from client: {e}"));
                self.destroy_channel(id, Teardown::Close).await;
            }
            ReadResult::Data(n) => {
                let cancel = channel.cancel_token();
                let Some(mut writer) = channel.take_ssh_writer() else {
                    self.destroy_channel(id, Teardown::Abort).await;
                    return;
                };
                if pump.to_ssh.is_empty() {
                    pump.stall_tick.reset();
                }
                let progress = pump.stall.counter();
                pump.to_ssh.push(
                    async move {
                        let result = channel::write_bounded(
                            &mut writer,
                            &buf[..n],
                            max_attempts,
                            period,
                            &progress,
                            &cancel,
                        )
                        .await;
                        WriteOutcome {
                            id,
                            reader,
                            writer,
                            buf,
                            result,
                        }
                    }
                    .boxed(),
                );
            }
        }
    }

    async fn on_client_written(&mut self, pump: &mut Pump, wrote: ToClient) {
        let WriteOutcome {
            id,
            reader,
            writer,
            buf,
            result,
        } = wrote;

        match result {
            WriteResult::Cancelled => {}
            WriteResult::Done => {
                if let Some(channel) = self.channels.find_mut(|c| c.id() == id) {
                    channel.restore_client_writer(writer);
                    pump.ssh_reads
                        .push(arm_read(id, reader, buf, channel.cancel_token()));
                }
            }
            WriteResult::Exhausted | WriteResult::Failed(_) => {
                self.on_write_failed(id, Direction::ToClient, result).await;
            }
        }
    }

    async fn on_ssh_written(&mut self, pump: &mut Pump, wrote: ToSsh) {
        let WriteOutcome {
            id,
            reader,
            writer,
            buf,
            result,
        } = wrote;

        match result {
            WriteResult::Cancelled => {}
            WriteResult::Done => {
                if let Some(channel) = self.channels.find_mut(|c| c.id() == id) {
                    channel.restore_ssh_writer(writer);
                    pump.client_reads
                        .push(arm_read(id, reader, buf, channel.cancel_token()));
                }
            }
            WriteResult::Exhausted | WriteResult::Failed(_) => {
                self.on_write_failed(id, Direction::ToSsh, result).await;
            }
        }
    }

    /// Bytes were lost: reset the channel.
    async fn on_write_failed(&mut self, id: ChannelId, direction: Direction, result: WriteResult) {
        match result {
            WriteResult::Exhausted => self.log.warn(&format!(
                "Channel {id}: number of attempts to write to the {direction} exceeded"
            )),
            WriteResult::Failed(e) => {
                self.log.warn(&format!("Channel {id}: error writing to the {direction}: {e}"))
            }
            WriteResult::Done | WriteResult::Cancelled => return,
        }
        self.destroy_channel(id, Teardown::Abort).await;
    }

    /// Replace the SSH leg after a transport failure.
    ///
    /// Returns `Some(exit)` if shutdown was requested while reconnecting.
    async fn reconnect(&mut self, pump: &mut Pump, cause: TunnelError) -> Result<Option<TunnelExit>> {
        self.log.warn(&format!(
            "{cause}; reconnecting to SSH server {}",
            self.config.ssh_address()
        ));

        *pump = Pump::new(&self.config.tuning);
        self.release_transport(Teardown::Abort).await;
        self.set_state(SessionState::ConnectingSsh);

        let shutdown = self.shutdown.clone();
        let (transport, retries) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(Some(TunnelExit::Shutdown)),
            result = client::connect_with_retry(&self.config) => result?,
        };

        self.transport = Some(transport);
        self.connected_at = Some(Utc::now());
        self.reconnects += 1;
        self.set_state(SessionState::Running);
        self.log.info(&format!(
            "Reconnected to SSH server {} ({} retries)",
            self.config.ssh_address(),
            retries
        ));
        Ok(None)
    }

    /// Remove a channel from the registry and release it. A channel that is
    /// already gone is ignored.
    pub(super) async fn destroy_channel(&mut self, id: ChannelId, teardown: Teardown) {
        let Ok(mut channel) = self.channels.remove_where(|c| c.id() == id) else {
            return;
        };
        channel.close(teardown).await;
        self.log.debug(&format!("Channel {id} for {} closed", channel.peer()));
        self.publish();
    }
}
