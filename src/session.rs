//! The [`Session`] type and the [`SessionHandler`] trait applications
//! implement to use it.
//!
//! # Lifecycle
//!
//! ```text
//!   Created ──start──> Active ──disconnect / I/O error / EOF──> Disconnecting ──> Closed
//!      │                                                                          ^
//!      └──────────────────────────── disconnect ─────────────────────────────────┘
//! ```
//!
//! Starting a session splits its stream between two tasks. The reader task
//! owns the [`RecvWindow`] and loops through read, commit, parse, consume and
//! compact. The writer task sleeps until [`Session::send`] queues something on
//! an idle session, then drains the queue in gathered writes until it is
//! empty again. Teardown cancels both tasks, which drops both halves of the
//! stream and so closes the connection.

use crate::{config::SessionConfig, recv_window::RecvWindow, SessionId, SessionRegistry};
use bytes::Bytes;
use std::{
    fmt, io,
    io::IoSlice,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};
use thiserror::Error as ThisError;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Notify,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod send_queue;
use send_queue::SendQueue;

/// The application half of a session.
///
/// Every callback runs synchronously inside the session's reader or writer
/// task, or inside whichever call triggered a teardown, and must not block.
pub trait SessionHandler: Send + Sync + 'static {
    /// The session became active. Sends made here are written first.
    fn on_connected(&self, _session: &Session) {}

    /// Called with every unconsumed byte received so far. Returns how many of
    /// them, counted from the front, were consumed. The rest stay buffered and
    /// are presented again, followed by newer bytes, on the next call.
    ///
    /// Returning more than `data.len()` tears the session down.
    fn on_receive(&self, session: &Session, data: &[u8]) -> usize;

    /// A gathered write of `bytes` bytes completed.
    fn on_send(&self, _session: &Session, _bytes: usize) {}

    /// The session was torn down. Called exactly once.
    fn on_disconnected(&self, _session: &Session, _reason: &DisconnectReason) {}
}

/// Produces the application half of each new session.
pub trait SessionFactory: Send + Sync + 'static {
    fn create(&self, id: SessionId) -> Box<dyn SessionHandler>;
}

impl<F, H> SessionFactory for F
where
    F: Fn(SessionId) -> H + Send + Sync + 'static,
    H: SessionHandler,
{
    fn create(&self, id: SessionId) -> Box<dyn SessionHandler> {
        Box::new(self(id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Constructed but not yet given a stream.
    Created,
    /// Reading and writing.
    Active,
    /// Teardown has begun and callbacks are running.
    Disconnecting,
    /// Terminal. Teardown callbacks have returned; the stream is released as
    /// soon as the reader and writer tasks observe the cancellation.
    Closed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Active,
            2 => Self::Disconnecting,
            _ => Self::Closed,
        }
    }
}

/// Why a session was torn down.
#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    #[error("Disconnected locally")]
    Local,
    #[error("The peer closed the connection")]
    PeerClosed,
    #[error("I/O error: {0}")]
    Io(io::ErrorKind),
    #[error("The receive window filled up without the handler consuming anything")]
    RecvBufferFull,
    #[error("The handler consumed {consumed} bytes with only {available} buffered")]
    OverConsumed { consumed: usize, available: usize },
    #[error("Received a malformed packet frame")]
    MalformedFrame,
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("The session is disconnected")]
    Closed,
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum StartError {
    #[error("The session was already started")]
    AlreadyStarted,
    #[error("The session was disconnected before it started")]
    Closed,
}

/// What the reader task does after a read completes.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReceiveStep {
    Rearm,
    Teardown(DisconnectReason),
}

/// One connection: its stream, receive window, outbound queue and the
/// application handler driving it.
pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    config: SessionConfig,
    handler: Box<dyn SessionHandler>,
    state: AtomicU8,
    disconnected: AtomicBool,
    outbound: Mutex<SendQueue>,
    /// Woken when a send lands on a session with no write in flight.
    send_ready: Notify,
    /// Cancelled exactly once, by teardown.
    closed: CancellationToken,
    registry: Weak<SessionRegistry>,
}

impl Session {
    /// Creates a session that no registry tracks.
    pub fn new(
        id: SessionId,
        peer: SocketAddr,
        config: SessionConfig,
        handler: Box<dyn SessionHandler>,
    ) -> Arc<Self> {
        Self::registered(id, peer, config, handler, Weak::new())
    }

    pub(crate) fn registered(
        id: SessionId,
        peer: SocketAddr,
        config: SessionConfig,
        handler: Box<dyn SessionHandler>,
        registry: Weak<SessionRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer,
            config,
            handler,
            state: AtomicU8::new(SessionState::Created as u8),
            disconnected: AtomicBool::new(false),
            outbound: Default::default(),
            send_ready: Notify::new(),
            closed: CancellationToken::new(),
            registry,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Takes ownership of a connected stream, notifies the handler and arms
    /// the first read. Must be called from within a Tokio runtime.
    pub fn start<S>(self: &Arc<Self>, stream: S) -> Result<(), StartError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if let Err(current) = self.state.compare_exchange(
            SessionState::Created as u8,
            SessionState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(match SessionState::from_u8(current) {
                SessionState::Active => StartError::AlreadyStarted,
                _ => StartError::Closed,
            });
        }
        if self.is_disconnected() {
            // torn down between the transition and here; dropping the stream
            // closes it
            return Ok(());
        }
        let (reader, writer) = tokio::io::split(stream);
        debug!(session = %self.id, peer = %self.peer, "Session started");
        self.handler.on_connected(self);
        tokio::spawn(self.clone().run_send(writer));
        tokio::spawn(self.clone().run_receive(reader));
        Ok(())
    }

    /// Queues `region` to be written after everything sent before it. Empty
    /// regions are ignored.
    pub fn send(&self, region: impl Into<Bytes>) -> Result<(), SendError> {
        if self.is_disconnected() {
            return Err(SendError::Closed);
        }
        let region = region.into();
        if region.is_empty() {
            return Ok(());
        }
        if self.queue().push(region) {
            self.send_ready.notify_one();
        }
        Ok(())
    }

    /// Tears the session down. Safe to call any number of times from any
    /// thread; only the first call has an effect.
    pub fn disconnect(&self) {
        self.disconnect_with(DisconnectReason::Local)
    }

    /// Like [`disconnect`](Session::disconnect), reporting `reason` to the
    /// handler.
    pub fn disconnect_with(&self, reason: DisconnectReason) {
        if self
            .disconnected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.state
            .store(SessionState::Disconnecting as u8, Ordering::Release);
        self.closed.cancel();
        self.queue().clear();
        info!(session = %self.id, peer = %self.peer, %reason, "Session disconnected");
        self.handler.on_disconnected(self, &reason);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        self.state.store(SessionState::Closed as u8, Ordering::Release);
    }

    /// Resolves once teardown has begun.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn queue(&self) -> MutexGuard<'_, SendQueue> {
        // every transition leaves the queue consistent, so a panic elsewhere
        // cannot have left it half updated
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_receive<R>(self: Arc<Self>, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut window = RecvWindow::new(self.config.recv_buffer_size);
        loop {
            window.compact();
            if window.free_size() == 0 {
                self.disconnect_with(DisconnectReason::RecvBufferFull);
                break;
            }
            let result = tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                result = reader.read(window.writable()) => result,
            };
            if let ReceiveStep::Teardown(reason) = self.receive_step(&mut window, result) {
                self.disconnect_with(reason);
                break;
            }
        }
        debug!(session = %self.id, "Receive loop finished");
    }

    /// Applies one completed read to the window and lets the handler consume
    /// from it.
    pub(crate) fn receive_step(
        &self,
        window: &mut RecvWindow,
        result: io::Result<usize>,
    ) -> ReceiveStep {
        let received = match result {
            Ok(0) => return ReceiveStep::Teardown(DisconnectReason::PeerClosed),
            Ok(received) => received,
            Err(e) => return ReceiveStep::Teardown(DisconnectReason::Io(e.kind())),
        };
        if self.is_disconnected() {
            return ReceiveStep::Teardown(DisconnectReason::Local);
        }
        if window.commit_write(received).is_err() {
            return ReceiveStep::Teardown(DisconnectReason::RecvBufferFull);
        }
        let available = window.data_size();
        let consumed = self.handler.on_receive(self, window.readable());
        if window.commit_read(consumed).is_err() {
            return ReceiveStep::Teardown(DisconnectReason::OverConsumed {
                consumed,
                available,
            });
        }
        ReceiveStep::Rearm
    }

    async fn run_send<W>(self: Arc<Self>, mut writer: W)
    where
        W: AsyncWrite + Unpin,
    {
        'idle: loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                _ = self.send_ready.notified() => {}
            }
            loop {
                let batch = self.queue().take_batch();
                let Some(batch) = batch else {
                    continue 'idle;
                };
                let result = tokio::select! {
                    biased;
                    _ = self.closed.cancelled() => break 'idle,
                    result = write_gathered(&mut writer, &batch) => result,
                };
                if let Err(e) = result {
                    self.disconnect_with(DisconnectReason::Io(e.kind()));
                    break 'idle;
                }
                if self.is_disconnected() {
                    // on_disconnected has run or is running
                    break 'idle;
                }
                let sent = self.queue().complete();
                self.handler.on_send(&self, sent);
            }
        }
        let _ = writer.shutdown().await;
        debug!(session = %self.id, "Send loop finished");
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Writes every region of `batch` in order, continuing after short writes,
/// and returns the total written.
async fn write_gathered<W>(writer: &mut W, batch: &[Bytes]) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let total = batch.iter().map(Bytes::len).sum();
    let mut index = 0;
    let mut offset = 0;
    while index < batch.len() {
        let slices: Vec<IoSlice<'_>> = std::iter::once(&batch[index][offset..])
            .chain(batch[index + 1..].iter().map(|region| &region[..]))
            .map(IoSlice::new)
            .collect();
        let mut written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        while index < batch.len() {
            let left = batch[index].len() - offset;
            if written < left {
                offset += written;
                break;
            }
            written -= left;
            index += 1;
            offset = 0;
        }
    }
    writer.flush().await?;
    Ok(total)
}
