//! Message broker - sole owner of the transport.
//!
//! Flow:
//! 1. `start`/`connect` claims the broker and spawns the worker loop
//! 2. Producers `enqueue` envelopes from any task
//! 3. Each loop iteration drains up to `batch_size` outbound envelopes, then
//!    (only if nothing was sent) makes up to `batch_size` read attempts, then
//!    (only if neither side had work) idles for `idle_interval`
//! 4. Inbound envelopes are handed to the receiver returned by `start`
//! 5. `stop` or loss of the stream ends the loop; the receiver then closes
//!
//! A failed send or receive is logged and the loop moves on. Only a broken
//! stream or a desynchronised frame boundary ends it.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use tokio::io::AsyncWrite;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{FrameError, FrameReader, encode_pooled, write_frame};
use crate::bridge::pool::BufferPool;
use crate::bridge::protocol::{Envelope, EnvelopeId, MessageType};
use crate::bridge::transport::{Transport, TransportInfo, connect_transport};
use crate::config::BrokerConfig;

/// Lifecycle of the broker's connection. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker already started")]
    AlreadyStarted,
    #[error("broker is closed")]
    Closed,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("transport unavailable: {0}")]
    Transport(#[from] io::Error),
}

/// Where outbound envelopes go.
///
/// This abstraction lets the dispatcher be tested without a transport.
pub trait EnvelopeSink: Send + Sync {
    fn enqueue(&self, envelope: Envelope) -> Result<(), BrokerError>;
}

#[derive(Debug, Default)]
struct BrokerStats {
    iterations: AtomicU64,
    idle_waits: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    send_failures: AtomicU64,
    receive_failures: AtomicU64,
}

/// Point-in-time copy of the broker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStatsSnapshot {
    pub iterations: u64,
    pub idle_waits: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub send_failures: u64,
    pub receive_failures: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Default)]
struct Outbound {
    queue: VecDeque<Envelope>,
    closed: bool,
}

enum LoopExit {
    Cancelled,
    PeerClosed,
    TransportLost,
}

/// The stream is unusable after these; anything else only costs one frame.
fn is_fatal(err: &FrameError) -> bool {
    match err {
        FrameError::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::UnexpectedEof
        ),
        // Body bytes of the rejected frame are still in the stream.
        FrameError::TooLarge { .. } => true,
        // The peer holds part of a frame; anything written next would be
        // read as its remainder.
        FrameError::PartialWrite { .. } => true,
        FrameError::Truncated { .. } => false,
    }
}

pub struct MessageBroker {
    config: BrokerConfig,
    pool: Arc<BufferPool>,
    state: watch::Sender<ConnectionState>,
    outbound: StdMutex<Outbound>,
    outbound_ready: Notify,
    next_id: AtomicI64,
    cancel: CancellationToken,
    worker: StdMutex<Option<JoinHandle<()>>>,
    stop_requested: AtomicBool,
    stats: BrokerStats,
}

impl MessageBroker {
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        Self::with_pool(config, BufferPool::new())
    }

    pub fn with_pool(config: BrokerConfig, pool: Arc<BufferPool>) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            config,
            pool,
            state,
            outbound: StdMutex::new(Outbound::default()),
            outbound_ready: Notify::new(),
            next_id: AtomicI64::new(0),
            cancel: CancellationToken::new(),
            worker: StdMutex::new(None),
            stop_requested: AtomicBool::new(false),
            stats: BrokerStats::default(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Wait until the broker reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Envelopes waiting to be written.
    pub fn pending(&self) -> usize {
        self.lock_outbound().queue.len()
    }

    pub fn stats(&self) -> BrokerStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        BrokerStatsSnapshot {
            iterations: load(&self.stats.iterations),
            idle_waits: load(&self.stats.idle_waits),
            frames_sent: load(&self.stats.frames_sent),
            frames_received: load(&self.stats.frames_received),
            send_failures: load(&self.stats.send_failures),
            receive_failures: load(&self.stats.receive_failures),
        }
    }

    /// Open the transport described by `info` and start the worker loop.
    ///
    /// On failure the broker ends up `Closed`; the caller decides whether
    /// that is fatal.
    pub async fn connect(
        self: &Arc<Self>,
        info: &TransportInfo,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, BrokerError> {
        self.claim()?;
        match connect_transport(info).await {
            Ok(transport) => Ok(self.launch(transport)),
            Err(e) => {
                tracing::error!(transport = %info, error = %e, "Failed to open transport");
                self.close_outbound();
                self.advance(ConnectionState::Closing);
                self.advance(ConnectionState::Closed);
                Err(BrokerError::Transport(e))
            }
        }
    }

    /// Start the worker loop over an already open transport.
    pub fn start(
        self: &Arc<Self>,
        transport: Transport,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, BrokerError> {
        self.claim()?;
        Ok(self.launch(transport))
    }

    /// Queue an envelope for transmission. Never waits for the write.
    pub fn enqueue(&self, envelope: Envelope) -> Result<(), BrokerError> {
        if envelope.kind == MessageType::Unknown {
            return Err(BrokerError::InvalidArgument(format!(
                "envelope {} has no message type",
                envelope.id
            )));
        }
        {
            let mut outbound = self.lock_outbound();
            if outbound.closed {
                return Err(BrokerError::Closed);
            }
            outbound.queue.push_back(envelope);
        }
        self.outbound_ready.notify_one();
        Ok(())
    }

    /// Queue a `Ready` envelope with a fresh id.
    pub fn send_ready(&self) -> Result<EnvelopeId, BrokerError> {
        let id = EnvelopeId::new(self.next_id.fetch_add(1, Ordering::AcqRel));
        self.enqueue(Envelope::ready(id))?;
        tracing::debug!(%id, "Queued ready message");
        Ok(id)
    }

    /// Close the broker: drop queued envelopes, end the loop, release the
    /// transport. Later calls return immediately.
    ///
    /// Returns `true` only for the call that performed the shutdown.
    pub async fn stop(&self) -> bool {
        if self.stop_requested.swap(true, Ordering::AcqRel) {
            tracing::trace!("Broker stop already requested");
            return false;
        }

        let dropped = self.close_outbound();
        tracing::info!(dropped, "Stopping message broker");
        self.advance(ConnectionState::Closing);
        self.cancel.cancel();

        let handle = self.lock_worker().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "Broker worker task failed");
        }
        self.advance(ConnectionState::Closed);
        true
    }

    fn claim(&self) -> Result<(), BrokerError> {
        let mut claimed = false;
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                claimed = true;
                true
            } else {
                false
            }
        });
        if claimed {
            return Ok(());
        }
        match self.state() {
            ConnectionState::Closing | ConnectionState::Closed => Err(BrokerError::Closed),
            _ => Err(BrokerError::AlreadyStarted),
        }
    }

    fn launch(self: &Arc<Self>, transport: Transport) -> mpsc::UnboundedReceiver<Envelope> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tracing::info!(transport = %transport.label(), "Message broker connected");
        self.advance(ConnectionState::Connected);

        let handle = tokio::spawn(Arc::clone(self).run(transport, inbound_tx));
        *self.lock_worker() = Some(handle);
        inbound_rx
    }

    fn advance(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if next > *state {
                tracing::trace!(from = %state, to = %next, "Connection state changed");
                *state = next;
                true
            } else {
                false
            }
        });
    }

    /// Reject further envelopes and drop the queued ones. Returns how many were dropped.
    fn close_outbound(&self) -> usize {
        let mut outbound = self.lock_outbound();
        outbound.closed = true;
        let dropped = outbound.queue.len();
        outbound.queue.clear();
        dropped
    }

    fn pop_outbound(&self) -> Option<Envelope> {
        self.lock_outbound().queue.pop_front()
    }

    fn lock_outbound(&self) -> std::sync::MutexGuard<'_, Outbound> {
        self.outbound.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Outbound queue mutex poisoned");
            poisoned.into_inner()
        })
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Broker worker handle mutex poisoned");
            poisoned.into_inner()
        })
    }

    async fn write_envelope<W>(&self, writer: &mut W, envelope: &Envelope) -> Result<(), FrameError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let json = envelope
            .to_bytes()
            .map_err(|e| FrameError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        let frame = encode_pooled(&json, &self.pool)?;
        write_frame(writer, &frame, self.config.max_transfer_size).await?;
        Ok(())
    }

    fn dispatch_frame(&self, frame: &[u8], inbound: &mpsc::UnboundedSender<Envelope>) {
        match Envelope::from_slice(frame) {
            Ok(envelope) => {
                bump(&self.stats.frames_received);
                tracing::debug!(id = %envelope.id, kind = %envelope.kind, "Received envelope");
                if inbound.send(envelope).is_err() {
                    tracing::debug!("Inbound receiver dropped, discarding envelope");
                }
            }
            Err(e) => {
                bump(&self.stats.receive_failures);
                tracing::warn!(error = %e, frame_len = frame.len(), "Discarding undecodable frame");
            }
        }
    }

    async fn run(self: Arc<Self>, transport: Transport, inbound: mpsc::UnboundedSender<Envelope>) {
        let (reader, mut writer) = transport.into_split();
        let mut frames = FrameReader::new(reader, Arc::clone(&self.pool))
            .with_limits(self.config.max_transfer_size, self.config.max_frame_len);
        let batch = self.config.batch_size.max(1);

        let exit = 'run: loop {
            if self.cancel.is_cancelled() {
                break LoopExit::Cancelled;
            }
            bump(&self.stats.iterations);

            let mut sent = 0;
            while sent < batch {
                let Some(envelope) = self.pop_outbound() else {
                    break;
                };
                sent += 1;

                let result = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break 'run LoopExit::Cancelled,
                    r = self.write_envelope(&mut writer, &envelope) => r,
                };
                match result {
                    Ok(()) => {
                        bump(&self.stats.frames_sent);
                        tracing::trace!(id = %envelope.id, kind = %envelope.kind, "Sent envelope");
                    }
                    Err(e) => {
                        bump(&self.stats.send_failures);
                        tracing::warn!(id = %envelope.id, kind = %envelope.kind, error = %e, "Failed to send envelope");
                        if is_fatal(&e) {
                            break 'run LoopExit::TransportLost;
                        }
                    }
                }
            }

            let mut received = 0;
            if sent == 0 {
                for _ in 0..batch {
                    let attempt = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break 'run LoopExit::Cancelled,
                        r = tokio::time::timeout(self.config.read_poll_interval, frames.read_frame()) => r,
                    };
                    match attempt {
                        // Nothing available this iteration.
                        Err(_) => break,
                        Ok(Ok(Some(frame))) => {
                            received += 1;
                            self.dispatch_frame(&frame, &inbound);
                        }
                        Ok(Ok(None)) => break 'run LoopExit::PeerClosed,
                        Ok(Err(e)) => {
                            bump(&self.stats.receive_failures);
                            tracing::warn!(error = %e, "Failed to read frame");
                            if is_fatal(&e) {
                                break 'run LoopExit::TransportLost;
                            }
                            break;
                        }
                    }
                }
            }

            if sent == 0 && received == 0 {
                bump(&self.stats.idle_waits);
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break 'run LoopExit::Cancelled,
                    _ = self.outbound_ready.notified() => {}
                    _ = tokio::time::sleep(self.config.idle_interval) => {}
                }
            }
        };

        match exit {
            LoopExit::Cancelled => tracing::debug!("Broker loop cancelled"),
            LoopExit::PeerClosed => tracing::info!("Peer closed the message stream"),
            LoopExit::TransportLost => tracing::error!("Message stream broken, closing broker"),
        }

        let dropped = self.close_outbound();
        if dropped > 0 {
            tracing::warn!(dropped, "Discarded queued envelopes on close");
        }
        self.advance(ConnectionState::Closing);
        drop(frames);
        drop(writer);
        self.advance(ConnectionState::Closed);
    }
}

impl EnvelopeSink for MessageBroker {
    fn enqueue(&self, envelope: Envelope) -> Result<(), BrokerError> {
        MessageBroker::enqueue(self, envelope)
    }
}
