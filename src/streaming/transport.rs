//! WebSocket transport to the voice server
//!
//! Manages the connection lifecycle of one streaming channel.
//!
//! # Connection Flow
//!
//! 1. `connect()` - WebSocket handshake (with retries); the link is `Open` and
//!    `TransportEvent::Opened` is emitted once it completes
//! 2. `sender()` - cloneable, non-blocking send primitive for capture blocks
//! 3. Inbound frames are parsed, decoded and emitted as `TransportEvent`s
//! 4. `close()` - clean shutdown; remote closure emits `TransportEvent::Closed`
//!
//! # Retry Strategy
//!
//! Initial connection retries with exponential backoff (1s, 2s, 4s by default).
//! Mid-session disconnects do NOT reconnect automatically.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;

use super::codec::{self, SampleFrame};
use super::protocol::{ClientMessage, ServerMessage};
use super::TransportError;

/// Identifies one transport instance; sessions are bound to it
pub type ConnectionId = Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type EmitFn = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Connection state of the streaming channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Open = 2,
    Closed = 3,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LinkState::Connecting,
            2 => LinkState::Open,
            3 => LinkState::Closed,
            _ => LinkState::Disconnected,
        }
    }
}

/// Link state shared between the transport tasks and every `AudioSender`
#[derive(Debug, Clone)]
struct Link(Arc<AtomicU8>);

impl Link {
    fn new(state: LinkState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    fn get(&self) -> LinkState {
        LinkState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: LinkState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Events produced by the transport for the rest of the client
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake complete; emitted before any message from this connection
    Opened { connection: ConnectionId },
    /// Server assigned the session identity
    SessionAssigned {
        connection: ConnectionId,
        session_id: String,
    },
    /// Server terminated the session
    SessionEnded { connection: ConnectionId },
    /// Decoded synthesized audio, ready for playback
    Audio {
        connection: ConnectionId,
        samples: SampleFrame,
    },
    /// Channel closed (locally or remotely); emitted once per connection
    Closed {
        connection: ConnectionId,
        reason: String,
    },
}

/// Route one parsed server message.
///
/// Audio is decoded here so undecodable chunks never leave the transport.
pub fn dispatch(connection: ConnectionId, msg: ServerMessage) -> Option<TransportEvent> {
    match msg {
        ServerMessage::SessionId { session_id } => Some(TransportEvent::SessionAssigned {
            connection,
            session_id,
        }),
        ServerMessage::SessionEnd => Some(TransportEvent::SessionEnded { connection }),
        ServerMessage::AudioChunk { audio } => codec::decode_for_playback(&audio)
            .map(|samples| TransportEvent::Audio {
                connection,
                samples,
            }),
        ServerMessage::Unrecognized => {
            log::debug!("Transport: ignoring unrecognized message");
            None
        }
    }
}

/// Tunables for establishing the connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Timeout for each WebSocket handshake attempt
    pub connect_timeout: Duration,
    /// Total connection attempts before giving up
    pub attempts: u32,
    /// Base delay for exponential backoff (doubles each retry)
    pub retry_base_delay: Duration,
    /// Outbound frames buffered for the writer before new ones are dropped
    pub send_queue_frames: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            send_queue_frames: 32,
        }
    }
}

/// Result of offering a frame to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame handed to the writer
    Queued,
    /// Link not open; frame dropped
    LinkDown,
    /// Writer is behind; frame dropped rather than delaying live audio
    Backpressure,
}

enum Outbound {
    Frame(ClientMessage),
    Close,
}

#[derive(Debug, Default)]
struct SendCounters {
    queued: AtomicU64,
    dropped: AtomicU64,
}

/// Non-blocking send primitive for outbound audio.
///
/// Safe to call from the audio device thread. Never waits on the network.
#[derive(Clone)]
pub struct AudioSender {
    link: Link,
    tx: mpsc::Sender<Outbound>,
    counters: Arc<SendCounters>,
}

impl AudioSender {
    fn new(link: Link, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            link,
            tx,
            counters: Arc::new(SendCounters::default()),
        }
    }

    /// A sender with no connection behind it; every frame is dropped
    pub fn closed() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self::new(Link::new(LinkState::Closed), tx)
    }

    /// Encode and queue one capture block
    pub fn offer(&self, samples: &[f32]) -> SendOutcome {
        if self.link.get() != LinkState::Open {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return SendOutcome::LinkDown;
        }

        let outcome = match self.tx.try_send(Outbound::Frame(codec::encode(samples))) {
            Ok(()) => SendOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Backpressure,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::LinkDown,
        };

        match outcome {
            SendOutcome::Queued => self.counters.queued.fetch_add(1, Ordering::Relaxed),
            _ => self.counters.dropped.fetch_add(1, Ordering::Relaxed),
        };
        outcome
    }

    /// Current link state as seen by this sender
    pub fn link_state(&self) -> LinkState {
        self.link.get()
    }

    /// (queued, dropped) frame counts since the connection opened
    pub fn counts(&self) -> (u64, u64) {
        (
            self.counters.queued.load(Ordering::Relaxed),
            self.counters.dropped.load(Ordering::Relaxed),
        )
    }
}

/// Emits `Closed` at most once per connection
#[derive(Clone)]
struct CloseNotifier {
    connection: ConnectionId,
    link: Link,
    fired: Arc<AtomicBool>,
    emit: EmitFn,
}

impl CloseNotifier {
    fn notify(&self, reason: String) {
        self.link.set(LinkState::Closed);
        if !self.fired.swap(true, Ordering::SeqCst) {
            log::info!("Transport: connection {} closed ({})", self.connection, reason);
            (self.emit)(TransportEvent::Closed {
                connection: self.connection,
                reason,
            });
        }
    }
}

/// Longest wait between connection attempts
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Delay before retry `attempt` (1-based): base, 2x base, 4x base, ...
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.checked_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .unwrap_or(MAX_RETRY_DELAY)
        .min(MAX_RETRY_DELAY)
}

/// Handle to an open streaming connection
///
/// Owns the WebSocket through its reader and writer tasks.
pub struct TransportSession {
    id: ConnectionId,
    link: Link,
    sender: AudioSender,
    notifier: CloseNotifier,
    reader_task: tokio::task::JoinHandle<()>,
    writer_task: Option<tokio::task::JoinHandle<()>>,
}

impl TransportSession {
    /// Connect to the voice server
    ///
    /// Inbound events are delivered on `events` until the channel closes.
    pub async fn connect<E>(
        url: &str,
        options: &ConnectOptions,
        events: mpsc::UnboundedSender<E>,
    ) -> Result<Self, TransportError>
    where
        E: From<TransportEvent> + Send + 'static,
    {
        let link = Link::new(LinkState::Connecting);
        let mut last_error = None;

        for attempt in 0..options.attempts.max(1) {
            if attempt > 0 {
                let delay = backoff_delay(options.retry_base_delay, attempt);
                log::info!(
                    "Retrying WebSocket connection in {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    options.attempts
                );
                tokio::time::sleep(delay).await;
            }

            match Self::try_connect(url, options).await {
                Ok(ws_stream) => {
                    let emit: EmitFn = Arc::new(move |event| {
                        if events.send(E::from(event)).is_err() {
                            log::debug!("Transport: event receiver dropped");
                        }
                    });
                    return Ok(Self::start(ws_stream, link, options, emit));
                }
                Err(e @ TransportError::InvalidUrl(_)) => {
                    link.set(LinkState::Disconnected);
                    return Err(e);
                }
                Err(e) => {
                    log::warn!("Connection attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        link.set(LinkState::Disconnected);
        Err(last_error.unwrap_or_else(|| {
            TransportError::ConnectionFailed("Max retries exceeded".to_string())
        }))
    }

    /// Single handshake attempt (no retries)
    async fn try_connect(url: &str, options: &ConnectOptions) -> Result<WsStream, TransportError> {
        let request = url
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", url, e)))?;

        log::info!("Connecting to voice server at {}...", url);

        let (ws_stream, _response) = timeout(
            options.connect_timeout,
            connect_async_with_config(
                request, None, true, // disable_nagle: small frames, latency matters
            ),
        )
        .await
        .map_err(|_| TransportError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        Ok(ws_stream)
    }

    /// Spawn reader and writer tasks over an established socket
    fn start(ws_stream: WsStream, link: Link, options: &ConnectOptions, emit: EmitFn) -> Self {
        let id = Uuid::new_v4();
        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(options.send_queue_frames.max(1));

        let notifier = CloseNotifier {
            connection: id,
            link: link.clone(),
            fired: Arc::new(AtomicBool::new(false)),
            emit: emit.clone(),
        };

        link.set(LinkState::Open);
        log::info!("Transport: connection {} open", id);
        emit(TransportEvent::Opened { connection: id });

        let writer_notifier = notifier.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                match out {
                    Outbound::Frame(msg) => {
                        let json = match msg.to_json() {
                            Ok(json) => json,
                            Err(e) => {
                                log::warn!("Transport: failed to serialize frame: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(json)).await {
                            writer_notifier.notify(format!("send failed: {}", e));
                            break;
                        }
                    }
                    Outbound::Close => {
                        if let Err(e) = write.close().await {
                            log::warn!("Error closing WebSocket: {}", e);
                        }
                        break;
                    }
                }
            }
            log::debug!("Writer task exiting");
        });

        let reader_notifier = notifier.clone();
        let reader_task = tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let msg = ServerMessage::parse(&text);
                        log::trace!("Transport: received {}", msg.kind());
                        if let Some(event) = dispatch(id, msg) {
                            emit(event);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("closed by server: {}", f.reason))
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => {} // Ignore ping/pong/binary
                    Some(Err(e)) => break format!("WebSocket error: {}", e),
                    None => break "stream ended".to_string(),
                }
            };
            reader_notifier.notify(reason);
            log::debug!("Reader task exiting");
        });

        Self {
            id,
            sender: AudioSender::new(link.clone(), out_tx),
            link,
            notifier,
            reader_task,
            writer_task: Some(writer_task),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> LinkState {
        self.link.get()
    }

    /// Send primitive for the capture path
    pub fn sender(&self) -> AudioSender {
        self.sender.clone()
    }

    /// Gracefully close the connection
    ///
    /// Sends a close frame, stops both tasks and emits `Closed` if the remote
    /// side has not already done so.
    pub async fn close(mut self) {
        log::info!("Transport: closing connection {}...", self.id);
        self.link.set(LinkState::Closed);

        if self.sender.tx.try_send(Outbound::Close).is_ok() {
            if let Some(writer) = self.writer_task.take() {
                if timeout(Duration::from_secs(1), writer).await.is_err() {
                    log::warn!("Transport: writer did not finish closing in time");
                }
            }
        }

        self.reader_task.abort();
        self.notifier.notify("closed locally".to_string());
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.reader_task.abort();
        if let Some(writer) = self.writer_task.take() {
            writer.abort();
        }
    }
}
