//! Duplex WebSocket session with the live voice endpoint
//!
//! `connect` resolves once the server confirms setup, so a returned link is
//! always usable. After that a writer task drains the bounded outbound queue
//! in submission order and a reader task forwards every inbound message to
//! the controller as a [`LiveEvent`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::protocol::{
    ClientMessage, Content, GenerationConfig, Modality, ServerMessage, Setup, SpeechConfig,
};
use crate::voice::TransportEnvelope;
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Identifies one connection attempt of a controller
pub type SessionId = u64;

/// Default number of frames the outbound queue holds
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Event delivered to the controller, tagged with its session
#[derive(Debug)]
pub struct LiveEvent {
    pub session: SessionId,
    pub kind: SessionEvent,
}

/// What happened on a session
pub enum SessionEvent {
    /// The link is usable; audio may now be sent
    Open(Box<dyn LiveLink>),
    /// The link could not be established
    ConnectFailed(Error),
    /// Inbound message from the server
    Message(ServerMessage),
    /// Transport failure; the session is dead
    Error(String),
    /// Remote side closed the session
    Closed(Option<String>),
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open(_) => f.write_str("Open"),
            Self::ConnectFailed(e) => f.debug_tuple("ConnectFailed").field(e).finish(),
            Self::Message(m) => f.debug_tuple("Message").field(m).finish(),
            Self::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Self::Closed(r) => f.debug_tuple("Closed").field(r).finish(),
        }
    }
}

/// Non-blocking handle onto a session's bounded outbound queue
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<TransportEnvelope>,
    dropped: Arc<AtomicU64>,
}

impl OutboundSender {
    /// Create a sender and the receiver its single consumer drains
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TransportEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Queue one frame without waiting
    ///
    /// A full queue drops the frame and counts it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` if the session is gone
    pub fn send(&self, envelope: TransportEnvelope) -> Result<()> {
        match self.tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 50 == 0 {
                    tracing::warn!(dropped, "outbound queue full, dropping audio frame");
                }
                Ok(())
            }
            Err(TrySendError::Closed(_)) => {
                Err(Error::Connection("session outbound queue closed".to_string()))
            }
        }
    }

    /// Frames dropped because the queue was full
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether the consumer has gone away
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An open link as seen by the controller
pub trait LiveLink: Send {
    /// Handle for submitting outbound frames
    fn outbound(&self) -> OutboundSender;

    /// Tear the link down locally; remote close is best-effort
    fn close(&mut self);
}

/// Something that can open links to a live voice service
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Open a link; resolves once the link is usable
    ///
    /// Inbound traffic is delivered on `events` tagged with `session`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` if the link cannot be established
    async fn connect(
        &self,
        session: SessionId,
        events: mpsc::UnboundedSender<LiveEvent>,
    ) -> Result<Box<dyn LiveLink>>;
}

/// Connection parameters for the live endpoint
#[derive(Debug)]
pub struct LiveConfig {
    /// WebSocket endpoint
    pub endpoint: Url,
    /// API key, sent as the `key` query parameter
    pub api_key: SecretString,
    /// Model identifier
    pub model: String,
    /// Prebuilt voice name
    pub voice_name: String,
    /// System instruction for the assistant
    pub system_instruction: String,
    /// Outbound queue capacity in frames
    pub outbound_capacity: usize,
}

impl LiveConfig {
    /// Endpoint URL including the API key
    #[must_use]
    pub fn connect_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("key", self.api_key.expose_secret());
        url
    }

    /// Setup message announcing modality, voice and instruction
    #[must_use]
    pub fn setup(&self) -> Setup {
        let model = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };

        let system_instruction = if self.system_instruction.trim().is_empty() {
            None
        } else {
            Some(Content::text(self.system_instruction.clone()))
        };

        Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![Modality::Audio],
                speech_config: Some(SpeechConfig::prebuilt(self.voice_name.clone())),
            },
            system_instruction,
        }
    }
}

/// Live voice transport over WebSocket
#[derive(Debug)]
pub struct GeminiLive {
    config: LiveConfig,
}

impl GeminiLive {
    #[must_use]
    pub const fn new(config: LiveConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl VoiceTransport for GeminiLive {
    async fn connect(
        &self,
        session: SessionId,
        events: mpsc::UnboundedSender<LiveEvent>,
    ) -> Result<Box<dyn LiveLink>> {
        let link = LiveSession::connect(&self.config, session, events).await?;
        Ok(Box::new(link))
    }
}

/// An established WebSocket session
pub struct LiveSession {
    outbound: OutboundSender,
    close_tx: Option<oneshot::Sender<()>>,
    reader: JoinHandle<()>,
}

impl LiveSession {
    /// Connect, send setup and wait for the server to confirm it
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` if the handshake or setup fails
    pub async fn connect(
        config: &LiveConfig,
        session: SessionId,
        events: mpsc::UnboundedSender<LiveEvent>,
    ) -> Result<Self> {
        tracing::info!(
            endpoint = %config.endpoint,
            model = %config.model,
            voice = %config.voice_name,
            session,
            "connecting to live voice endpoint"
        );

        let (ws_stream, _) = tokio_tungstenite::connect_async(config.connect_url().as_str())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let (mut writer, mut reader) = ws_stream.split();

        let setup = serde_json::to_string(&ClientMessage::Setup(config.setup()))?;
        writer
            .send(Message::Text(setup.into()))
            .await
            .map_err(|e| Error::Connection(format!("failed to send setup: {e}")))?;

        wait_for_setup(&mut reader).await?;

        let (outbound, outbound_rx) = OutboundSender::channel(config.outbound_capacity);
        let (close_tx, close_rx) = oneshot::channel();

        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            close_rx,
            session,
            events.clone(),
        ));
        let reader = tokio::spawn(read_loop(reader, session, events));

        tracing::info!(session, "live session established");

        Ok(Self {
            outbound,
            close_tx: Some(close_tx),
            reader,
        })
    }
}

impl LiveLink for LiveSession {
    fn outbound(&self) -> OutboundSender {
        self.outbound.clone()
    }

    fn close(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
            self.reader.abort();
            tracing::debug!("live session closed locally");
        }
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Inbound WebSocket frame, classified
enum Inbound {
    Server(ServerMessage),
    Closed(Option<String>),
    Skip,
}

fn classify(message: Message) -> Inbound {
    match message {
        Message::Text(text) => parse_server_message(text.as_bytes()),
        Message::Binary(bytes) => parse_server_message(&bytes),
        Message::Close(frame) => Inbound::Closed(
            frame
                .map(|f| f.reason.as_str().to_owned())
                .filter(|reason| !reason.is_empty()),
        ),
        _ => Inbound::Skip,
    }
}

fn parse_server_message(bytes: &[u8]) -> Inbound {
    match serde_json::from_slice::<ServerMessage>(bytes) {
        Ok(message) => Inbound::Server(message),
        Err(e) => {
            tracing::warn!(error = %e, len = bytes.len(), "ignoring unparsable server message");
            Inbound::Skip
        }
    }
}

async fn wait_for_setup(reader: &mut WsSource) -> Result<()> {
    loop {
        let Some(frame) = reader.next().await else {
            return Err(Error::Connection(
                "connection closed during setup".to_string(),
            ));
        };
        let frame = frame.map_err(|e| Error::Connection(e.to_string()))?;

        match classify(frame) {
            Inbound::Server(message) if message.is_setup_complete() => return Ok(()),
            Inbound::Server(_) | Inbound::Skip => {}
            Inbound::Closed(reason) => {
                return Err(Error::Connection(format!(
                    "closed during setup: {}",
                    reason.as_deref().unwrap_or("no reason given")
                )));
            }
        }
    }
}

async fn write_loop(
    mut writer: WsSink,
    mut outbound: mpsc::Receiver<TransportEnvelope>,
    mut close: oneshot::Receiver<()>,
    session: SessionId,
    events: mpsc::UnboundedSender<LiveEvent>,
) {
    loop {
        let envelope = tokio::select! {
            biased;
            _ = &mut close => break,
            envelope = outbound.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let json = match serde_json::to_string(&ClientMessage::RealtimeInput(envelope.into())) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize outbound frame");
                continue;
            }
        };

        if let Err(e) = writer.send(Message::Text(json.into())).await {
            tracing::warn!(error = %e, session, "outbound send failed");
            let _ = events.send(LiveEvent {
                session,
                kind: SessionEvent::Error(format!("send failed: {e}")),
            });
            return;
        }
        tracing::trace!(session, "sent audio frame");
    }

    if let Err(e) = writer.send(Message::Close(None)).await {
        tracing::debug!(error = %e, "close frame not delivered");
    }
    tracing::debug!(session, "outbound writer stopped");
}

async fn read_loop(
    mut reader: WsSource,
    session: SessionId,
    events: mpsc::UnboundedSender<LiveEvent>,
) {
    let reason = loop {
        match reader.next().await {
            Some(Ok(frame)) => match classify(frame) {
                Inbound::Server(message) => {
                    if let Some(go_away) = &message.go_away {
                        tracing::warn!(time_left = ?go_away.time_left, "server is going away");
                    }
                    let event = LiveEvent {
                        session,
                        kind: SessionEvent::Message(message),
                    };
                    if events.send(event).is_err() {
                        return;
                    }
                }
                Inbound::Closed(reason) => break reason,
                Inbound::Skip => {}
            },
            Some(Err(e)) => {
                let _ = events.send(LiveEvent {
                    session,
                    kind: SessionEvent::Error(e.to_string()),
                });
                return;
            }
            None => break None,
        }
    };

    tracing::info!(session, reason = ?reason, "live session closed by server");
    let _ = events.send(LiveEvent {
        session,
        kind: SessionEvent::Closed(reason),
    });
}
