//! WebSocket session transport
//!
//! Manages the connection lifecycle for one duplex session.
//!
//! # Connection Flow
//!
//! 1. `TransportSession::open()` - returns immediately, dials in the background
//! 2. The connection task sends `session.configure` before anything else
//! 3. Messages queued before the dial resolves flush, in order, after it
//! 4. Server events stream out of the event receiver until `Closed`
//!
//! # Lifecycle Events
//!
//! Every connection delivers `Opened` at most once, `Error` at most once, and
//! always finishes with exactly one `Closed` (an error never skips it). A
//! failed dial delivers `Error` then `Closed` with no `Opened`.
//!
//! Mid-session disconnects do NOT reconnect. Recovery is a whole new session
//! opened by the controller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::Lazy;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;

use super::protocol::{ClientMessage, ServerMessage, SessionConfig, Speaker};
use super::TransportError;

/// Default service endpoint, overridable with VOICELOOP_WS_URL
const DEFAULT_SERVICE_URL: &str = "wss://api.voiceloop.dev/v1/session";

const SERVICE_URL_VAR: &str = "VOICELOOP_WS_URL";
const API_KEY_VAR: &str = "VOICELOOP_API_KEY";

/// Connection timeout for the WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound queue capacity. Sends issued before the connection resolves are
/// buffered here and flushed once the session opens.
const OUTBOUND_BUFFER: usize = 100;

/// Incoming event queue capacity
const INCOMING_BUFFER: usize = 100;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// Events
// ============================================================================

/// Events delivered by a session, in connection order
///
/// `Opened` and `Closed` are synthesized by the connection task; everything
/// else maps one-to-one from wire messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Connection established and configured
    Opened,
    /// One chunk of synthesized audio, still base64-encoded
    Audio { data: String },
    /// Partial transcription text for one speaker
    Transcript { text: String, speaker: Speaker },
    /// The agent finished its turn
    TurnComplete,
    /// The user barged in; drop pending playback and in-flight transcript
    Interrupted,
    Error { message: String },
    /// Terminal for the connection
    Closed,
}

// ============================================================================
// Connector
// ============================================================================

/// Strategy for establishing session connections
///
/// The production implementation dials a WebSocket; tests substitute a
/// scripted stub. `connect` must return immediately and do all its work on
/// the returned task.
pub trait Connector: Send {
    fn connect(
        &self,
        conn_id: Uuid,
        config: SessionConfig,
        outbound: mpsc::Receiver<ClientMessage>,
    ) -> (mpsc::Receiver<ServerEvent>, tokio::task::JoinHandle<()>);
}

// ============================================================================
// Session handle
// ============================================================================

/// Handle to one duplex session
///
/// The session owns a background connection task. Dropping the handle aborts
/// the task and with it the connection.
pub struct TransportSession {
    conn_id: Uuid,
    outbound: mpsc::Sender<ClientMessage>,
    events: Option<mpsc::Receiver<ServerEvent>>,
    task: tokio::task::JoinHandle<()>,
}

impl TransportSession {
    /// Open a fresh session through `connector`
    ///
    /// Returns immediately; the dial proceeds in the background. Messages
    /// sent before it resolves are buffered and flushed in order after the
    /// configuration message.
    pub fn open(connector: &dyn Connector, config: SessionConfig) -> Self {
        let conn_id = Uuid::new_v4();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (events, task) = connector.connect(conn_id, config, outbound_rx);
        log::debug!("Transport: opened session {}", conn_id);
        Self {
            conn_id,
            outbound: outbound_tx,
            events: Some(events),
            task,
        }
    }

    /// Identifier for this connection, distinct across reconnects
    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Queue a message for the service
    pub async fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| TransportError::SendFailed("connection task gone".to_string()))
    }

    /// Clone of the outbound sender for hot-path producers
    pub fn sender(&self) -> mpsc::Sender<ClientMessage> {
        self.outbound.clone()
    }

    /// Take ownership of the event receiver
    ///
    /// Allows events to be consumed concurrently with sends. Returns `None`
    /// if already taken.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.events.take()
    }

    /// Tear the session down
    pub fn close(self) {
        log::debug!("Transport: closing session {}", self.conn_id);
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        // The connection task does not outlive its handle
        self.task.abort();
    }
}

// ============================================================================
// Credentials
// ============================================================================

static ENV_INIT: Lazy<()> = Lazy::new(|| {
    if dotenvy::dotenv().is_ok() {
        log::debug!("Transport: loaded .env file");
    }
});

/// Endpoint and API key for the speech service
#[derive(Debug, Clone)]
pub struct ServiceCredentials {
    pub url: String,
    pub api_key: String,
}

impl ServiceCredentials {
    /// Read credentials from the environment, loading `.env` once
    pub fn from_env() -> Result<Self, TransportError> {
        Lazy::force(&ENV_INIT);
        let api_key = std::env::var(API_KEY_VAR)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or(TransportError::MissingCredentials)?;
        let url = std::env::var(SERVICE_URL_VAR)
            .ok()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVICE_URL.to_string());
        Ok(Self { url, api_key })
    }
}

// ============================================================================
// WebSocket connector
// ============================================================================

/// Production connector that dials the speech service over TLS
pub struct WsConnector {
    credentials: ServiceCredentials,
}

impl WsConnector {
    pub fn new(credentials: ServiceCredentials) -> Self {
        Self { credentials }
    }

    /// Build a connector from the environment
    pub fn from_env() -> Result<Self, TransportError> {
        Ok(Self::new(ServiceCredentials::from_env()?))
    }
}

impl Connector for WsConnector {
    fn connect(
        &self,
        conn_id: Uuid,
        config: SessionConfig,
        outbound: mpsc::Receiver<ClientMessage>,
    ) -> (mpsc::Receiver<ServerEvent>, tokio::task::JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::channel(INCOMING_BUFFER);
        let credentials = self.credentials.clone();
        let task = tokio::spawn(run_connection(
            conn_id,
            credentials,
            config,
            outbound,
            events_tx,
        ));
        (events_rx, task)
    }
}

/// Single connection attempt (no retries)
async fn dial(credentials: &ServiceCredentials) -> Result<WsStream, TransportError> {
    let mut request = credentials
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {}", credentials.api_key))
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?,
    );

    log::info!("Transport: connecting to {}", credentials.url);

    let (stream, response) = connect_async_with_config(
        request, None, true, // disable_nagle: audio frames must not batch
    )
    .await
    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    log::debug!("Transport: handshake complete (HTTP {})", response.status());

    Ok(stream)
}

async fn send_message(
    write: &mut SplitSink<WsStream, Message>,
    message: &ClientMessage,
) -> Result<(), TransportError> {
    let json = serde_json::to_string(message)
        .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
    write
        .send(Message::Text(json))
        .await
        .map_err(|e| TransportError::WebSocketError(e.to_string()))
}

fn server_event(message: ServerMessage) -> Option<ServerEvent> {
    match message {
        ServerMessage::AudioDelta { audio } => Some(ServerEvent::Audio { data: audio }),
        ServerMessage::TranscriptDelta { text, speaker } => {
            Some(ServerEvent::Transcript { text, speaker })
        }
        ServerMessage::TurnComplete => Some(ServerEvent::TurnComplete),
        ServerMessage::Interrupted => Some(ServerEvent::Interrupted),
        ServerMessage::Error { message } => Some(ServerEvent::Error { message }),
        ServerMessage::Unknown => None,
    }
}

async fn run_connection(
    conn_id: Uuid,
    credentials: ServiceCredentials,
    config: SessionConfig,
    mut outbound: mpsc::Receiver<ClientMessage>,
    events: mpsc::Sender<ServerEvent>,
) {
    let mut error_emitted = false;

    let stream = match timeout(CONNECTION_TIMEOUT, dial(&credentials)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            log::warn!("Transport: connection {} failed: {}", conn_id, e);
            let _ = events
                .send(ServerEvent::Error {
                    message: e.to_string(),
                })
                .await;
            let _ = events.send(ServerEvent::Closed).await;
            return;
        }
        Err(_) => {
            log::warn!("Transport: connection {} timed out", conn_id);
            let _ = events
                .send(ServerEvent::Error {
                    message: "Connection timeout".to_string(),
                })
                .await;
            let _ = events.send(ServerEvent::Closed).await;
            return;
        }
    };

    let (mut write, mut read) = stream.split();

    // Configuration always precedes buffered audio on the wire
    let configure = ClientMessage::session_configure(config);
    if let Err(e) = send_message(&mut write, &configure).await {
        log::warn!("Transport: configuring {} failed: {}", conn_id, e);
        let _ = events
            .send(ServerEvent::Error {
                message: e.to_string(),
            })
            .await;
        let _ = events.send(ServerEvent::Closed).await;
        return;
    }

    log::info!("Transport: session {} open", conn_id);
    let _ = events.send(ServerEvent::Opened).await;

    loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(message) => {
                    if let Err(e) = send_message(&mut write, &message).await {
                        log::warn!("Transport: send on {} failed: {}", conn_id, e);
                        if !error_emitted {
                            error_emitted = true;
                            let _ = events.send(ServerEvent::Error { message: e.to_string() }).await;
                        }
                        break;
                    }
                }
                None => {
                    // Handle dropped; close the socket cleanly
                    if let Err(e) = write.close().await {
                        log::warn!("Transport: error closing WebSocket: {}", e);
                    }
                    break;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => {
                        if let Some(event) = server_event(message) {
                            let is_error = matches!(event, ServerEvent::Error { .. });
                            if is_error && error_emitted {
                                log::debug!("Transport: suppressing repeated error event");
                            } else {
                                if is_error {
                                    error_emitted = true;
                                }
                                if events.send(event).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("Transport: failed to parse message: {}", e);
                    }
                },
                Some(Ok(Message::Close(_))) => {
                    log::info!("Transport: session {} closed by server", conn_id);
                    break;
                }
                Some(Ok(_)) => {} // Ignore ping/pong/binary
                Some(Err(e)) => {
                    log::warn!("Transport: WebSocket error on {}: {}", conn_id, e);
                    if !error_emitted {
                        error_emitted = true;
                        let _ = events.send(ServerEvent::Error { message: e.to_string() }).await;
                    }
                    break;
                }
                None => break,
            },
        }
    }

    let _ = events.send(ServerEvent::Closed).await;
    log::debug!("Transport: connection task {} exiting", conn_id);
}

// ============================================================================
// Stub connector
// ============================================================================

/// Connector that replays a scripted event stream
///
/// Each connection pops the next script and delivers it in order, recording
/// everything the engine sends. With no script left, the connection stays
/// silent, like a dial that never resolves.
pub struct StubConnector {
    scripts: Arc<Mutex<VecDeque<Vec<ServerEvent>>>>,
    sent: Arc<Mutex<Vec<ClientMessage>>>,
    connects: Arc<AtomicUsize>,
}

impl StubConnector {
    pub fn new(scripts: Vec<Vec<ServerEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            sent: Arc::new(Mutex::new(Vec::new())),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared log of every message the engine sent, configuration included
    pub fn sent(&self) -> Arc<Mutex<Vec<ClientMessage>>> {
        self.sent.clone()
    }

    /// Number of connections opened so far
    pub fn connect_count(&self) -> Arc<AtomicUsize> {
        self.connects.clone()
    }
}

impl Connector for StubConnector {
    fn connect(
        &self,
        conn_id: Uuid,
        config: SessionConfig,
        mut outbound: mpsc::Receiver<ClientMessage>,
    ) -> (mpsc::Receiver<ServerEvent>, tokio::task::JoinHandle<()>) {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        let sent = self.sent.clone();
        let (events_tx, events_rx) = mpsc::channel(INCOMING_BUFFER);

        let task = tokio::spawn(async move {
            sent.lock()
                .unwrap()
                .push(ClientMessage::session_configure(config));
            for event in script {
                if events_tx.send(event).await.is_err() {
                    return;
                }
            }
            while let Some(message) = outbound.recv().await {
                sent.lock().unwrap().push(message);
            }
            log::debug!("StubConnector: connection {} drained", conn_id);
        });

        (events_rx, task)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::EngineSettings;

    fn test_config() -> SessionConfig {
        SessionConfig::from_settings(&EngineSettings::default())
    }

    #[tokio::test]
    async fn test_sends_before_open_flush_in_order_after_configure() {
        let connector = StubConnector::new(vec![vec![]]);
        let sent = connector.sent();
        let session = TransportSession::open(&connector, test_config());

        session
            .send(ClientMessage::audio_append(&[0.1; 4]))
            .await
            .unwrap();
        session
            .send(ClientMessage::audio_append(&[0.2; 4]))
            .await
            .unwrap();

        for _ in 0..100 {
            if sent.lock().unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert!(matches!(sent[0], ClientMessage::SessionConfigure { .. }));
        assert_eq!(sent[1], ClientMessage::audio_append(&[0.1; 4]));
        assert_eq!(sent[2], ClientMessage::audio_append(&[0.2; 4]));
    }

    #[tokio::test]
    async fn test_events_arrive_in_script_order() {
        let script = vec![
            ServerEvent::Opened,
            ServerEvent::Transcript {
                text: "Hello".to_string(),
                speaker: Speaker::Agent,
            },
            ServerEvent::TurnComplete,
            ServerEvent::Closed,
        ];
        let connector = StubConnector::new(vec![script.clone()]);
        let mut session = TransportSession::open(&connector, test_config());
        let mut events = session.take_event_receiver().unwrap();

        let mut received = Vec::new();
        for _ in 0..script.len() {
            received.push(events.recv().await.unwrap());
        }
        assert_eq!(received, script);
    }

    #[tokio::test]
    async fn test_event_receiver_can_only_be_taken_once() {
        let connector = StubConnector::new(vec![vec![]]);
        let mut session = TransportSession::open(&connector, test_config());

        assert!(session.take_event_receiver().is_some());
        assert!(session.take_event_receiver().is_none());
    }

    #[tokio::test]
    async fn test_each_session_gets_a_distinct_conn_id() {
        let connector = StubConnector::new(vec![]);
        let a = TransportSession::open(&connector, test_config());
        let b = TransportSession::open(&connector, test_config());
        assert_ne!(a.conn_id(), b.conn_id());
    }

    #[tokio::test]
    async fn test_send_fails_after_close() {
        let connector = StubConnector::new(vec![vec![]]);
        let session = TransportSession::open(&connector, test_config());
        let sender = session.sender();
        session.close();

        // The abort lands asynchronously; poll until the channel dies
        let mut closed = false;
        for _ in 0..100 {
            if sender
                .send(ClientMessage::audio_append(&[0.0; 2]))
                .await
                .is_err()
            {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(closed, "outbound channel survived close");
    }

    #[tokio::test]
    #[ignore] // Requires VOICELOOP_API_KEY and a reachable service
    async fn test_live_connection_opens() {
        let connector = WsConnector::from_env().expect("VOICELOOP_API_KEY required");
        let mut session = TransportSession::open(&connector, test_config());
        let mut events = session.take_event_receiver().unwrap();

        match timeout(Duration::from_secs(15), events.recv()).await {
            Ok(Some(ServerEvent::Opened)) => {}
            other => panic!("Expected Opened, got {:?}", other),
        }
        session.close();
    }
}
