//! Engine controller
//!
//! Single event loop that owns every piece of session state. Commands from
//! the embedding application and events from the transport funnel into one
//! queue, so ordering is total and no state needs a lock.
//!
//! # Architecture
//!
//! ```text
//! commands ──┐                          ┌─▶ PlaybackScheduler ─▶ output
//!            ├─▶ mpsc ─▶ event loop ────┤
//! transport ─┘          (exclusive      ├─▶ TranscriptAggregator
//!  events               state owner)    └─▶ watch::Sender<EngineSnapshot>
//! ```
//!
//! Capture frames bypass the queue: a dedicated pump task encodes and sends
//! them straight to the transport, reporting only counters back.
//!
//! # Stale Sessions
//!
//! Every connection gets a fresh id. Events are tagged with the id of the
//! connection that produced them and dropped unless it matches the current
//! session, so a torn-down transport can never touch live state.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::audio::{AudioFrame, AudioInput, CaptureHandle, MicInput};
use crate::metrics::{MetricsCollector, MetricsSummary};
use crate::playback::{DeviceOutput, PlaybackError, PlaybackOutput, PlaybackScheduler};
use crate::settings::{
    load_settings, load_settings_from, save_settings, save_settings_to, EngineSettings, VoiceId,
};

use super::protocol::{decode_audio, ClientMessage, SessionConfig};
use super::transcript::{TranscriptAggregator, TranscriptSegment};
use super::transport::{Connector, ServerEvent, TransportSession};

/// Command queue capacity
const EVENT_QUEUE_CAPACITY: usize = 32;

// ============================================================================
// Events
// ============================================================================

/// Everything the engine reacts to, commands and session events alike
#[derive(Debug)]
pub enum Event {
    /// Start streaming microphone frames to the service
    StartCapture,
    /// Stop the microphone pipeline
    StopCapture,
    SetMicMuted(bool),
    SetSpeakerMuted(bool),
    /// Tear down the session and open a fresh one
    Reset,
    /// Persist new settings, then reset so they take effect
    UpdateConfig { persona: String, voice: VoiceId },
    /// Event from the transport, tagged with its connection
    Server { conn_id: Uuid, event: ServerEvent },
    /// The output finished playing a scheduled chunk
    PlaybackFinished { id: Uuid },
    Shutdown,
}

/// Lifecycle of the transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Failed,
}

/// Point-in-time view of the engine, published after every event
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub state: SessionState,
    /// Operational status line, `None` while an error is showing
    pub status: Option<String>,
    /// User-actionable error, `None` while a status is showing
    pub error: Option<String>,
    pub capturing: bool,
    pub mic_muted: bool,
    pub speaker_muted: bool,
    /// Committed turns, oldest first
    pub history: Vec<TranscriptSegment>,
    /// The turn currently in flight
    pub current_turn: Vec<TranscriptSegment>,
    /// Running session statistics
    pub metrics: MetricsSummary,
}

fn initial_snapshot() -> EngineSnapshot {
    EngineSnapshot {
        state: SessionState::Idle,
        status: None,
        error: None,
        capturing: false,
        mic_muted: false,
        speaker_muted: false,
        history: Vec::new(),
        current_turn: Vec::new(),
        metrics: MetricsSummary::default(),
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Engine handle - holds the event sender for dispatching commands
///
/// Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Event>,
    snapshot: watch::Receiver<EngineSnapshot>,
}

impl SessionHandle {
    /// Send an event to the engine
    pub async fn send(&self, event: Event) -> Result<(), mpsc::error::SendError<Event>> {
        self.tx.send(event).await
    }

    pub async fn start_capture(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::StartCapture).await
    }

    pub async fn stop_capture(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::StopCapture).await
    }

    pub async fn set_mic_muted(&self, muted: bool) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::SetMicMuted(muted)).await
    }

    pub async fn set_speaker_muted(
        &self,
        muted: bool,
    ) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::SetSpeakerMuted(muted)).await
    }

    pub async fn reset(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::Reset).await
    }

    pub async fn update_config(
        &self,
        persona: String,
        voice: VoiceId,
    ) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::UpdateConfig { persona, voice }).await
    }

    pub async fn shutdown(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::Shutdown).await
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch receiver for awaiting snapshot changes
    pub fn watch(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot.clone()
    }
}

// ============================================================================
// Construction
// ============================================================================

/// Everything the engine needs injected at spawn time
pub struct EngineConfig {
    pub connector: Box<dyn Connector>,
    pub input: Box<dyn AudioInput>,
    pub output: Box<dyn PlaybackOutput>,
    /// Completion ids from the output, if it reports them
    pub playback_done: Option<mpsc::UnboundedReceiver<Uuid>>,
    /// Shared speaker mute flag, also sampled by the output callback
    pub speaker_muted: Arc<AtomicBool>,
    /// Override the settings location. `None` uses the XDG config path.
    pub settings_path: Option<PathBuf>,
}

/// Build the engine and spawn its event loop
///
/// The first session opens immediately. Requires a tokio runtime.
pub fn spawn(mut config: EngineConfig) -> SessionHandle {
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let (snapshot_tx, snapshot_rx) = watch::channel(initial_snapshot());

    // Forward playback completions into the event queue
    if let Some(mut done) = config.playback_done.take() {
        let tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(id) = done.recv().await {
                if tx.send(Event::PlaybackFinished { id }).await.is_err() {
                    break;
                }
            }
        });
    }

    let controller = SessionController::new(config, events_tx.clone(), snapshot_tx);
    tokio::spawn(controller.run(events_rx));

    SessionHandle {
        tx: events_tx,
        snapshot: snapshot_rx,
    }
}

/// Open the default audio devices and spawn the engine
pub fn spawn_with_devices(connector: Box<dyn Connector>) -> Result<SessionHandle, PlaybackError> {
    let speaker_muted = Arc::new(AtomicBool::new(false));
    let mut output = DeviceOutput::new(speaker_muted.clone())?;
    let playback_done = output.take_done_receiver();

    Ok(spawn(EngineConfig {
        connector,
        input: Box::new(MicInput),
        output: Box::new(output),
        playback_done,
        speaker_muted,
        settings_path: None,
    }))
}

// ============================================================================
// Controller
// ============================================================================

/// Active microphone pipeline
struct CaptureSession {
    handle: CaptureHandle,
    pump: tokio::task::JoinHandle<()>,
}

/// Owns all mutable engine state. Only the event loop touches it.
struct SessionController {
    settings_path: Option<PathBuf>,
    settings: EngineSettings,
    connector: Box<dyn Connector>,
    input: Box<dyn AudioInput>,
    scheduler: PlaybackScheduler,
    transcript: TranscriptAggregator,
    metrics: MetricsCollector,
    mic_muted: Arc<AtomicBool>,
    speaker_muted: Arc<AtomicBool>,

    state: SessionState,
    status: Option<String>,
    error: Option<String>,
    session: Option<TransportSession>,
    capture: Option<CaptureSession>,
    /// Task bridging the current session's events into the queue
    forwarder: Option<tokio::task::JoinHandle<()>>,
    /// Frames sent on the current connection
    frames_sent: Arc<AtomicU64>,

    snapshot_tx: watch::Sender<EngineSnapshot>,
    events_tx: mpsc::Sender<Event>,
}

impl SessionController {
    fn new(
        config: EngineConfig,
        events_tx: mpsc::Sender<Event>,
        snapshot_tx: watch::Sender<EngineSnapshot>,
    ) -> Self {
        let settings = match &config.settings_path {
            Some(path) => load_settings_from(path),
            None => load_settings(),
        };

        Self {
            settings_path: config.settings_path,
            settings,
            connector: config.connector,
            input: config.input,
            scheduler: PlaybackScheduler::new(config.output),
            transcript: TranscriptAggregator::new(),
            metrics: MetricsCollector::new(),
            mic_muted: Arc::new(AtomicBool::new(false)),
            speaker_muted: config.speaker_muted,
            state: SessionState::Idle,
            status: None,
            error: None,
            session: None,
            capture: None,
            forwarder: None,
            frames_sent: Arc::new(AtomicU64::new(0)),
            snapshot_tx,
            events_tx,
        }
    }

    /// Run the event loop until shutdown
    async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        log::info!("Engine: event loop started");
        self.open_session();
        self.publish_snapshot();

        while let Some(event) = rx.recv().await {
            match &event {
                // Audio deltas are too chatty to log
                Event::Server {
                    event: ServerEvent::Audio { .. },
                    ..
                } => {}
                other => log::debug!("Engine: received event: {:?}", other),
            }

            // Handle Shutdown at the edge
            if matches!(event, Event::Shutdown) {
                log::info!("Engine: shutdown requested");
                break;
            }

            let old_state = self.state;
            self.handle_event(event);
            if old_state != self.state {
                log::info!("Engine: state {:?} -> {:?}", old_state, self.state);
            }

            self.publish_snapshot();
        }

        // Teardown mirrors reset, without opening a replacement session
        if let Some(capture) = self.capture.take() {
            capture.handle.stop();
            capture.pump.abort();
        }
        self.close_session();
        self.scheduler.interrupt();

        let summary = self.metrics.get_summary();
        log::info!(
            "Engine: event loop ended after {} session(s) ({} clean), {} turn(s), {} interruption(s)",
            summary.total_sessions,
            summary.clean_sessions,
            summary.total_turns,
            summary.total_interruptions
        );
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::StartCapture => self.start_capture(),
            Event::StopCapture => self.stop_capture(),
            Event::SetMicMuted(muted) => {
                self.mic_muted.store(muted, Ordering::Relaxed);
                log::debug!("Engine: mic muted = {}", muted);
            }
            Event::SetSpeakerMuted(muted) => {
                self.speaker_muted.store(muted, Ordering::Relaxed);
                log::debug!("Engine: speaker muted = {}", muted);
            }
            Event::Reset => self.reset_session(),
            Event::UpdateConfig { persona, voice } => self.update_config(persona, voice),
            Event::Server { conn_id, event } => {
                let current = self.session.as_ref().map(|s| s.conn_id());
                if current == Some(conn_id) {
                    self.handle_server_event(event);
                } else {
                    log::debug!("Engine: dropping event for stale session {}", conn_id);
                }
            }
            Event::PlaybackFinished { id } => self.scheduler.finished(id),
            // Handled in the run loop
            Event::Shutdown => {}
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn start_capture(&mut self) {
        if self.capture.is_some() {
            log::debug!("Engine: capture already running");
            return;
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        match self.input.start(self.mic_muted.clone(), frames_tx) {
            Ok(handle) => {
                let outbound = self.session.as_ref().map(|s| s.sender());
                let pump = spawn_capture_pump(frames_rx, outbound, self.frames_sent.clone());
                self.capture = Some(CaptureSession { handle, pump });
                self.set_status("Listening...");
            }
            Err(e) => {
                log::error!("Engine: capture failed to start: {}", e);
                self.metrics
                    .record_error("capture".to_string(), e.to_string(), None);
                self.set_error("Microphone access denied");
            }
        }
    }

    fn stop_capture(&mut self) {
        match self.capture.take() {
            Some(capture) => {
                capture.handle.stop();
                capture.pump.abort();
                self.set_status("Stopped");
            }
            None => log::debug!("Engine: capture already stopped"),
        }
    }

    fn reset_session(&mut self) {
        log::info!("Engine: resetting session");

        // Stop capture first so no frame reaches the old session mid-teardown
        if let Some(capture) = self.capture.take() {
            capture.handle.stop();
            capture.pump.abort();
        }

        self.close_session();

        // Cancel all live playback and release the reservation
        self.scheduler.interrupt();

        // Transcript history survives the reset; only the service-side
        // context is lost.
        self.open_session();
        self.set_status("Session reset");
    }

    fn update_config(&mut self, persona: String, voice: VoiceId) {
        self.settings.persona = persona;
        self.settings.voice = voice;

        let result = match &self.settings_path {
            Some(path) => save_settings_to(path, &self.settings),
            None => save_settings(&self.settings),
        };
        if let Err(e) = result {
            // The new settings still apply to the next session
            log::warn!("Engine: failed to save settings: {}", e);
        }

        self.reset_session();
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    fn open_session(&mut self) {
        let config = SessionConfig::from_settings(&self.settings);
        let mut session = TransportSession::open(self.connector.as_ref(), config);
        let conn_id = session.conn_id();

        self.metrics.session_started(conn_id);
        self.frames_sent = Arc::new(AtomicU64::new(0));

        // Bridge this session's events into the queue, tagged with its id
        if let Some(mut events) = session.take_event_receiver() {
            let tx = self.events_tx.clone();
            self.forwarder = Some(tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if tx.send(Event::Server { conn_id, event }).await.is_err() {
                        break;
                    }
                }
            }));
        }

        self.session = Some(session);
        self.state = SessionState::Connecting;
        self.set_status("Connecting...");
    }

    fn close_session(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(session) = self.session.take() {
            match self.state {
                // A Failed session may be torn down before its Closed event
                // arrives; flush it here, where session_closed is a no-op if
                // the wire close already did.
                SessionState::Open | SessionState::Failed => {
                    self.metrics
                        .session_closed(self.frames_sent.load(Ordering::Relaxed));
                }
                SessionState::Connecting => self.metrics.session_cancelled(),
                _ => {}
            }
            session.close();
        }
    }

    fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Opened => {
                self.state = SessionState::Open;
                self.set_status("Connected");
            }
            ServerEvent::Audio { data } => match decode_audio(&data) {
                Ok(samples) => {
                    if self.scheduler.schedule(samples).is_some() {
                        self.metrics.chunk_scheduled();
                    }
                }
                Err(e) => {
                    // A bad chunk is a zero-duration no-op: report it and let
                    // the clock keep its place for the next chunk.
                    log::warn!("Engine: dropping undecodable chunk: {}", e);
                    self.metrics.decode_failed(e.to_string());
                    self.set_error("Audio decode failed");
                }
            },
            ServerEvent::Transcript { text, speaker } => {
                self.transcript.append_partial(speaker, &text);
            }
            ServerEvent::TurnComplete => {
                self.transcript.complete_turn();
                self.metrics.turn_completed();
            }
            ServerEvent::Interrupted => {
                // One barge-in fans out to both holders of turn state
                self.scheduler.interrupt();
                self.transcript.interrupt();
                self.metrics.interruption();
            }
            ServerEvent::Error { message } => {
                log::error!("Engine: session error: {}", message);
                self.state = SessionState::Failed;
                self.metrics.transport_error(message.clone());
                self.set_error(&message);
            }
            ServerEvent::Closed => {
                // An errored session stays Failed; the close still lands on
                // the surface.
                if self.state != SessionState::Failed {
                    self.state = SessionState::Closed;
                }
                self.metrics
                    .session_closed(self.frames_sent.load(Ordering::Relaxed));
                self.set_status("Session closed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Surface
    // ------------------------------------------------------------------

    /// Status and error are mutually exclusive: setting one clears the other
    fn set_status(&mut self, status: &str) {
        self.status = Some(status.to_string());
        self.error = None;
    }

    fn set_error(&mut self, error: &str) {
        self.error = Some(error.to_string());
        self.status = None;
    }

    fn publish_snapshot(&self) {
        let snapshot = EngineSnapshot {
            state: self.state,
            status: self.status.clone(),
            error: self.error.clone(),
            capturing: self.capture.is_some(),
            mic_muted: self.mic_muted.load(Ordering::Relaxed),
            speaker_muted: self.speaker_muted.load(Ordering::Relaxed),
            history: self.transcript.history().to_vec(),
            current_turn: self.transcript.current_turn().to_vec(),
            metrics: self.metrics.get_summary(),
        };
        let _ = self.snapshot_tx.send(snapshot);
    }
}

/// Bridge capture frames onto the transport
///
/// Runs outside the event loop: encoding and sending are per-frame hot-path
/// work. When the transport goes away the pump keeps draining frames so the
/// channel never backs up, it just stops sending.
fn spawn_capture_pump(
    mut frames: mpsc::UnboundedReceiver<AudioFrame>,
    mut outbound: Option<mpsc::Sender<ClientMessage>>,
    frames_sent: Arc<AtomicU64>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let Some(tx) = outbound.as_ref() {
                let message = ClientMessage::audio_append(&frame.samples);
                if tx.send(message).await.is_err() {
                    log::debug!("Capture pump: transport gone, discarding further frames");
                    outbound = None;
                } else {
                    frames_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        log::debug!("Capture pump: frame channel closed");
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::NullInput;
    use crate::playback::{ManualOutput, ManualOutputState};
    use crate::session::protocol::{encode_frame, Speaker};
    use crate::session::transport::StubConnector;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Harness {
        controller: SessionController,
        connects: Arc<AtomicUsize>,
        output: Arc<Mutex<ManualOutputState>>,
        _events_rx: mpsc::Receiver<Event>,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let connector = StubConnector::new(vec![]);
        let connects = connector.connect_count();
        let output = ManualOutput::new();
        let output_state = output.state();

        let config = EngineConfig {
            connector: Box::new(connector),
            input: Box::new(NullInput {
                frames: 0,
                value: 0.0,
            }),
            output: Box::new(output),
            playback_done: None,
            speaker_muted: Arc::new(AtomicBool::new(false)),
            settings_path: Some(dir.path().join("settings.json")),
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (snapshot_tx, _snapshot_rx) = watch::channel(initial_snapshot());
        let mut controller = SessionController::new(config, events_tx, snapshot_tx);
        controller.open_session();

        Harness {
            controller,
            connects,
            output: output_state,
            _events_rx: events_rx,
            _dir: dir,
        }
    }

    fn conn_id(controller: &SessionController) -> Uuid {
        controller.session.as_ref().unwrap().conn_id()
    }

    fn server(controller: &mut SessionController, event: ServerEvent) {
        let id = conn_id(controller);
        controller.handle_event(Event::Server {
            conn_id: id,
            event,
        });
    }

    #[tokio::test]
    async fn opened_event_marks_session_connected() {
        let mut h = harness();
        assert_eq!(h.controller.state, SessionState::Connecting);
        assert_eq!(h.controller.status.as_deref(), Some("Connecting..."));

        server(&mut h.controller, ServerEvent::Opened);

        assert_eq!(h.controller.state, SessionState::Open);
        assert_eq!(h.controller.status.as_deref(), Some("Connected"));
        assert!(h.controller.error.is_none());
    }

    #[tokio::test]
    async fn events_from_stale_sessions_are_dropped() {
        let mut h = harness();
        h.controller.handle_event(Event::Server {
            conn_id: Uuid::new_v4(),
            event: ServerEvent::Opened,
        });
        assert_eq!(h.controller.state, SessionState::Connecting);
    }

    #[tokio::test]
    async fn audio_events_schedule_playback() {
        let mut h = harness();
        server(&mut h.controller, ServerEvent::Opened);

        let data = encode_frame(&[0.5; 480]).data;
        server(&mut h.controller, ServerEvent::Audio { data });

        assert_eq!(h.controller.scheduler.live_count(), 1);
    }

    #[tokio::test]
    async fn undecodable_audio_reports_without_stalling() {
        let mut h = harness();
        server(&mut h.controller, ServerEvent::Opened);

        server(
            &mut h.controller,
            ServerEvent::Audio {
                data: "!!!".to_string(),
            },
        );
        assert_eq!(h.controller.error.as_deref(), Some("Audio decode failed"));
        assert_eq!(h.controller.scheduler.live_count(), 0);

        // The next good chunk schedules normally
        let data = encode_frame(&[0.5; 480]).data;
        server(&mut h.controller, ServerEvent::Audio { data });
        assert_eq!(h.controller.scheduler.live_count(), 1);
    }

    #[tokio::test]
    async fn interruption_cancels_playback_and_in_flight_transcript() {
        let mut h = harness();
        server(&mut h.controller, ServerEvent::Opened);

        server(
            &mut h.controller,
            ServerEvent::Transcript {
                text: "Hi".to_string(),
                speaker: Speaker::User,
            },
        );
        server(&mut h.controller, ServerEvent::TurnComplete);
        server(
            &mut h.controller,
            ServerEvent::Transcript {
                text: "I was about to say".to_string(),
                speaker: Speaker::Agent,
            },
        );
        let data = encode_frame(&[0.5; 480]).data;
        server(&mut h.controller, ServerEvent::Audio { data });

        server(&mut h.controller, ServerEvent::Interrupted);

        assert_eq!(h.controller.scheduler.live_count(), 0);
        assert!(h.controller.transcript.current_turn().is_empty());
        assert_eq!(h.controller.transcript.history().len(), 1);
    }

    #[tokio::test]
    async fn error_then_close_keeps_failed_state() {
        let mut h = harness();
        server(&mut h.controller, ServerEvent::Opened);

        server(
            &mut h.controller,
            ServerEvent::Error {
                message: "quota exceeded".to_string(),
            },
        );
        assert_eq!(h.controller.state, SessionState::Failed);
        assert_eq!(h.controller.error.as_deref(), Some("quota exceeded"));
        assert!(h.controller.status.is_none());

        server(&mut h.controller, ServerEvent::Closed);
        assert_eq!(h.controller.state, SessionState::Failed);
        assert_eq!(h.controller.status.as_deref(), Some("Session closed"));
        assert!(h.controller.error.is_none());
    }

    #[tokio::test]
    async fn clean_close_marks_session_closed() {
        let mut h = harness();
        server(&mut h.controller, ServerEvent::Opened);
        server(&mut h.controller, ServerEvent::Closed);

        assert_eq!(h.controller.state, SessionState::Closed);
        assert_eq!(h.controller.status.as_deref(), Some("Session closed"));
    }

    #[tokio::test]
    async fn start_capture_is_idempotent() {
        let mut h = harness();
        h.controller.handle_event(Event::StartCapture);
        assert!(h.controller.capture.is_some());
        assert_eq!(h.controller.status.as_deref(), Some("Listening..."));

        h.controller.handle_event(Event::StartCapture);
        assert!(h.controller.capture.is_some());
    }

    #[tokio::test]
    async fn stop_capture_is_idempotent() {
        let mut h = harness();
        h.controller.handle_event(Event::StartCapture);
        h.controller.handle_event(Event::StopCapture);
        assert!(h.controller.capture.is_none());
        assert_eq!(h.controller.status.as_deref(), Some("Stopped"));

        h.controller.handle_event(Event::StopCapture);
        assert!(h.controller.capture.is_none());
    }

    #[tokio::test]
    async fn mute_commands_flip_shared_flags() {
        let mut h = harness();
        h.controller.handle_event(Event::SetMicMuted(true));
        assert!(h.controller.mic_muted.load(Ordering::Relaxed));

        h.controller.handle_event(Event::SetSpeakerMuted(true));
        assert!(h.controller.speaker_muted.load(Ordering::Relaxed));

        h.controller.handle_event(Event::SetMicMuted(false));
        assert!(!h.controller.mic_muted.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn reset_opens_a_fresh_session_and_clears_playback() {
        let mut h = harness();
        server(&mut h.controller, ServerEvent::Opened);
        let first = conn_id(&h.controller);

        let data = encode_frame(&[0.5; 480]).data;
        server(&mut h.controller, ServerEvent::Audio { data });
        h.controller.handle_event(Event::StartCapture);

        h.controller.handle_event(Event::Reset);

        assert_ne!(conn_id(&h.controller), first);
        assert_eq!(h.connects.load(Ordering::SeqCst), 2);
        assert_eq!(h.controller.state, SessionState::Connecting);
        assert_eq!(h.controller.scheduler.live_count(), 0);
        assert!(h.controller.capture.is_none());
        assert_eq!(h.controller.status.as_deref(), Some("Session reset"));
    }

    #[tokio::test]
    async fn reset_retains_transcript_history() {
        let mut h = harness();
        server(&mut h.controller, ServerEvent::Opened);
        server(
            &mut h.controller,
            ServerEvent::Transcript {
                text: "Hello".to_string(),
                speaker: Speaker::Agent,
            },
        );
        server(&mut h.controller, ServerEvent::TurnComplete);

        h.controller.handle_event(Event::Reset);

        assert_eq!(h.controller.transcript.history().len(), 1);
    }

    #[tokio::test]
    async fn events_from_the_pre_reset_session_are_ignored() {
        let mut h = harness();
        server(&mut h.controller, ServerEvent::Opened);
        let first = conn_id(&h.controller);

        h.controller.handle_event(Event::Reset);

        // The old session closing must not disturb the new one
        h.controller.handle_event(Event::Server {
            conn_id: first,
            event: ServerEvent::Closed,
        });
        assert_eq!(h.controller.state, SessionState::Connecting);
    }

    #[tokio::test]
    async fn update_config_persists_settings_and_resets() {
        let mut h = harness();
        let first = conn_id(&h.controller);
        let path = h.controller.settings_path.clone().unwrap();

        h.controller.handle_event(Event::UpdateConfig {
            persona: "Be terse.".to_string(),
            voice: VoiceId::Kore,
        });

        let saved = load_settings_from(&path);
        assert_eq!(saved.persona, "Be terse.");
        assert_eq!(saved.voice, VoiceId::Kore);
        assert_ne!(conn_id(&h.controller), first);
    }

    #[tokio::test]
    async fn playback_finished_releases_the_live_entry() {
        let mut h = harness();
        server(&mut h.controller, ServerEvent::Opened);

        let data = encode_frame(&[0.5; 480]).data;
        server(&mut h.controller, ServerEvent::Audio { data });
        assert_eq!(h.controller.scheduler.live_count(), 1);

        let id = h.output.lock().unwrap().started[0].0;
        h.controller.handle_event(Event::PlaybackFinished { id });
        assert_eq!(h.controller.scheduler.live_count(), 0);
    }

    #[tokio::test]
    async fn interruption_cancels_chunks_at_the_output() {
        let mut h = harness();
        server(&mut h.controller, ServerEvent::Opened);

        let data = encode_frame(&[0.5; 480]).data;
        server(&mut h.controller, ServerEvent::Audio { data });
        let id = h.output.lock().unwrap().started[0].0;

        server(&mut h.controller, ServerEvent::Interrupted);
        assert_eq!(h.output.lock().unwrap().cancelled, vec![id]);
    }
}
