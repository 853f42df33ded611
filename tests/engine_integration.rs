//! Integration tests for the session engine
//!
//! Drive the engine end to end through its public handle, with a scripted
//! connector standing in for the service and a manual clock for playback.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test engine_integration
//! ```
//!
//! No credentials, microphone, or speaker needed; live-service coverage
//! lives in the transport module's ignored tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

use voiceloop::audio::NullInput;
use voiceloop::playback::{ManualOutput, ManualOutputState, PLAYBACK_SAMPLE_RATE};
use voiceloop::session::{encode_frame, ClientMessage};
use voiceloop::settings::load_settings_from;
use voiceloop::{
    spawn, EngineConfig, EngineSnapshot, ServerEvent, SessionHandle, SessionState, Speaker,
    StubConnector, TranscriptSegment, VoiceId,
};

// ============================================================================
// Harness
// ============================================================================

/// Spawn an engine wired to the given connector, null mic, manual output
fn spawn_engine(
    connector: StubConnector,
    input: NullInput,
) -> (SessionHandle, Arc<Mutex<ManualOutputState>>, TempDir) {
    let dir = TempDir::new().unwrap();
    let output = ManualOutput::new();
    let output_state = output.state();

    let handle = spawn(EngineConfig {
        connector: Box::new(connector),
        input: Box::new(input),
        output: Box::new(output),
        playback_done: None,
        speaker_muted: Arc::new(AtomicBool::new(false)),
        settings_path: Some(dir.path().join("settings.json")),
    });

    (handle, output_state, dir)
}

fn null_input() -> NullInput {
    NullInput {
        frames: 0,
        value: 0.0,
    }
}

fn agent_says(text: &str) -> ServerEvent {
    ServerEvent::Transcript {
        text: text.to_string(),
        speaker: Speaker::Agent,
    }
}

fn user_says(text: &str) -> ServerEvent {
    ServerEvent::Transcript {
        text: text.to_string(),
        speaker: Speaker::User,
    }
}

fn audio_chunk(seconds: f64) -> ServerEvent {
    let samples = vec![0.25; (seconds * PLAYBACK_SAMPLE_RATE as f64) as usize];
    ServerEvent::Audio {
        data: encode_frame(&samples).data,
    }
}

/// Await snapshots until `pred` holds, panicking after two seconds
async fn wait_for(
    handle: &SessionHandle,
    pred: impl Fn(&EngineSnapshot) -> bool,
) -> EngineSnapshot {
    let mut watch = handle.watch();
    let result = timeout(Duration::from_secs(2), async {
        loop {
            {
                let snapshot = watch.borrow_and_update();
                if pred(&snapshot) {
                    return snapshot.clone();
                }
            }
            if watch.changed().await.is_err() {
                panic!("engine stopped before condition held");
            }
        }
    })
    .await;
    match result {
        Ok(snapshot) => snapshot,
        Err(_) => panic!("timed out waiting for snapshot condition"),
    }
}

/// Poll `pred` until it holds, panicking after two seconds
async fn wait_until(pred: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !pred() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for condition");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Session lifecycle
// ============================================================================

#[tokio::test]
async fn engine_connects_and_reports_open() {
    let connector = StubConnector::new(vec![vec![ServerEvent::Opened]]);
    let (handle, _output, _dir) = spawn_engine(connector, null_input());

    let snapshot = wait_for(&handle, |s| s.state == SessionState::Open).await;
    assert_eq!(snapshot.status.as_deref(), Some("Connected"));
    assert!(snapshot.error.is_none());
}

#[tokio::test]
async fn session_error_then_close_surfaces_failure() {
    let connector = StubConnector::new(vec![vec![
        ServerEvent::Opened,
        ServerEvent::Error {
            message: "quota exceeded".to_string(),
        },
        ServerEvent::Closed,
    ]]);
    let (handle, _output, _dir) = spawn_engine(connector, null_input());

    let snapshot = wait_for(&handle, |s| {
        s.state == SessionState::Failed && s.status.as_deref() == Some("Session closed")
    })
    .await;
    assert_eq!(snapshot.metrics.failed_sessions, 1);
}

#[tokio::test]
async fn failed_dial_reports_error_without_opening() {
    let connector = StubConnector::new(vec![vec![
        ServerEvent::Error {
            message: "Connection refused".to_string(),
        },
        ServerEvent::Closed,
    ]]);
    let (handle, _output, _dir) = spawn_engine(connector, null_input());

    let snapshot = wait_for(&handle, |s| s.state == SessionState::Failed).await;
    let last_error = snapshot.metrics.last_error.clone();
    assert!(last_error.is_some());
    assert!(last_error.unwrap().message.contains("Connection refused"));
}

#[tokio::test]
async fn shutdown_ends_the_event_loop() {
    let connector = StubConnector::new(vec![vec![ServerEvent::Opened]]);
    let (handle, _output, _dir) = spawn_engine(connector, null_input());

    wait_for(&handle, |s| s.state == SessionState::Open).await;
    handle.shutdown().await.unwrap();

    // The queue closes once the loop exits
    let mut dead = false;
    for _ in 0..100 {
        if handle.reset().await.is_err() {
            dead = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(dead, "event loop survived shutdown");
}

// ============================================================================
// Transcript
// ============================================================================

#[tokio::test]
async fn conversation_transcript_assembles_in_order() {
    let connector = StubConnector::new(vec![vec![
        ServerEvent::Opened,
        agent_says("Hel"),
        agent_says("lo!"),
        user_says("Hi"),
        ServerEvent::TurnComplete,
    ]]);
    let (handle, _output, _dir) = spawn_engine(connector, null_input());

    let snapshot = wait_for(&handle, |s| s.history.len() == 2).await;
    assert_eq!(
        snapshot.history,
        vec![
            TranscriptSegment {
                text: "Hello!".to_string(),
                speaker: Speaker::Agent,
            },
            TranscriptSegment {
                text: "Hi".to_string(),
                speaker: Speaker::User,
            },
        ]
    );
    assert!(snapshot.current_turn.is_empty());
    assert_eq!(snapshot.metrics.total_turns, 1);
}

#[tokio::test]
async fn partial_turn_is_visible_before_completion() {
    let connector = StubConnector::new(vec![vec![
        ServerEvent::Opened,
        agent_says("Thinking"),
        agent_says(" out loud"),
    ]]);
    let (handle, _output, _dir) = spawn_engine(connector, null_input());

    let snapshot = wait_for(&handle, |s| {
        s.current_turn
            .first()
            .map(|seg| seg.text == "Thinking out loud")
            .unwrap_or(false)
    })
    .await;
    assert!(snapshot.history.is_empty());
    assert_eq!(snapshot.current_turn.len(), 1);
}

// ============================================================================
// Playback
// ============================================================================

#[tokio::test]
async fn synthesized_chunks_schedule_back_to_back() {
    let connector = StubConnector::new(vec![vec![
        ServerEvent::Opened,
        audio_chunk(0.5),
        audio_chunk(0.25),
    ]]);
    let (_handle, output, _dir) = spawn_engine(connector, null_input());

    {
        let output = output.clone();
        wait_until(move || output.lock().unwrap().started.len() == 2).await;
    }

    let state = output.lock().unwrap();
    let half_second = PLAYBACK_SAMPLE_RATE as usize / 2;
    assert_eq!(state.started[0].1, half_second);
    assert_eq!(state.started[0].2, 0.0);
    assert_eq!(state.started[1].1, half_second / 2);
    // The second chunk begins exactly where the first ends
    assert_eq!(state.started[1].2, 0.5);
}

#[tokio::test]
async fn barge_in_cancels_playback_and_discards_partial_turn() {
    let connector = StubConnector::new(vec![vec![
        ServerEvent::Opened,
        user_says("Hi"),
        ServerEvent::TurnComplete,
        audio_chunk(0.5),
        agent_says("I was about to say"),
        ServerEvent::Interrupted,
    ]]);
    let (handle, output, _dir) = spawn_engine(connector, null_input());

    let snapshot = wait_for(&handle, |s| s.metrics.total_interruptions == 1).await;

    assert_eq!(snapshot.history.len(), 1);
    assert!(snapshot.current_turn.is_empty());

    let state = output.lock().unwrap();
    assert_eq!(state.cancelled.len(), 1);
    assert_eq!(state.cancelled[0], state.started[0].0);
}

// ============================================================================
// Capture
// ============================================================================

#[tokio::test]
async fn capture_pumps_frames_to_the_transport() {
    let connector = StubConnector::new(vec![vec![ServerEvent::Opened]]);
    let sent = connector.sent();
    let input = NullInput {
        frames: 3,
        value: 0.5,
    };
    let (handle, _output, _dir) = spawn_engine(connector, input);

    wait_for(&handle, |s| s.state == SessionState::Open).await;
    handle.start_capture().await.unwrap();

    let snapshot = wait_for(&handle, |s| s.capturing).await;
    assert_eq!(snapshot.status.as_deref(), Some("Listening..."));

    // Configuration plus the three synthesized frames
    {
        let sent = sent.clone();
        wait_until(move || sent.lock().unwrap().len() == 4).await;
    }
    {
        let sent = sent.lock().unwrap();
        assert!(matches!(sent[0], ClientMessage::SessionConfigure { .. }));
        for message in &sent[1..] {
            match message {
                ClientMessage::AudioAppend { mime_type, audio } => {
                    assert_eq!(mime_type, "audio/pcm;rate=16000");
                    assert!(!audio.is_empty());
                }
                other => panic!("expected audio.append, got {:?}", other),
            }
        }
    }

    handle.stop_capture().await.unwrap();
    let snapshot = wait_for(&handle, |s| !s.capturing).await;
    assert_eq!(snapshot.status.as_deref(), Some("Stopped"));
}

// ============================================================================
// Reset and reconfiguration
// ============================================================================

#[tokio::test]
async fn reset_reopens_a_session_and_keeps_history() {
    let connector = StubConnector::new(vec![
        vec![
            ServerEvent::Opened,
            agent_says("Hello"),
            ServerEvent::TurnComplete,
        ],
        vec![ServerEvent::Opened],
    ]);
    let connects = connector.connect_count();
    let (handle, _output, _dir) = spawn_engine(connector, null_input());

    wait_for(&handle, |s| s.history.len() == 1 && s.state == SessionState::Open).await;

    handle.reset().await.unwrap();

    // total_sessions distinguishes the replacement session from the first
    let snapshot = wait_for(&handle, |s| {
        s.metrics.total_sessions == 2 && s.state == SessionState::Open
    })
    .await;
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(snapshot.history.len(), 1);
    assert!(!snapshot.capturing);
}

#[tokio::test]
async fn update_config_applies_to_the_next_session() {
    let connector = StubConnector::new(vec![vec![ServerEvent::Opened], vec![ServerEvent::Opened]]);
    let sent = connector.sent();
    let (handle, _output, dir) = spawn_engine(connector, null_input());

    wait_for(&handle, |s| s.state == SessionState::Open).await;

    handle
        .update_config("Be brief.".to_string(), VoiceId::Puck)
        .await
        .unwrap();
    wait_for(&handle, |s| {
        s.metrics.total_sessions == 2 && s.state == SessionState::Open
    })
    .await;

    let configures: Vec<_> = {
        let sent = sent.lock().unwrap();
        sent.iter()
            .filter_map(|m| match m {
                ClientMessage::SessionConfigure { session } => Some(session.clone()),
                _ => None,
            })
            .collect()
    };
    assert_eq!(configures.len(), 2);
    assert_eq!(configures[1].voice, "Puck");
    assert_eq!(configures[1].system_instruction, "Be brief.");

    // And the settings survived to disk
    let saved = load_settings_from(&dir.path().join("settings.json"));
    assert_eq!(saved.voice, VoiceId::Puck);
    assert_eq!(saved.persona, "Be brief.");
}
