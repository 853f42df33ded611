//! Metrics collection for Voiceloop
//!
//! Tracks per-session counters and error history for diagnostics.
//! A session spans one transport connection, from dial to close.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Maximum number of completed sessions to retain in history
const MAX_SESSION_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Metrics for a completed streaming session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    /// Unique identifier for this session
    pub session_id: String,
    /// Unix timestamp when the session started (seconds)
    pub started_at: u64,
    /// Wall-clock session length in milliseconds
    pub duration_ms: u64,
    /// Audio frames sent upstream
    pub frames_sent: u64,
    /// Playback chunks scheduled from downstream audio
    pub chunks_scheduled: u64,
    /// Downstream chunks that failed to decode
    pub decode_failures: u64,
    /// Completed agent turns
    pub turns_completed: u64,
    /// Barge-in interruptions
    pub interruptions: u64,
    /// Whether the session ended without a transport error
    pub clean_close: bool,
    /// Error message if the session failed
    pub error_message: Option<String>,
}

/// Summary statistics across all recorded sessions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSummary {
    /// Total number of sessions attempted
    pub total_sessions: u64,
    /// Sessions that closed without a transport error
    pub clean_sessions: u64,
    /// Sessions that ended in a transport error
    pub failed_sessions: u64,
    /// Average session length (ms) across clean sessions
    pub avg_session_duration_ms: u64,
    /// Completed turns, including the session still in progress
    pub total_turns: u64,
    /// Interruptions, including the session still in progress
    pub total_interruptions: u64,
    /// Most recent error, if any
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp when error occurred (seconds)
    pub timestamp: u64,
    /// Category of error (e.g., "capture", "transport", "decode")
    pub error_type: String,
    /// Human-readable error message
    pub message: String,
    /// Associated session ID, if applicable
    pub session_id: Option<String>,
}

/// Internal state for tracking an in-progress session
struct SessionInProgress {
    session_id: Uuid,
    started_at: Instant,
    started_at_unix: u64,
    chunks_scheduled: u64,
    decode_failures: u64,
    turns_completed: u64,
    interruptions: u64,
    error: Option<String>,
}

impl SessionInProgress {
    fn new(session_id: Uuid) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            session_id,
            started_at: Instant::now(),
            started_at_unix: now,
            chunks_scheduled: 0,
            decode_failures: 0,
            turns_completed: 0,
            interruptions: 0,
            error: None,
        }
    }

    fn to_metrics(&self, frames_sent: u64) -> SessionMetrics {
        SessionMetrics {
            session_id: self.session_id.to_string(),
            started_at: self.started_at_unix,
            duration_ms: self.started_at.elapsed().as_millis() as u64,
            frames_sent,
            chunks_scheduled: self.chunks_scheduled,
            decode_failures: self.decode_failures,
            turns_completed: self.turns_completed,
            interruptions: self.interruptions,
            clean_close: self.error.is_none(),
            error_message: self.error.clone(),
        }
    }
}

/// Collects and stores metrics for streaming sessions
pub struct MetricsCollector {
    /// History of completed sessions (newest first)
    history: VecDeque<SessionMetrics>,
    /// History of errors (newest first)
    errors: VecDeque<ErrorRecord>,
    /// Currently in-progress session, if any
    current_session: Option<SessionInProgress>,
    /// Total sessions ever attempted
    total_sessions: u64,
    /// Total sessions that closed cleanly
    clean_sessions: u64,
    /// Total sessions that closed with an error
    failed_sessions: u64,
}

impl MetricsCollector {
    /// Create a new empty metrics collector
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_SESSION_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current_session: None,
            total_sessions: 0,
            clean_sessions: 0,
            failed_sessions: 0,
        }
    }

    /// Start tracking a new session
    ///
    /// If a session is already in progress, it will be flushed as failed
    /// (this indicates a controller bug).
    pub fn session_started(&mut self, session_id: Uuid) {
        if let Some(old) = self.current_session.take() {
            log::warn!(
                "Metrics: discarding in-progress session {} to start new session {}",
                old.session_id,
                session_id
            );
            let mut old = old;
            old.error = Some("Discarded: new session started".to_string());
            let metrics = old.to_metrics(0);
            self.add_to_history(metrics);
        }

        log::debug!("Metrics: starting session {}", session_id);
        self.current_session = Some(SessionInProgress::new(session_id));
        self.total_sessions += 1;
    }

    /// Count a playback chunk scheduled from downstream audio
    pub fn chunk_scheduled(&mut self) {
        if let Some(ref mut session) = self.current_session {
            session.chunks_scheduled += 1;
        }
    }

    /// Count a downstream chunk that failed to decode, and record the error
    pub fn decode_failed(&mut self, message: String) {
        let session_id = self.current_session.as_ref().map(|s| s.session_id.to_string());
        if let Some(ref mut session) = self.current_session {
            session.decode_failures += 1;
        }
        self.record_error("decode".to_string(), message, session_id);
    }

    /// Count a completed agent turn
    pub fn turn_completed(&mut self) {
        if let Some(ref mut session) = self.current_session {
            session.turns_completed += 1;
        }
    }

    /// Count a barge-in interruption
    pub fn interruption(&mut self) {
        if let Some(ref mut session) = self.current_session {
            session.interruptions += 1;
        }
    }

    /// Record a transport error against the current session
    pub fn transport_error(&mut self, message: String) {
        let session_id = self.current_session.as_ref().map(|s| s.session_id.to_string());
        if let Some(ref mut session) = self.current_session {
            session.error = Some(message.clone());
        }
        self.record_error("transport".to_string(), message, session_id);
    }

    /// Close out the current session and add it to history
    pub fn session_closed(&mut self, frames_sent: u64) {
        if let Some(session) = self.current_session.take() {
            let metrics = session.to_metrics(frames_sent);
            log::info!(
                "Metrics: session {} closed - {}ms, {} frames up, {} chunks down, {} turns",
                metrics.session_id,
                metrics.duration_ms,
                metrics.frames_sent,
                metrics.chunks_scheduled,
                metrics.turns_completed
            );
            self.add_to_history(metrics);
        }
    }

    /// Discard the current session without recording metrics
    ///
    /// Used when a session is torn down before it ever opened.
    pub fn session_cancelled(&mut self) {
        if let Some(session) = self.current_session.take() {
            log::debug!("Metrics: session {} cancelled", session.session_id);
            // Don't add to history - cancelled sessions aren't counted
            // But decrement total since we incremented on start
            self.total_sessions = self.total_sessions.saturating_sub(1);
        }
    }

    /// Record an error (not necessarily tied to a session)
    pub fn record_error(&mut self, error_type: String, message: String, session_id: Option<String>) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let error = ErrorRecord {
            timestamp: now,
            error_type,
            message,
            session_id,
        };

        log::debug!("Metrics: recording error - {:?}", error);

        // Add to front (newest first)
        self.errors.push_front(error);

        // Trim if over limit
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    /// Get summary statistics
    ///
    /// Turn and interruption totals include the session still in progress,
    /// so the summary is live while a conversation is running.
    pub fn get_summary(&self) -> MetricsSummary {
        let clean: Vec<_> = self.history.iter().filter(|s| s.clean_close).collect();
        let count = clean.len() as u64;

        let avg_duration = if count > 0 {
            clean.iter().map(|s| s.duration_ms).sum::<u64>() / count
        } else {
            0
        };

        let live_turns = self.current_session.as_ref().map_or(0, |s| s.turns_completed);
        let live_interruptions = self.current_session.as_ref().map_or(0, |s| s.interruptions);

        MetricsSummary {
            total_sessions: self.total_sessions,
            clean_sessions: self.clean_sessions,
            failed_sessions: self.failed_sessions,
            avg_session_duration_ms: avg_duration,
            total_turns: self.history.iter().map(|s| s.turns_completed).sum::<u64>() + live_turns,
            total_interruptions: self.history.iter().map(|s| s.interruptions).sum::<u64>()
                + live_interruptions,
            last_error: self.errors.front().cloned(),
        }
    }

    /// Get the session history (newest first)
    pub fn get_history(&self) -> Vec<SessionMetrics> {
        self.history.iter().cloned().collect()
    }

    /// Get the error history (newest first)
    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    fn add_to_history(&mut self, metrics: SessionMetrics) {
        if metrics.clean_close {
            self.clean_sessions += 1;
        } else {
            self.failed_sessions += 1;
        }

        // Add to front (newest first)
        self.history.push_front(metrics);

        // Trim if over limit
        while self.history.len() > MAX_SESSION_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
