//! Back-to-back scheduling of decoded audio chunks
//!
//! Chunks arrive faster than real time, so each one reserves the time slot
//! right after the previous reservation. Barge-in cancels every live chunk
//! and clears the reservation so the next chunk starts immediately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use super::PLAYBACK_SAMPLE_RATE;

/// Where scheduled audio actually goes.
///
/// `DeviceOutput` is the device-backed implementation; tests drive the
/// scheduler with `ManualOutput` and a hand-advanced clock.
pub trait PlaybackOutput: Send {
    /// Monotonic playback clock in seconds.
    fn now(&self) -> f64;

    /// Begin playing `samples` (mono at `PLAYBACK_SAMPLE_RATE`) at `start`
    /// seconds on the playback clock.
    fn start_at(&mut self, id: Uuid, samples: Vec<f32>, start: f64);

    /// Stop and discard one chunk.
    fn cancel(&mut self, id: Uuid);
}

/// A chunk the scheduler has reserved time for.
#[derive(Debug, Clone, Copy)]
pub struct ScheduledPlayback {
    /// Start time on the playback clock (seconds)
    pub start: f64,
    /// Chunk length (seconds)
    pub duration: f64,
}

/// Reserves playback time for each chunk and tracks the live set.
pub struct PlaybackScheduler {
    output: Box<dyn PlaybackOutput>,
    /// End of the last reservation; None when nothing is reserved.
    next_start_time: Option<f64>,
    /// Chunks handed to the output and not yet reported finished.
    live: HashMap<Uuid, ScheduledPlayback>,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn PlaybackOutput>) -> Self {
        Self {
            output,
            next_start_time: None,
            live: HashMap::new(),
        }
    }

    /// Reserve the next slot for a decoded chunk and hand it to the output.
    ///
    /// Returns None for an empty chunk, which reserves nothing.
    pub fn schedule(&mut self, samples: Vec<f32>) -> Option<Uuid> {
        if samples.is_empty() {
            return None;
        }

        let id = Uuid::new_v4();
        let duration = samples.len() as f64 / PLAYBACK_SAMPLE_RATE as f64;

        // The start is the later of the pending reservation and the clock:
        // a reservation that fell behind real time must never pull a new
        // chunk into the past.
        let now = self.output.now();
        let start = self.next_start_time.unwrap_or(now).max(now);

        self.next_start_time = Some(start + duration);
        self.live.insert(id, ScheduledPlayback { start, duration });
        self.output.start_at(id, samples, start);

        log::debug!(
            "Playback: scheduled {} at {:.3}s ({:.0}ms, {} live)",
            id,
            start,
            duration * 1000.0,
            self.live.len()
        );

        Some(id)
    }

    /// Drop a chunk that finished playing. Unknown ids are ignored.
    pub fn finished(&mut self, id: Uuid) {
        if self.live.remove(&id).is_some() {
            log::debug!("Playback: finished {} ({} live)", id, self.live.len());
        }
    }

    /// Cancel every live chunk and clear the reservation.
    ///
    /// The next scheduled chunk starts at the clock's current position.
    pub fn interrupt(&mut self) {
        let cancelled = self.live.len();
        for id in self.live.keys().copied().collect::<Vec<_>>() {
            self.output.cancel(id);
        }
        self.live.clear();
        self.next_start_time = None;

        if cancelled > 0 {
            log::info!("Playback: interrupted, cancelled {} chunks", cancelled);
        }
    }

    /// Number of chunks playing or waiting to play.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// End of the current reservation, if any.
    pub fn reserved_until(&self) -> Option<f64> {
        self.next_start_time
    }
}

// ============================================================================
// Test output
// ============================================================================

/// State captured by [`ManualOutput`] for assertions.
#[derive(Debug, Default)]
pub struct ManualOutputState {
    /// Hand-advanced playback clock (seconds)
    pub clock: f64,
    /// (id, sample count, start time) for each `start_at` call
    pub started: Vec<(Uuid, usize, f64)>,
    /// Ids passed to `cancel`
    pub cancelled: Vec<Uuid>,
}

/// Scripted output for tests: a hand-advanced clock and a log of calls.
pub struct ManualOutput {
    state: Arc<Mutex<ManualOutputState>>,
}

impl ManualOutput {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualOutputState::default())),
        }
    }

    /// Shared handle to the recorded state, kept by the test.
    pub fn state(&self) -> Arc<Mutex<ManualOutputState>> {
        self.state.clone()
    }
}

impl Default for ManualOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackOutput for ManualOutput {
    fn now(&self) -> f64 {
        self.state.lock().unwrap().clock
    }

    fn start_at(&mut self, id: Uuid, samples: Vec<f32>, start: f64) {
        self.state
            .lock()
            .unwrap()
            .started
            .push((id, samples.len(), start));
    }

    fn cancel(&mut self, id: Uuid) {
        self.state.lock().unwrap().cancelled.push(id);
    }
}
