//! Transcript aggregation for the live conversation view
//!
//! Aggregates partial transcript deltas from the service into an ordered,
//! turn-by-turn conversation log.
//!
//! # Aggregation Strategy
//!
//! - **Deltas**: merged into the in-progress turn as they arrive; adjacent
//!   fragments from the same speaker grow one segment
//! - **Turn complete**: the in-progress turn is committed to history in order
//! - **Interrupted**: the in-progress turn is discarded; history never changes
//!
//! History is append-only and survives session resets. The service holds no
//! transcript state for us, so everything rendered comes from here.

use serde::Serialize;

use super::protocol::Speaker;

/// One contiguous run of text from a single speaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptSegment {
    pub text: String,
    pub speaker: Speaker,
}

/// Aggregates transcript deltas into turns
///
/// Tracks the committed conversation history and the turn currently in
/// flight. Use `rendered()` to get the full display order at any moment.
#[derive(Debug, Clone)]
pub struct TranscriptAggregator {
    /// Committed turns, oldest first
    history: Vec<TranscriptSegment>,
    /// Segments of the turn currently in flight
    current_turn: Vec<TranscriptSegment>,
    /// Count of delta events processed
    delta_count: u64,
}

impl Default for TranscriptAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptAggregator {
    /// Create a new empty aggregator
    pub fn new() -> Self {
        Self {
            history: Vec::new(),
            current_turn: Vec::new(),
            delta_count: 0,
        }
    }

    /// Process an incoming transcript delta
    ///
    /// Empty deltas are ignored. A delta from the same speaker as the last
    /// in-flight segment extends that segment; a speaker change starts a new
    /// one. Interleaved speakers therefore produce alternating segments in
    /// arrival order.
    ///
    /// # Arguments
    /// * `speaker` - Which side of the conversation produced the text
    /// * `text` - The partial text fragment from the service
    pub fn append_partial(&mut self, speaker: Speaker, text: &str) {
        if text.is_empty() {
            return;
        }

        match self.current_turn.last_mut() {
            Some(last) if last.speaker == speaker => last.text.push_str(text),
            _ => self.current_turn.push(TranscriptSegment {
                text: text.to_string(),
                speaker,
            }),
        }

        self.delta_count += 1;
        if self.delta_count % 10 == 0 {
            log::debug!(
                "TranscriptAggregator: {} deltas, {} committed segments, {} in flight",
                self.delta_count,
                self.history.len(),
                self.current_turn.len()
            );
        }
    }

    /// Commit the in-flight turn to history
    ///
    /// Segments move in order and the in-flight turn is left empty. A
    /// completion with nothing in flight is a no-op.
    pub fn complete_turn(&mut self) {
        if self.current_turn.is_empty() {
            return;
        }
        log::info!(
            "TranscriptAggregator: turn complete with {} segment(s), history now {}",
            self.current_turn.len(),
            self.history.len() + self.current_turn.len()
        );
        self.history.append(&mut self.current_turn);
    }

    /// Discard the in-flight turn after a barge-in
    ///
    /// History is untouched. Text the service abandoned mid-synthesis never
    /// reaches the committed log.
    pub fn interrupt(&mut self) {
        if !self.current_turn.is_empty() {
            log::debug!(
                "TranscriptAggregator: discarding {} in-flight segment(s)",
                self.current_turn.len()
            );
            self.current_turn.clear();
        }
    }

    /// Committed turns, oldest first
    pub fn history(&self) -> &[TranscriptSegment] {
        &self.history
    }

    /// Segments of the turn currently in flight
    pub fn current_turn(&self) -> &[TranscriptSegment] {
        &self.current_turn
    }

    /// Full display order: history followed by the in-flight turn
    pub fn rendered(&self) -> Vec<TranscriptSegment> {
        let mut rendered = self.history.clone();
        rendered.extend(self.current_turn.iter().cloned());
        rendered
    }

    /// Check if anything has been transcribed at all
    pub fn is_empty(&self) -> bool {
        self.history.is_empty() && self.current_turn.is_empty()
    }

    /// Get count of deltas processed
    pub fn delta_count(&self) -> u64 {
        self.delta_count
    }
}
