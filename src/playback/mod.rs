//! Gapless playback of streamed audio
//!
//! Downstream audio arrives as independent PCM chunks that must play
//! back-to-back. The scheduler reserves a start time for each chunk against
//! a monotonic playback clock; the device output mixes every scheduled chunk
//! into the output stream and reports completions.
//!
//! # Architecture
//!
//! ```text
//! decoded chunk ──▶ PlaybackScheduler ── start_at(id, samples, t) ──▶ DeviceOutput
//!                     │ next start time                                │ mixer callback
//!                     │ live chunk set                                 │ frames-written clock
//!                     ◀───────────────── finished(id) ─────────────────┘
//! ```

pub mod device;
pub mod scheduler;

pub use device::{DeviceOutput, PlaybackError};
pub use scheduler::{
    ManualOutput, ManualOutputState, PlaybackOutput, PlaybackScheduler, ScheduledPlayback,
};

/// Sample rate of downstream audio chunks (mono PCM16)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;
