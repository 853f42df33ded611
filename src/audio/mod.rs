//! Audio capture module using CPAL
//!
//! Captures microphone audio on a dedicated thread and delivers fixed-size
//! 16 kHz mono frames to the session engine.

pub mod capture;
pub mod resample;

pub use capture::{AudioFrame, AudioInput, CaptureError, CaptureHandle, MicInput, NullInput};
pub use resample::resample_linear;

/// Wire sample rate for upstream audio (mono PCM16)
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Samples per upstream frame (256 ms at 16 kHz)
pub const CAPTURE_FRAME_LEN: usize = 4096;
