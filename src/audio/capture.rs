//! Microphone capture on a dedicated audio thread
//!
//! CPAL streams are not `Send`, so the stream lives on a thread of its own
//! and the engine talks to it through channels. The callback mixes the
//! device's channels down to mono, resamples to the wire rate, applies the
//! mute gain, and assembles fixed-size frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::resample::resample_linear;
use super::{CAPTURE_FRAME_LEN, CAPTURE_SAMPLE_RATE};

/// Errors that can occur while setting up microphone capture.
#[derive(Debug, Clone)]
pub enum CaptureError {
    NoInputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
    AudioThreadGone,
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::NoInputDevice => write!(f, "No audio input device found"),
            CaptureError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            CaptureError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            CaptureError::AudioThreadGone => write!(f, "Audio thread exited unexpectedly"),
        }
    }
}

impl std::error::Error for CaptureError {}

/// One fixed-size block of mono samples at the wire rate.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub captured_at: Instant,
    pub sequence: u64,
}

/// Source of capture frames.
///
/// `MicInput` is the device-backed implementation; `NullInput` synthesizes
/// frames for tests and headless runs.
pub trait AudioInput: Send {
    /// Start producing frames into `frames` until the returned handle is
    /// stopped or dropped. `muted` is sampled continuously; muted capture
    /// keeps producing frames with the gain applied.
    fn start(
        &self,
        muted: Arc<AtomicBool>,
        frames: mpsc::UnboundedSender<AudioFrame>,
    ) -> Result<CaptureHandle, CaptureError>;
}

/// Handle to an active capture stream.
/// Dropping the handle signals the audio thread to exit.
pub struct CaptureHandle {
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CaptureHandle {
    /// Stop capture and wait for the audio thread to release the device.
    pub fn stop(mut self) {
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        // Dropping the stop sender ends the audio thread. No join here so a
        // drop on the async runtime never blocks.
        self.stop_tx.take();
    }
}

/// Captures from the default input device.
///
/// Device discovery happens per `start()` call, so an unplugged microphone
/// is reported on the attempt that hits it.
pub struct MicInput;

impl AudioInput for MicInput {
    fn start(
        &self,
        muted: Arc<AtomicBool>,
        frames: mpsc::UnboundedSender<AudioFrame>,
    ) -> Result<CaptureHandle, CaptureError> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("voiceloop-capture".to_string())
            .spawn(move || run_capture_thread(muted, frames, ready_tx, stop_rx))
            .map_err(|e| CaptureError::StreamCreationFailed(e.to_string()))?;

        // The stream must be built on the audio thread; wait for it to
        // report whether setup succeeded.
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(CaptureHandle {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(CaptureError::AudioThreadGone)
            }
        }
    }
}

fn run_capture_thread(
    muted: Arc<AtomicBool>,
    frames: mpsc::UnboundedSender<AudioFrame>,
    ready_tx: std::sync::mpsc::Sender<Result<(), CaptureError>>,
    stop_rx: std::sync::mpsc::Receiver<()>,
) {
    let stream = match build_capture_stream(muted, frames) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(CaptureError::StreamCreationFailed(format!(
            "Failed to start stream: {}",
            e
        ))));
        return;
    }

    let _ = ready_tx.send(Ok(()));

    // Park until the handle drops its stop sender, then release the device.
    let _ = stop_rx.recv();
    drop(stream);
    log::debug!("Capture: audio thread exiting");
}

fn build_capture_stream(
    muted: Arc<AtomicBool>,
    frames: mpsc::UnboundedSender<AudioFrame>,
) -> Result<Stream, CaptureError> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or(CaptureError::NoInputDevice)?;

    log::info!("Capture: using input device: {:?}", device.name());

    let supported_config = device
        .default_input_config()
        .map_err(|_| CaptureError::NoSupportedConfig)?;

    log::info!(
        "Capture: device config {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();

    let assembler = FrameAssembler::new(config.channels, config.sample_rate.0, muted, frames);

    let err_fn = |err| log::error!("Capture: stream error: {}", err);

    match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, assembler, err_fn),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, assembler, err_fn),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, assembler, err_fn),
        _ => Err(CaptureError::NoSupportedConfig),
    }
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    mut assembler: FrameAssembler,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<Stream, CaptureError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| f32::from_sample(s)).collect();
                assembler.push(&samples);
            },
            err_fn,
            None,
        )
        .map_err(|e| CaptureError::StreamCreationFailed(e.to_string()))?;

    Ok(stream)
}

/// Accumulates callback batches into fixed-size frames at the wire rate.
struct FrameAssembler {
    channels: u16,
    device_rate: u32,
    muted: Arc<AtomicBool>,
    buffer: Vec<f32>,
    sequence: u64,
    frames: mpsc::UnboundedSender<AudioFrame>,
}

impl FrameAssembler {
    fn new(
        channels: u16,
        device_rate: u32,
        muted: Arc<AtomicBool>,
        frames: mpsc::UnboundedSender<AudioFrame>,
    ) -> Self {
        Self {
            channels,
            device_rate,
            muted,
            buffer: Vec::with_capacity(CAPTURE_FRAME_LEN * 2),
            sequence: 0,
            frames,
        }
    }

    /// Feed one callback batch of interleaved device samples.
    fn push(&mut self, interleaved: &[f32]) {
        let mono = mix_to_mono(interleaved, self.channels);
        let resampled = resample_linear(&mono, self.device_rate, CAPTURE_SAMPLE_RATE);

        // Mute is a gain applied at the source. Frames keep flowing so the
        // upstream cadence does not change while muted.
        let gain = if self.muted.load(Ordering::Relaxed) {
            0.0
        } else {
            1.0
        };
        self.buffer.extend(resampled.iter().map(|s| s * gain));

        while self.buffer.len() >= CAPTURE_FRAME_LEN {
            let samples: Vec<f32> = self.buffer.drain(..CAPTURE_FRAME_LEN).collect();
            let frame = AudioFrame {
                samples,
                captured_at: Instant::now(),
                sequence: self.sequence,
            };
            self.sequence += 1;

            if self.frames.send(frame).is_err() {
                // Receiver gone: capture is stopping
                return;
            }

            // Periodic logging (every 50 frames = ~13 seconds)
            if self.sequence % 50 == 0 {
                log::debug!("Capture: {} frames produced", self.sequence);
            }
        }
    }
}

/// Average interleaved channels down to mono.
fn mix_to_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let n = channels as usize;
    interleaved
        .chunks_exact(n)
        .map(|frame| frame.iter().sum::<f32>() / n as f32)
        .collect()
}

/// Input that synthesizes a burst of constant-value frames and then idles.
/// Used by tests and headless runs where no device is available.
pub struct NullInput {
    pub frames: usize,
    pub value: f32,
}

impl AudioInput for NullInput {
    fn start(
        &self,
        muted: Arc<AtomicBool>,
        frames: mpsc::UnboundedSender<AudioFrame>,
    ) -> Result<CaptureHandle, CaptureError> {
        let count = self.frames as u64;
        let value = self.value;
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let thread = std::thread::spawn(move || {
            for sequence in 0..count {
                let gain = if muted.load(Ordering::Relaxed) { 0.0 } else { 1.0 };
                let frame = AudioFrame {
                    samples: vec![value * gain; CAPTURE_FRAME_LEN],
                    captured_at: Instant::now(),
                    sequence,
                };
                if frames.send(frame).is_err() {
                    return;
                }
            }
            let _ = stop_rx.recv();
        });

        Ok(CaptureHandle {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }
}
