//! Default-device output stream with a chunk mixer
//!
//! Like capture, the CPAL output stream lives on a dedicated audio thread.
//! The callback advances a frames-written counter that serves as the
//! playback clock, sums every active chunk into the output buffer, and
//! reports chunks that finished playing over a channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, Stream, StreamConfig};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::scheduler::PlaybackOutput;
use super::PLAYBACK_SAMPLE_RATE;
use crate::audio::resample_linear;

/// Errors that can occur while setting up device playback.
#[derive(Debug, Clone)]
pub enum PlaybackError {
    NoOutputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
    AudioThreadGone,
}

impl std::fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackError::NoOutputDevice => write!(f, "No audio output device found"),
            PlaybackError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            PlaybackError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            PlaybackError::AudioThreadGone => write!(f, "Audio thread exited unexpectedly"),
        }
    }
}

impl std::error::Error for PlaybackError {}

/// One chunk resampled to the device rate, pinned to a start frame.
struct ActiveChunk {
    samples: Vec<f32>,
    start_frame: u64,
}

/// Chunks the output callback is currently mixing.
#[derive(Default)]
struct Mixer {
    chunks: HashMap<Uuid, ActiveChunk>,
}

impl Mixer {
    /// Mix all active chunks into `out` (mono, one slot per output frame)
    /// for the frames starting at `cursor`. Returns ids of chunks whose
    /// last sample falls before the new cursor.
    fn mix(&mut self, cursor: u64, gain: f32, out: &mut [f32]) -> Vec<Uuid> {
        for (i, slot) in out.iter_mut().enumerate() {
            let frame = cursor + i as u64;
            let mut acc = 0.0f32;
            for chunk in self.chunks.values() {
                if frame >= chunk.start_frame {
                    let idx = (frame - chunk.start_frame) as usize;
                    if idx < chunk.samples.len() {
                        acc += chunk.samples[idx];
                    }
                }
            }
            *slot = (acc * gain).clamp(-1.0, 1.0);
        }

        let end = cursor + out.len() as u64;
        let finished: Vec<Uuid> = self
            .chunks
            .iter()
            .filter(|(_, c)| c.start_frame + c.samples.len() as u64 <= end)
            .map(|(id, _)| *id)
            .collect();
        for id in &finished {
            self.chunks.remove(id);
        }
        finished
    }
}

/// Plays scheduled chunks on the default output device.
///
/// The frames-written counter is the playback clock: it only advances while
/// the stream is running, so scheduled start times line up with what the
/// device actually played.
pub struct DeviceOutput {
    mixer: Arc<Mutex<Mixer>>,
    frames_written: Arc<AtomicU64>,
    device_rate: u32,
    done_rx: Option<mpsc::UnboundedReceiver<Uuid>>,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    _thread: Option<std::thread::JoinHandle<()>>,
}

impl DeviceOutput {
    /// Open the default output device. `muted` is sampled by the callback;
    /// muting silences the output without touching the clock or the mixer.
    pub fn new(muted: Arc<AtomicBool>) -> Result<Self, PlaybackError> {
        let mixer: Arc<Mutex<Mixer>> = Arc::new(Mutex::new(Mixer::default()));
        let frames_written = Arc::new(AtomicU64::new(0));
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("voiceloop-playback".to_string())
            .spawn({
                let mixer = mixer.clone();
                let frames_written = frames_written.clone();
                move || {
                    run_playback_thread(mixer, frames_written, muted, done_tx, ready_tx, stop_rx)
                }
            })
            .map_err(|e| PlaybackError::StreamCreationFailed(e.to_string()))?;

        let device_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(PlaybackError::AudioThreadGone);
            }
        };

        Ok(Self {
            mixer,
            frames_written,
            device_rate,
            done_rx: Some(done_rx),
            stop_tx: Some(stop_tx),
            _thread: Some(thread),
        })
    }

    /// Take the completion channel carrying ids of chunks that finished
    /// playing. Returns None if already taken.
    pub fn take_done_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<Uuid>> {
        self.done_rx.take()
    }
}

impl PlaybackOutput for DeviceOutput {
    fn now(&self) -> f64 {
        self.frames_written.load(Ordering::Relaxed) as f64 / self.device_rate as f64
    }

    fn start_at(&mut self, id: Uuid, samples: Vec<f32>, start: f64) {
        let samples = resample_linear(&samples, PLAYBACK_SAMPLE_RATE, self.device_rate);
        let start_frame = (start * self.device_rate as f64).round() as u64;
        self.mixer
            .lock()
            .unwrap()
            .chunks
            .insert(id, ActiveChunk {
                samples,
                start_frame,
            });
    }

    fn cancel(&mut self, id: Uuid) {
        self.mixer.lock().unwrap().chunks.remove(&id);
    }
}

impl Drop for DeviceOutput {
    fn drop(&mut self) {
        // Dropping the stop sender ends the audio thread; no join so drops
        // on the async runtime never block.
        self.stop_tx.take();
    }
}

fn run_playback_thread(
    mixer: Arc<Mutex<Mixer>>,
    frames_written: Arc<AtomicU64>,
    muted: Arc<AtomicBool>,
    done_tx: mpsc::UnboundedSender<Uuid>,
    ready_tx: std::sync::mpsc::Sender<Result<u32, PlaybackError>>,
    stop_rx: std::sync::mpsc::Receiver<()>,
) {
    let (stream, device_rate) = match build_output_stream(mixer, frames_written, muted, done_tx) {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(PlaybackError::StreamCreationFailed(format!(
            "Failed to start stream: {}",
            e
        ))));
        return;
    }

    let _ = ready_tx.send(Ok(device_rate));

    // Park until the handle drops its stop sender, then release the device.
    let _ = stop_rx.recv();
    drop(stream);
    log::debug!("Playback: audio thread exiting");
}

fn build_output_stream(
    mixer: Arc<Mutex<Mixer>>,
    frames_written: Arc<AtomicU64>,
    muted: Arc<AtomicBool>,
    done_tx: mpsc::UnboundedSender<Uuid>,
) -> Result<(Stream, u32), PlaybackError> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or(PlaybackError::NoOutputDevice)?;

    log::info!("Playback: using output device: {:?}", device.name());

    let supported_config = device
        .default_output_config()
        .map_err(|_| PlaybackError::NoSupportedConfig)?;

    log::info!(
        "Playback: device config {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();
    let device_rate = config.sample_rate.0;

    let stream = match sample_format {
        SampleFormat::I16 => {
            build_stream_typed::<i16>(&device, &config, mixer, frames_written, muted, done_tx)
        }
        SampleFormat::U16 => {
            build_stream_typed::<u16>(&device, &config, mixer, frames_written, muted, done_tx)
        }
        SampleFormat::F32 => {
            build_stream_typed::<f32>(&device, &config, mixer, frames_written, muted, done_tx)
        }
        _ => Err(PlaybackError::NoSupportedConfig),
    }?;

    Ok((stream, device_rate))
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
    frames_written: Arc<AtomicU64>,
    muted: Arc<AtomicBool>,
    done_tx: mpsc::UnboundedSender<Uuid>,
) -> Result<Stream, PlaybackError>
where
    T: cpal::SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels as usize;
    let err_fn = |err| log::error!("Playback: stream error: {}", err);

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                let cursor = frames_written.load(Ordering::Relaxed);
                let gain = if muted.load(Ordering::Relaxed) { 0.0 } else { 1.0 };

                let mut mono = vec![0.0f32; frames];
                let finished = mixer.lock().unwrap().mix(cursor, gain, &mut mono);

                for (out_frame, sample) in data.chunks_mut(channels).zip(mono.iter()) {
                    let value = T::from_sample(*sample);
                    for slot in out_frame {
                        *slot = value;
                    }
                }

                frames_written.store(cursor + frames as u64, Ordering::Relaxed);

                for id in finished {
                    let _ = done_tx.send(id);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| PlaybackError::StreamCreationFailed(e.to_string()))?;

    Ok(stream)
}
