//! Audio device layer for voicelink
//!
//! Microphone capture (fixed 16kHz mono blocks) and speaker output (one
//! buffer at a time with completion events). Uses CPAL for both directions.
//! CPAL streams are `!Send`, so each stream lives on a dedicated thread and
//! talks to the rest of the client through channels and atomics.

mod blocks;
pub mod capture;
pub mod output;

pub use blocks::BlockAssembler;
pub use capture::{BlockCallback, CaptureDevice, CaptureError, CaptureStream, CpalCaptureDevice};
pub use output::{CpalOutput, OutputSink};

/// Default capture block size in samples (256ms at 16kHz)
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Errors raised by the audio devices.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceError {
    NoDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
    StreamFailed(String),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::NoDevice => write!(f, "No audio device found"),
            DeviceError::NoSupportedConfig => {
                write!(f, "No supported audio configuration (need 16kHz-compatible rate)")
            }
            DeviceError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            DeviceError::StreamFailed(e) => write!(f, "Audio stream failed: {}", e),
        }
    }
}

impl std::error::Error for DeviceError {}

/// Sample rates we can convert to the wire rate, in order of preference
const PREFERRED_RATES: [u32; 4] = [16_000, 48_000, 32_000, 96_000];

/// One supported stream configuration range reported by a device
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ConfigCandidate {
    pub channels: u16,
    pub min_rate: u32,
    pub max_rate: u32,
    pub format: cpal::SampleFormat,
}

impl From<&cpal::SupportedStreamConfigRange> for ConfigCandidate {
    fn from(range: &cpal::SupportedStreamConfigRange) -> Self {
        Self {
            channels: range.channels(),
            min_rate: range.min_sample_rate().0,
            max_rate: range.max_sample_rate().0,
            format: range.sample_format(),
        }
    }
}

/// Choose a configuration and rate: native 16kHz first, then integer
/// multiples of it, fewest channels within a rate.
pub(crate) fn pick_config(candidates: &[ConfigCandidate]) -> Option<(usize, u32)> {
    use cpal::SampleFormat;

    PREFERRED_RATES.iter().find_map(|&rate| {
        candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                matches!(c.format, SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16)
                    && c.channels > 0
                    && c.min_rate <= rate
                    && rate <= c.max_rate
            })
            .min_by_key(|(_, c)| c.channels)
            .map(|(index, _)| (index, rate))
    })
}

/// Keeps a device stream alive; stopping (or dropping) it releases the device.
pub struct StreamGuard {
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamGuard {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    /// Release the device, waiting until no callback is running
    pub fn stop(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Run a CPAL stream on its own thread until the guard is stopped.
///
/// `build` runs on the new thread and returns the playing stream; the call
/// returns once the stream is running or has failed to start.
pub(crate) fn spawn_stream_thread<F>(name: &str, build: F) -> Result<StreamGuard, DeviceError>
where
    F: FnOnce() -> Result<cpal::Stream, DeviceError> + Send + 'static,
{
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), DeviceError>>();
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
    let thread_name = name.to_string();

    let thread = std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let stream = match build() {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            // Park until stopped (or the guard is dropped)
            let _ = stop_rx.recv();
            drop(stream);
            log::debug!("{}: stream released", thread_name);
        })
        .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(StreamGuard::new(move || {
            let _ = stop_tx.send(());
            if thread.join().is_err() {
                log::error!("Audio stream thread panicked");
            }
        })),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => {
            let _ = thread.join();
            Err(DeviceError::StreamCreationFailed(
                "audio thread exited during setup".to_string(),
            ))
        }
    }
}
