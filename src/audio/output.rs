//! Speaker output
//!
//! The output device plays one buffer at a time and reports each buffer's
//! completion through a callback, which the client turns into an event for
//! the playback scheduler.

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SampleFormat, Stream, StreamConfig};

use super::{pick_config, spawn_stream_thread, ConfigCandidate, DeviceError, StreamGuard};
use crate::streaming::{SampleFrame, WIRE_SAMPLE_RATE};

/// Destination for decoded buffers.
///
/// `submit` hands over exactly one buffer; the sink reports completion of
/// `ticket` later and out of band.
pub trait OutputSink {
    fn submit(&mut self, ticket: u64, buffer: SampleFrame) -> Result<(), DeviceError>;
}

type CompletionFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Buffer currently owned by the device callback
#[derive(Debug)]
struct Playing {
    ticket: u64,
    samples: SampleFrame,
    /// Position in device frames
    pos: usize,
}

type Slot = Arc<Mutex<Option<Playing>>>;

/// CPAL-backed default output device.
///
/// The stream is opened on first use and kept open (writing silence between
/// buffers) until `close()` or drop.
pub struct CpalOutput {
    slot: Slot,
    on_complete: CompletionFn,
    guard: Option<StreamGuard>,
}

impl CpalOutput {
    pub fn new(on_complete: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            on_complete: Arc::new(on_complete),
            guard: None,
        }
    }

    fn ensure_open(&mut self) -> Result<(), DeviceError> {
        if self.guard.is_some() {
            return Ok(());
        }

        let slot = self.slot.clone();
        let on_complete = self.on_complete.clone();
        let guard = spawn_stream_thread("voicelink-playback", move || {
            build_output(slot, on_complete)
        })?;
        self.guard = Some(guard);
        Ok(())
    }

    /// Release the output device, discarding any buffer mid-playback
    pub fn close(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.stop();
            if let Ok(mut slot) = self.slot.lock() {
                *slot = None;
            }
            log::info!("Playback device released");
        }
    }
}

impl OutputSink for CpalOutput {
    fn submit(&mut self, ticket: u64, buffer: SampleFrame) -> Result<(), DeviceError> {
        self.ensure_open()?;

        let mut slot = self
            .slot
            .lock()
            .map_err(|_| DeviceError::StreamFailed("output state poisoned".to_string()))?;
        if slot.is_some() {
            return Err(DeviceError::StreamFailed(
                "output is still playing a buffer".to_string(),
            ));
        }

        *slot = Some(Playing {
            ticket,
            samples: buffer,
            pos: 0,
        });
        Ok(())
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Fill interleaved device frames from the playing buffer.
///
/// Each wire sample is repeated `repeat` frames and copied to every channel.
/// Frames past the end of the buffer are silence, and stay silent until the
/// next buffer is submitted; that gap is where chunk boundaries become
/// audible. Returns the ticket of a buffer that finished during this call.
fn fill_frames(
    slot: &mut Option<Playing>,
    out: &mut [f32],
    channels: usize,
    repeat: usize,
) -> Option<u64> {
    let channels = channels.max(1);
    let repeat = repeat.max(1);
    let mut finished = None;

    for frame in out.chunks_mut(channels) {
        let mut value = 0.0;
        let mut done = None;

        if let Some(playing) = slot.as_mut() {
            if let Some(&sample) = playing.samples.get(playing.pos / repeat) {
                value = sample;
                playing.pos += 1;
            }
            if playing.pos >= playing.samples.len() * repeat {
                done = Some(playing.ticket);
            }
        }

        if let Some(ticket) = done {
            *slot = None;
            finished = Some(ticket);
        }
        frame.fill(value);
    }

    finished
}

fn build_output(slot: Slot, on_complete: CompletionFn) -> Result<Stream, DeviceError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(DeviceError::NoDevice)?;

    log::info!("Using audio output device: {:?}", device.name());

    let ranges: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))?
        .collect();
    let candidates: Vec<ConfigCandidate> = ranges.iter().map(ConfigCandidate::from).collect();
    let (index, rate) = pick_config(&candidates).ok_or(DeviceError::NoSupportedConfig)?;

    let supported = ranges[index].clone().with_sample_rate(cpal::SampleRate(rate));
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let repeat = (rate / WIRE_SAMPLE_RATE) as usize;

    log::info!(
        "Playback config: {} Hz, {} channels, {:?}",
        rate,
        config.channels,
        sample_format
    );

    let stream = match sample_format {
        SampleFormat::I16 => build_output_typed::<i16>(&device, &config, repeat, slot, on_complete),
        SampleFormat::U16 => build_output_typed::<u16>(&device, &config, repeat, slot, on_complete),
        SampleFormat::F32 => build_output_typed::<f32>(&device, &config, repeat, slot, on_complete),
        _ => Err(DeviceError::NoSupportedConfig),
    }?;

    stream
        .play()
        .map_err(|e| DeviceError::StreamCreationFailed(format!("Failed to start stream: {}", e)))?;

    Ok(stream)
}

fn build_output_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    repeat: usize,
    slot: Slot,
    on_complete: CompletionFn,
) -> Result<Stream, DeviceError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.clear();
                scratch.resize(data.len(), 0.0);

                let finished = match slot.lock() {
                    Ok(mut playing) => fill_frames(&mut playing, &mut scratch, channels, repeat),
                    Err(_) => None,
                };

                for (out, &s) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(s);
                }

                // Outside the lock: the callback may submit the next buffer
                if let Some(ticket) = finished {
                    on_complete(ticket);
                }
            },
            |err| log::error!("Audio output stream error: {}", err),
            None,
        )
        .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playing(ticket: u64, samples: Vec<f32>) -> Option<Playing> {
        Some(Playing {
            ticket,
            samples,
            pos: 0,
        })
    }

    #[test]
    fn test_fill_completes_buffer_once() {
        let mut slot = playing(7, vec![0.1, 0.2, 0.3]);
        let mut out = vec![1.0; 2];

        assert_eq!(fill_frames(&mut slot, &mut out, 1, 1), None);
        assert_eq!(out, vec![0.1, 0.2]);

        let mut out = vec![1.0; 3];
        assert_eq!(fill_frames(&mut slot, &mut out, 1, 1), Some(7));
        assert_eq!(out, vec![0.3, 0.0, 0.0]);
        assert!(slot.is_none());

        // Nothing playing: silence, no completion
        let mut out = vec![1.0; 2];
        assert_eq!(fill_frames(&mut slot, &mut out, 1, 1), None);
        assert_eq!(out, vec![0.0, 0.0]);
    }

    #[test]
    fn test_fill_exact_length_completes() {
        let mut slot = playing(1, vec![0.5, 0.5]);
        let mut out = vec![0.0; 2];

        assert_eq!(fill_frames(&mut slot, &mut out, 1, 1), Some(1));
        assert_eq!(out, vec![0.5, 0.5]);
    }

    #[test]
    fn test_fill_upsamples_and_duplicates_channels() {
        let mut slot = playing(3, vec![0.25, -0.25]);
        // 48kHz stereo: 3 frames per sample, 2 channels per frame
        let mut out = vec![0.0; 12];

        assert_eq!(fill_frames(&mut slot, &mut out, 2, 3), Some(3));
        assert!(out[..6].iter().all(|&s| s == 0.25));
        assert!(out[6..].iter().all(|&s| s == -0.25));
    }

    #[test]
    fn test_fill_empty_buffer_completes_immediately() {
        let mut slot = playing(9, Vec::new());
        let mut out = vec![1.0; 2];

        assert_eq!(fill_frames(&mut slot, &mut out, 1, 1), Some(9));
        assert_eq!(out, vec![0.0, 0.0]);
    }
}
