//! Microphone capture stream
//!
//! CaptureStream pulls audio from the input device, assembles fixed-size
//! 16kHz mono blocks and offers each one to the transport. Capture never
//! waits on the network: a block the transport cannot take is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SampleFormat, Stream, StreamConfig};

use super::{
    pick_config, spawn_stream_thread, BlockAssembler, ConfigCandidate, DeviceError, StreamGuard,
};
use crate::streaming::{AudioSender, SampleFrame, SendOutcome};

/// Receives each assembled 16kHz mono block on the device thread
pub type BlockCallback = Box<dyn FnMut(SampleFrame) + Send + 'static>;

/// Errors that can occur when starting capture.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureError {
    AlreadyRecording,
    Device(DeviceError),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::AlreadyRecording => write!(f, "Capture is already running"),
            CaptureError::Device(e) => write!(f, "Microphone unavailable: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<DeviceError> for CaptureError {
    fn from(e: DeviceError) -> Self {
        CaptureError::Device(e)
    }
}

/// Source of fixed-size 16kHz mono blocks.
pub trait CaptureDevice: Send {
    /// Open the input and deliver `block_size`-sample blocks to `on_block`
    /// until the returned guard is stopped.
    fn open(
        &mut self,
        block_size: usize,
        on_block: BlockCallback,
    ) -> Result<StreamGuard, DeviceError>;
}

struct ActiveCapture {
    gate: Arc<AtomicBool>,
    guard: StreamGuard,
}

/// Microphone capture bound to the current transport sender.
pub struct CaptureStream {
    device: Box<dyn CaptureDevice>,
    block_size: usize,
    active: Option<ActiveCapture>,
}

impl CaptureStream {
    pub fn new(device: Box<dyn CaptureDevice>, block_size: usize) -> Self {
        Self {
            device,
            block_size,
            active: None,
        }
    }

    /// Capture from the default input device.
    pub fn with_default_device(block_size: usize) -> Self {
        Self::new(Box::new(CpalCaptureDevice::default()), block_size)
    }

    /// Start producing blocks into `sender`.
    pub fn start(&mut self, sender: AudioSender) -> Result<(), CaptureError> {
        if self.active.is_some() {
            return Err(CaptureError::AlreadyRecording);
        }

        let gate = Arc::new(AtomicBool::new(true));
        let callback_gate = gate.clone();
        let mut blocks: u64 = 0;

        let on_block: BlockCallback = Box::new(move |block| {
            if !callback_gate.load(Ordering::SeqCst) {
                return;
            }
            blocks += 1;
            match sender.offer(&block) {
                SendOutcome::Queued => {}
                SendOutcome::LinkDown => {
                    log::trace!("Capture: link down, dropped block {}", blocks)
                }
                SendOutcome::Backpressure => {
                    log::debug!("Capture: transport behind, dropped block {}", blocks)
                }
            }
            if blocks % 50 == 0 {
                log::debug!("Capture: produced {} blocks", blocks);
            }
        });

        let guard = self.device.open(self.block_size, on_block)?;
        self.active = Some(ActiveCapture { gate, guard });

        log::info!("Capture started ({} samples per block)", self.block_size);
        Ok(())
    }

    /// Stop capture and release the device.
    ///
    /// Idempotent. Returns whether capture was running.
    pub fn stop(&mut self) -> bool {
        match self.active.take() {
            Some(active) => {
                // Close the gate first so an in-flight callback sends nothing
                active.gate.store(false, Ordering::SeqCst);
                active.guard.stop();
                log::info!("Capture stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// CPAL-backed default input device.
#[derive(Debug, Default)]
pub struct CpalCaptureDevice;

impl CaptureDevice for CpalCaptureDevice {
    fn open(
        &mut self,
        block_size: usize,
        on_block: BlockCallback,
    ) -> Result<StreamGuard, DeviceError> {
        spawn_stream_thread("voicelink-capture", move || build_input(block_size, on_block))
    }
}

fn build_input(block_size: usize, on_block: BlockCallback) -> Result<Stream, DeviceError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(DeviceError::NoDevice)?;

    log::info!("Using audio input device: {:?}", device.name());

    let ranges: Vec<_> = device
        .supported_input_configs()
        .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))?
        .collect();
    let candidates: Vec<ConfigCandidate> = ranges.iter().map(ConfigCandidate::from).collect();
    let (index, rate) = pick_config(&candidates).ok_or(DeviceError::NoSupportedConfig)?;

    let supported = ranges[index].clone().with_sample_rate(cpal::SampleRate(rate));
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();

    log::info!(
        "Capture config: {} Hz, {} channels, {:?}",
        rate,
        config.channels,
        sample_format
    );

    let assembler = BlockAssembler::new(rate, config.channels, block_size)?;

    let stream = match sample_format {
        SampleFormat::I16 => build_input_typed::<i16>(&device, &config, assembler, on_block),
        SampleFormat::U16 => build_input_typed::<u16>(&device, &config, assembler, on_block),
        SampleFormat::F32 => build_input_typed::<f32>(&device, &config, assembler, on_block),
        _ => Err(DeviceError::NoSupportedConfig),
    }?;

    stream
        .play()
        .map_err(|e| DeviceError::StreamCreationFailed(format!("Failed to start stream: {}", e)))?;

    Ok(stream)
}

fn build_input_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut assembler: BlockAssembler,
    mut on_block: BlockCallback,
) -> Result<Stream, DeviceError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|&s| s.to_sample::<f32>()));
                assembler.push(&scratch, |block| on_block(block));
            },
            |err| log::error!("Audio input stream error: {}", err),
            None,
        )
        .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))
}
