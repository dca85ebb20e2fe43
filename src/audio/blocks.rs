//! Capture block assembly
//!
//! Turns whatever the input device delivers (any channel count, any integer
//! multiple of 16kHz, any callback size) into fixed-size 16kHz mono blocks.

use crate::streaming::{SampleFrame, WIRE_SAMPLE_RATE};

use super::DeviceError;

/// Accumulates device callbacks and emits fixed-size wire blocks
#[derive(Debug)]
pub struct BlockAssembler {
    channels: usize,
    ratio: usize,
    block_size: usize,
    /// Mono samples at device rate not yet forming a full decimation group
    carry: Vec<f32>,
    /// Samples at wire rate waiting to fill the next block
    pending: Vec<f32>,
}

impl BlockAssembler {
    /// Create an assembler for a device running at `source_rate` with `channels`
    pub fn new(source_rate: u32, channels: u16, block_size: usize) -> Result<Self, DeviceError> {
        if channels == 0 || block_size == 0 {
            return Err(DeviceError::NoSupportedConfig);
        }
        if source_rate < WIRE_SAMPLE_RATE || source_rate % WIRE_SAMPLE_RATE != 0 {
            return Err(DeviceError::NoSupportedConfig);
        }

        Ok(Self {
            channels: channels as usize,
            ratio: (source_rate / WIRE_SAMPLE_RATE) as usize,
            block_size,
            carry: Vec::new(),
            pending: Vec::with_capacity(block_size * 2),
        })
    }

    /// Feed one interleaved device buffer; `emit` is called once per full block
    pub fn push(&mut self, interleaved: &[f32], mut emit: impl FnMut(SampleFrame)) {
        self.carry.extend(downmix(interleaved, self.channels));

        let usable = self.carry.len() - self.carry.len() % self.ratio;
        if usable > 0 {
            let grouped: Vec<f32> = self.carry.drain(..usable).collect();
            self.pending.extend(decimate(&grouped, self.ratio));
        }

        while self.pending.len() >= self.block_size {
            let block: SampleFrame = self.pending.drain(..self.block_size).collect();
            emit(block);
        }
    }

    /// Samples buffered toward the next block (at wire rate)
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Average interleaved frames down to mono
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Average each group of `ratio` samples (e.g. 48kHz → 16kHz with ratio 3)
fn decimate(samples: &[f32], ratio: usize) -> Vec<f32> {
    if ratio <= 1 {
        return samples.to_vec();
    }

    samples
        .chunks(ratio)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect()
}
