//! Playback of synthesized audio
//!
//! The scheduler owns the jitter queue; the output device lives behind the
//! `OutputSink` trait so the scheduler can be driven without a sound card.

mod scheduler;

pub use scheduler::{PlaybackScheduler, PlaybackState, PlaybackStats, PlaybackTransition};
