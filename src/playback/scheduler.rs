//! Playback scheduler
//!
//! Stitches decoded chunks into continuous output. Buffers are played in
//! arrival order, exactly one at a time; the next buffer is submitted only
//! when the output reports the previous one complete.
//!
//! ```text
//!            enqueue (Idle)            buffer_completed, queue non-empty
//!   Idle ─────────────────────▶ Playing ◀──────────────────────────┐
//!    ▲                            │ └────────────────────────────────┘
//!    └────────────────────────────┘
//!      buffer_completed, queue empty
//! ```

use std::collections::VecDeque;

use crate::audio::OutputSink;
use crate::streaming::{SampleFrame, WIRE_SAMPLE_RATE};

/// Whether a buffer is currently submitted to the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
}

/// What a scheduler call did to the playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackTransition {
    /// Went from Idle to Playing
    Started,
    /// Queue drained; now Idle
    Quiescent,
    /// No change in playback state
    Unchanged,
}

/// Counters for the playback path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub enqueued: u64,
    pub played: u64,
    pub dropped_overflow: u64,
    pub submit_failures: u64,
    pub queued_samples: usize,
}

/// FIFO jitter buffer in front of an `OutputSink`
pub struct PlaybackScheduler<S: OutputSink> {
    sink: S,
    queue: VecDeque<SampleFrame>,
    queued_samples: usize,
    /// Ticket of the buffer currently at the sink
    in_flight: Option<u64>,
    next_ticket: u64,
    /// Upper bound on queued (not yet submitted) samples; 0 disables
    max_queued_samples: usize,
    stats: PlaybackStats,
}

impl<S: OutputSink> PlaybackScheduler<S> {
    /// Create a scheduler holding at most `max_queued_ms` of queued audio
    /// (0 for unbounded)
    pub fn new(sink: S, max_queued_ms: u64) -> Self {
        let max_queued_samples =
            usize::try_from(max_queued_ms.saturating_mul(WIRE_SAMPLE_RATE as u64) / 1000)
                .unwrap_or(usize::MAX);
        Self {
            sink,
            queue: VecDeque::new(),
            queued_samples: 0,
            in_flight: None,
            next_ticket: 1,
            max_queued_samples,
            stats: PlaybackStats::default(),
        }
    }

    pub fn state(&self) -> PlaybackState {
        if self.in_flight.is_some() {
            PlaybackState::Playing
        } else {
            PlaybackState::Idle
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> PlaybackStats {
        PlaybackStats {
            queued_samples: self.queued_samples,
            ..self.stats
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Append a decoded buffer; starts playback when idle
    pub fn enqueue(&mut self, buffer: SampleFrame) -> PlaybackTransition {
        if buffer.is_empty() {
            log::debug!("Playback: ignoring empty buffer");
            return PlaybackTransition::Unchanged;
        }

        self.stats.enqueued += 1;
        self.queued_samples += buffer.len();
        self.queue.push_back(buffer);
        self.enforce_bound();

        if self.in_flight.is_none() {
            self.play_next()
        } else {
            PlaybackTransition::Unchanged
        }
    }

    /// Submit the head of the queue, or go idle if there is none.
    ///
    /// A buffer the sink refuses is dropped and the next one is tried.
    pub fn play_next(&mut self) -> PlaybackTransition {
        if self.in_flight.is_some() {
            return PlaybackTransition::Unchanged;
        }

        while let Some(buffer) = self.queue.pop_front() {
            self.queued_samples -= buffer.len();
            let ticket = self.next_ticket;
            self.next_ticket += 1;

            let len = buffer.len();
            match self.sink.submit(ticket, buffer) {
                Ok(()) => {
                    log::trace!("Playback: submitted buffer {} ({} samples)", ticket, len);
                    self.in_flight = Some(ticket);
                    return PlaybackTransition::Started;
                }
                Err(e) => {
                    self.stats.submit_failures += 1;
                    log::warn!("Playback: output rejected buffer {}: {}", ticket, e);
                }
            }
        }

        PlaybackTransition::Quiescent
    }

    /// Completion event from the output.
    ///
    /// Stale or unexpected tickets are ignored.
    pub fn buffer_completed(&mut self, ticket: u64) -> PlaybackTransition {
        if self.in_flight != Some(ticket) {
            log::debug!(
                "Playback: ignoring completion for ticket {} (in flight: {:?})",
                ticket,
                self.in_flight
            );
            return PlaybackTransition::Unchanged;
        }

        self.in_flight = None;
        self.stats.played += 1;

        match self.play_next() {
            // Still playing, just a different buffer
            PlaybackTransition::Started => PlaybackTransition::Unchanged,
            other => other,
        }
    }

    /// Discard queued buffers; the in-flight buffer finishes normally
    pub fn clear(&mut self) -> usize {
        let discarded = self.queue.len();
        self.queue.clear();
        self.queued_samples = 0;
        if discarded > 0 {
            log::info!("Playback: cleared {} queued buffers", discarded);
        }
        discarded
    }

    /// Drop oldest queued buffers until queued audio fits the bound.
    /// The newest buffer is always kept.
    fn enforce_bound(&mut self) {
        if self.max_queued_samples == 0 {
            return;
        }

        while self.queued_samples > self.max_queued_samples && self.queue.len() > 1 {
            if let Some(dropped) = self.queue.pop_front() {
                self.queued_samples -= dropped.len();
                self.stats.dropped_overflow += 1;
                log::warn!(
                    "Playback: queue over {} samples, dropped oldest buffer ({} samples)",
                    self.max_queued_samples,
                    dropped.len()
                );
            }
        }
    }
}
