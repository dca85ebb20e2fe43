//! Metrics collection for voicelink
//!
//! Tracks per-session pipeline counters and error history.
//! Used for diagnostics (`metrics` command) and the shutdown summary.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;

use crate::playback::PlaybackStats;
use crate::streaming::ConnectionId;

/// Maximum number of completed sessions to retain in history
const MAX_SESSION_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Metrics for a finished session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    /// Remote session id, if the server assigned one
    pub session_id: Option<String>,
    /// Local connection the session ran on
    pub connection_id: String,
    /// Unix timestamp when the connection opened (seconds)
    pub started_at: i64,
    /// Time from open to end in milliseconds
    pub duration_ms: u64,
    /// Capture blocks handed to the writer
    pub frames_sent: u64,
    /// Capture blocks dropped (link down or writer behind)
    pub frames_dropped: u64,
    /// Audio chunks received and enqueued
    pub chunks_received: u64,
    /// Samples received (16kHz)
    pub samples_received: u64,
    /// Buffers the output finished playing
    pub buffers_played: u64,
    /// Buffers dropped by the queue bound
    pub buffers_dropped: u64,
    /// Buffers the output device refused
    pub submit_failures: u64,
    /// How the session ended
    pub end_reason: String,
}

impl SessionMetrics {
    /// Playback counters relative to the scheduler totals at connection open
    fn set_playback(&mut self, base: PlaybackStats, now: PlaybackStats) {
        self.buffers_played = now.played.saturating_sub(base.played);
        self.buffers_dropped = now.dropped_overflow.saturating_sub(base.dropped_overflow);
        self.submit_failures = now.submit_failures.saturating_sub(base.submit_failures);
    }
}

/// Summary statistics across all recorded sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_sessions: u64,
    pub total_chunks_received: u64,
    pub total_frames_sent: u64,
    pub total_frames_dropped: u64,
    /// Average session length (ms) across recorded sessions
    pub avg_session_duration_ms: u64,
    /// Most recent error, if any
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp when error occurred (seconds)
    pub timestamp: i64,
    /// Category of error (e.g., "transport", "capture", "control")
    pub error_type: String,
    /// Human-readable error message
    pub message: String,
    /// Associated session ID, if applicable
    pub session_id: Option<String>,
}

/// Internal state for the session on the current connection
struct SessionInProgress {
    connection: ConnectionId,
    session_id: Option<String>,
    started_at: Instant,
    started_at_unix: i64,
    frames_sent: u64,
    frames_dropped: u64,
    chunks_received: u64,
    samples_received: u64,
    playback_at_start: PlaybackStats,
}

impl SessionInProgress {
    fn new(connection: ConnectionId, playback: PlaybackStats) -> Self {
        Self {
            connection,
            session_id: None,
            started_at: Instant::now(),
            started_at_unix: chrono::Utc::now().timestamp(),
            frames_sent: 0,
            frames_dropped: 0,
            chunks_received: 0,
            samples_received: 0,
            playback_at_start: playback,
        }
    }

    fn to_metrics(&self, playback: PlaybackStats, end_reason: &str) -> SessionMetrics {
        let mut metrics = SessionMetrics {
            session_id: self.session_id.clone(),
            connection_id: self.connection.to_string(),
            started_at: self.started_at_unix,
            duration_ms: self.started_at.elapsed().as_millis() as u64,
            frames_sent: self.frames_sent,
            frames_dropped: self.frames_dropped,
            chunks_received: self.chunks_received,
            samples_received: self.samples_received,
            buffers_played: 0,
            buffers_dropped: 0,
            submit_failures: 0,
            end_reason: end_reason.to_string(),
        };
        metrics.set_playback(self.playback_at_start, playback);
        metrics
    }
}

/// Collects and stores metrics for streaming sessions
pub struct MetricsCollector {
    /// History of finished sessions (newest first)
    history: VecDeque<SessionMetrics>,
    /// History of errors (newest first)
    errors: VecDeque<ErrorRecord>,
    /// Session on the current connection, if any
    current: Option<SessionInProgress>,
    /// Connection and playback baseline of the newest finished record.
    /// Capture counters and draining buffers still land there.
    last_finished: Option<(ConnectionId, PlaybackStats)>,
}

impl MetricsCollector {
    /// Create a new empty metrics collector
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_SESSION_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current: None,
            last_finished: None,
        }
    }

    /// Start tracking a new connection.
    ///
    /// `playback` is the scheduler's running total; per-session counts are
    /// taken relative to it.
    pub fn connection_opened(&mut self, connection: ConnectionId, playback: PlaybackStats) {
        if let Some(old) = self.current.take() {
            log::warn!(
                "Metrics: discarding open record for connection {} (new connection {})",
                old.connection,
                connection
            );
            self.add_to_history(old.to_metrics(playback, "superseded"));
        }

        log::debug!("Metrics: tracking connection {}", connection);
        self.current = Some(SessionInProgress::new(connection, playback));
    }

    pub fn session_assigned(&mut self, session_id: &str) {
        if let Some(ref mut current) = self.current {
            current.session_id = Some(session_id.to_string());
        }
    }

    pub fn chunk_received(&mut self, samples: usize) {
        if let Some(ref mut current) = self.current {
            current.chunks_received += 1;
            current.samples_received += samples as u64;
        }
    }

    /// Latest outbound counters for `connection` (cumulative per connection).
    ///
    /// Capture is released after the session ends, so the counts for a
    /// finished record usually arrive late and are applied to it then.
    pub fn send_counts(&mut self, connection: ConnectionId, sent: u64, dropped: u64) {
        if let Some(ref mut current) = self.current {
            if current.connection == connection {
                current.frames_sent = sent;
                current.frames_dropped = dropped;
                return;
            }
        }
        if let Some(entry) = self.finished_entry(connection) {
            entry.frames_sent = sent;
            entry.frames_dropped = dropped;
        }
    }

    /// Playback totals after a buffer completed.
    ///
    /// Only matters between records: buffers still draining after a session
    /// ended are credited to that session.
    pub fn playback_progress(&mut self, playback: PlaybackStats) {
        if self.current.is_some() {
            return;
        }
        if let Some((connection, base)) = self.last_finished {
            if let Some(entry) = self.finished_entry(connection) {
                entry.set_playback(base, playback);
            }
        }
    }

    fn finished_entry(&mut self, connection: ConnectionId) -> Option<&mut SessionMetrics> {
        match self.last_finished {
            Some((finished, _)) if finished == connection => {}
            _ => return None,
        }
        let id = connection.to_string();
        self.history.front_mut().filter(|entry| entry.connection_id == id)
    }

    /// Close out the current record
    pub fn session_finished(&mut self, playback: PlaybackStats, end_reason: &str) {
        if let Some(current) = self.current.take() {
            let metrics = current.to_metrics(playback, end_reason);
            log::info!(
                "Metrics: session {:?} finished after {}ms - sent {} (dropped {}), received {} chunks, played {}",
                metrics.session_id,
                metrics.duration_ms,
                metrics.frames_sent,
                metrics.frames_dropped,
                metrics.chunks_received,
                metrics.buffers_played
            );
            self.add_to_history(metrics);
            self.last_finished = Some((current.connection, current.playback_at_start));
        }
    }

    /// Record an error (not necessarily tied to a session)
    pub fn record_error(&mut self, error_type: &str, message: String) {
        let error = ErrorRecord {
            timestamp: chrono::Utc::now().timestamp(),
            error_type: error_type.to_string(),
            message,
            session_id: self.current.as_ref().and_then(|c| c.session_id.clone()),
        };

        log::debug!("Metrics: recording error - {:?}", error);

        // Add to front (newest first)
        self.errors.push_front(error);

        // Trim if over limit
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    /// Get summary statistics
    pub fn get_summary(&self) -> MetricsSummary {
        let count = self.history.len() as u64;
        let avg_duration = if count > 0 {
            self.history.iter().map(|s| s.duration_ms).sum::<u64>() / count
        } else {
            0
        };

        MetricsSummary {
            total_sessions: count,
            total_chunks_received: self.history.iter().map(|s| s.chunks_received).sum(),
            total_frames_sent: self.history.iter().map(|s| s.frames_sent).sum(),
            total_frames_dropped: self.history.iter().map(|s| s.frames_dropped).sum(),
            avg_session_duration_ms: avg_duration,
            last_error: self.errors.front().cloned(),
        }
    }

    /// Get the session history (newest first)
    pub fn get_history(&self) -> Vec<SessionMetrics> {
        self.history.iter().cloned().collect()
    }

    /// Get the error history (newest first)
    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    fn add_to_history(&mut self, metrics: SessionMetrics) {
        self.history.push_front(metrics);
        while self.history.len() > MAX_SESSION_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
