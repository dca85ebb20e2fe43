//! Single owner of the client's mutable state
//!
//! Every event (user command, transport message, device completion, effect
//! result) is handled here, one at a time, by the event loop. The lifecycle
//! reducer decides what happens; the playback scheduler is driven directly.

use crate::audio::OutputSink;
use crate::metrics::MetricsCollector;
use crate::playback::{PlaybackScheduler, PlaybackTransition};
use crate::state_machine::{
    reduce, ClientState, Effect, Event, LinkStatus, SessionState, StatusView,
};
use crate::streaming::{ConnectionId, TransportEvent};

/// Everything the event loop can receive
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Lifecycle event (user commands, effect completions)
    Lifecycle(Event),
    /// Message from the streaming transport
    Transport(TransportEvent),
    /// Output device finished the buffer with this ticket
    BufferCompleted { ticket: u64 },
    /// Cumulative outbound frame counters for a connection
    SendCounts {
        connection: ConnectionId,
        sent: u64,
        dropped: u64,
    },
}

impl From<TransportEvent> for ClientEvent {
    fn from(event: TransportEvent) -> Self {
        ClientEvent::Transport(event)
    }
}

impl From<Event> for ClientEvent {
    fn from(event: Event) -> Self {
        ClientEvent::Lifecycle(event)
    }
}

/// Lifecycle state, playback scheduler and metrics behind one handler
pub struct VoiceClient<S: OutputSink> {
    state: ClientState,
    scheduler: PlaybackScheduler<S>,
    metrics: MetricsCollector,
}

impl<S: OutputSink> VoiceClient<S> {
    pub fn new(sink: S, max_queued_ms: u64) -> Self {
        Self {
            state: ClientState::default(),
            scheduler: PlaybackScheduler::new(sink, max_queued_ms),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn scheduler(&self) -> &PlaybackScheduler<S> {
        &self.scheduler
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn status(&self) -> StatusView {
        StatusView::from_state(&self.state)
    }

    /// Handle one event; returns the effects to run
    pub fn handle(&mut self, event: ClientEvent) -> Vec<Effect> {
        match event {
            ClientEvent::Lifecycle(event) => self.apply(event),
            ClientEvent::Transport(event) => self.handle_transport(event),
            ClientEvent::BufferCompleted { ticket } => {
                let transition = self.scheduler.buffer_completed(ticket);
                self.metrics.playback_progress(self.scheduler.stats());
                self.playback_transition(transition)
            }
            ClientEvent::SendCounts {
                connection,
                sent,
                dropped,
            } => {
                self.metrics.send_counts(connection, sent, dropped);
                vec![]
            }
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) -> Vec<Effect> {
        match event {
            TransportEvent::Opened { connection } => {
                self.apply(Event::TransportOpened { connection })
            }
            TransportEvent::SessionAssigned {
                connection,
                session_id,
            } => self.apply(Event::SessionAssigned {
                connection,
                session_id,
            }),
            TransportEvent::SessionEnded { connection } => {
                self.apply(Event::SessionEnded { connection })
            }
            TransportEvent::Closed { connection, reason } => {
                self.apply(Event::TransportClosed { connection, reason })
            }
            TransportEvent::Audio {
                connection,
                samples,
            } => {
                if self.current_connection() != Some(connection) {
                    log::debug!(
                        "Client: dropping audio from stale connection {}",
                        connection
                    );
                    return vec![];
                }
                self.metrics.chunk_received(samples.len());
                let transition = self.scheduler.enqueue(samples);
                self.playback_transition(transition)
            }
        }
    }

    fn playback_transition(&mut self, transition: PlaybackTransition) -> Vec<Effect> {
        match transition {
            PlaybackTransition::Started => self.apply(Event::PlaybackStarted),
            PlaybackTransition::Quiescent => self.apply(Event::PlaybackQuiescent),
            PlaybackTransition::Unchanged => vec![],
        }
    }

    fn current_connection(&self) -> Option<ConnectionId> {
        match self.state.link {
            LinkStatus::Open { connection } => Some(connection),
            _ => None,
        }
    }

    /// Run the reducer and keep metrics and the scheduler in step with it
    fn apply(&mut self, event: Event) -> Vec<Effect> {
        log::debug!("Client: event {:?}", event);

        if matches!(event, Event::ShutdownRequested) {
            self.scheduler.clear();
        }

        let (next, effects) = reduce(&self.state, event);
        self.observe_transition(&next);

        if self.state.link != next.link || self.state.session != next.session {
            log::info!(
                "State transition: {:?}/{:?} -> {:?}/{:?}",
                self.state.link,
                self.state.session,
                next.link,
                next.session
            );
        }

        self.state = next;
        effects
    }

    fn observe_transition(&mut self, next: &ClientState) {
        let prev = &self.state;

        if let (LinkStatus::Open { connection }, false) =
            (next.link, matches!(prev.link, LinkStatus::Open { .. }))
        {
            self.metrics.connection_opened(connection, self.scheduler.stats());
        }

        if let (SessionState::Active { session_id }, SessionState::NoSession) =
            (&next.session, &prev.session)
        {
            self.metrics.session_assigned(session_id);
        }

        match (&prev.session, &next.session) {
            (SessionState::Ended { .. }, _) => {}
            (_, SessionState::Ended { reason, .. }) => {
                self.metrics.session_finished(self.scheduler.stats(), reason.as_str());
            }
            _ => {}
        }

        // Connection lost without a session end
        if matches!(prev.link, LinkStatus::Open { .. })
            && !matches!(next.link, LinkStatus::Open { .. })
            && !matches!(next.session, SessionState::Ended { .. })
        {
            self.metrics.session_finished(self.scheduler.stats(), "disconnected");
        }

        if next.last_error != prev.last_error {
            if let Some(err) = &next.last_error {
                self.metrics.record_error("client", err.clone());
            }
        }
    }
}
