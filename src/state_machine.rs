//! Session lifecycle state machine for voicelink
//!
//! This module implements the core state machine using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects to execute.

use crate::playback::PlaybackState;
use crate::streaming::ConnectionId;

/// Streaming channel as seen by the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStatus {
    #[default]
    Disconnected,
    Connecting,
    Open { connection: ConnectionId },
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Server sent `session_end`
    Remote,
    /// User forced the stop
    ForceStopped,
    /// Channel closed under the session
    TransportClosed,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Remote => "ended by server",
            EndReason::ForceStopped => "force stopped",
            EndReason::TransportClosed => "connection closed",
        }
    }
}

/// Remote session identity and status
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    NoSession,
    Active {
        session_id: String,
    },
    Ended {
        session_id: Option<String>,
        reason: EndReason,
    },
}

impl SessionState {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SessionState::NoSession => None,
            SessionState::Active { session_id } => Some(session_id),
            SessionState::Ended { session_id, .. } => session_id.as_deref(),
        }
    }
}

/// Microphone capture as authorized by the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureStatus {
    #[default]
    Stopped,
    /// StartCapture issued, waiting for the device
    Starting,
    Running,
}

/// Authoritative client state. All transitions go through the reducer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClientState {
    pub link: LinkStatus,
    pub session: SessionState,
    pub capture: CaptureStatus,
    pub playback: PlaybackState,
    pub last_error: Option<String>,
    /// Informational message for the user (force-stop reply, refused command)
    pub notice: Option<String>,
}

impl ClientState {
    fn connection(&self) -> Option<ConnectionId> {
        match self.link {
            LinkStatus::Open { connection } => Some(connection),
            _ => None,
        }
    }

    fn is_current(&self, connection: ConnectionId) -> bool {
        self.connection() == Some(connection)
    }
}

/// Events that can trigger state transitions.
/// These come from user commands, the transport, the devices and the effect runner.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // User commands
    ConnectRequested,
    StartCaptureRequested,
    StopCaptureRequested,
    ForceStopRequested,
    ShutdownRequested,

    // Transport events
    TransportOpened {
        connection: ConnectionId,
    },
    TransportFailed {
        err: String,
    },
    TransportClosed {
        connection: ConnectionId,
        reason: String,
    },
    SessionAssigned {
        connection: ConnectionId,
        session_id: String,
    },
    SessionEnded {
        connection: ConnectionId,
    },

    // Effect completions
    CaptureStarted {
        connection: ConnectionId,
    },
    CaptureFailed {
        connection: ConnectionId,
        err: String,
    },
    ForceStopFinished {
        session_id: String,
        result: Result<String, String>,
    },

    // Playback scheduler transitions
    PlaybackStarted,
    PlaybackQuiescent,
}

/// Effects to be executed after a state transition.
/// The effect runner handles these asynchronously.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Connect,
    /// Close the current transport
    Disconnect,
    StartCapture {
        connection: ConnectionId,
    },
    /// Idempotent
    StopCapture,
    RequestForceStop {
        session_id: String,
    },
    /// Signal to print the status line
    EmitStatus,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events from connections other than the current one
/// - Always emit EmitStatus after visible changes
pub fn reduce(state: &ClientState, event: Event) -> (ClientState, Vec<Effect>) {
    use Effect::*;
    use Event::*;

    let mut next = state.clone();

    match event {
        // -----------------
        // Connection
        // -----------------
        ConnectRequested => match state.link {
            LinkStatus::Disconnected => {
                next.link = LinkStatus::Connecting;
                next.last_error = None;
                next.notice = None;
                (next, vec![Connect, EmitStatus])
            }
            _ => {
                next.notice = Some("Already connected".to_string());
                (next, vec![EmitStatus])
            }
        },
        TransportOpened { connection } => match state.link {
            LinkStatus::Connecting => {
                next.link = LinkStatus::Open { connection };
                next.session = SessionState::NoSession;
                next.capture = CaptureStatus::Stopped;
                next.last_error = None;
                (next, vec![EmitStatus])
            }
            // Opened after the user gave up on it
            _ => {
                log::info!(
                    "Lifecycle: connection {} opened while not connecting, closing it",
                    connection
                );
                (state.clone(), vec![Disconnect])
            }
        },
        TransportFailed { err } => match state.link {
            LinkStatus::Connecting => {
                next.link = LinkStatus::Disconnected;
                next.last_error = Some(err);
                (next, vec![EmitStatus])
            }
            _ => (state.clone(), vec![]),
        },
        TransportClosed { connection, reason } if state.is_current(connection) => {
            next.link = LinkStatus::Disconnected;
            next.capture = CaptureStatus::Stopped;
            if let SessionState::Active { session_id } = &state.session {
                next.session = SessionState::Ended {
                    session_id: Some(session_id.clone()),
                    reason: EndReason::TransportClosed,
                };
            }
            next.last_error = Some(format!("Connection closed: {}", reason));
            (next, vec![StopCapture, EmitStatus])
        }
        TransportClosed { connection, .. } => {
            log::debug!("Lifecycle: ignoring close of stale connection {}", connection);
            (state.clone(), vec![])
        }

        // -----------------
        // Session
        // -----------------
        SessionAssigned {
            connection,
            session_id,
        } if state.is_current(connection) => match &state.session {
            SessionState::NoSession => {
                log::info!("Lifecycle: session {} active", session_id);
                next.session = SessionState::Active { session_id };
                (next, vec![EmitStatus])
            }
            SessionState::Active { session_id: current } => {
                log::warn!(
                    "Lifecycle: ignoring session id {} (session {} already active)",
                    session_id,
                    current
                );
                (state.clone(), vec![])
            }
            SessionState::Ended { .. } => {
                log::warn!(
                    "Lifecycle: ignoring session id {} after session end",
                    session_id
                );
                (state.clone(), vec![])
            }
        },
        SessionEnded { connection } if state.is_current(connection) => {
            if !matches!(state.session, SessionState::Ended { .. }) {
                next.session = SessionState::Ended {
                    session_id: state.session.session_id().map(str::to_string),
                    reason: EndReason::Remote,
                };
            }
            next.capture = CaptureStatus::Stopped;
            // Playback drains on its own
            (next, vec![StopCapture, EmitStatus])
        }
        SessionAssigned { connection, .. } | SessionEnded { connection } => {
            log::debug!(
                "Lifecycle: ignoring session message from stale connection {}",
                connection
            );
            (state.clone(), vec![])
        }
        ForceStopRequested => match &state.session {
            SessionState::Active { session_id } => {
                next.session = SessionState::Ended {
                    session_id: Some(session_id.clone()),
                    reason: EndReason::ForceStopped,
                };
                next.capture = CaptureStatus::Stopped;
                next.notice = Some(format!("Ending session {}...", session_id));
                (
                    next,
                    vec![
                        RequestForceStop {
                            session_id: session_id.clone(),
                        },
                        StopCapture,
                        EmitStatus,
                    ],
                )
            }
            _ => {
                next.notice = Some("No active session to end".to_string());
                (next, vec![EmitStatus])
            }
        },
        ForceStopFinished { session_id, result } => {
            match result {
                Ok(status) => {
                    log::info!("Lifecycle: force stop of {}: {}", session_id, status);
                    next.notice = Some(status);
                }
                Err(err) => {
                    log::warn!("Lifecycle: force stop of {} failed: {}", session_id, err);
                    next.last_error = Some(format!("Failed to end session: {}", err));
                }
            }
            (next, vec![EmitStatus])
        }

        // -----------------
        // Capture
        // -----------------
        StartCaptureRequested => {
            let refusal = match (&state.link, &state.session, state.capture) {
                (LinkStatus::Open { .. }, SessionState::Ended { .. }, _) => {
                    Some("Session has ended; reconnect to start a new one")
                }
                (LinkStatus::Open { .. }, _, CaptureStatus::Stopped) => None,
                (LinkStatus::Open { .. }, _, _) => Some("Already listening"),
                _ => Some("Not connected"),
            };

            match (refusal, state.connection()) {
                (None, Some(connection)) => {
                    next.capture = CaptureStatus::Starting;
                    next.notice = None;
                    (next, vec![StartCapture { connection }, EmitStatus])
                }
                (refusal, _) => {
                    next.notice = Some(refusal.unwrap_or("Not connected").to_string());
                    (next, vec![EmitStatus])
                }
            }
        }
        StopCaptureRequested => match state.capture {
            CaptureStatus::Stopped => (state.clone(), vec![]),
            _ => {
                next.capture = CaptureStatus::Stopped;
                (next, vec![StopCapture, EmitStatus])
            }
        },
        CaptureStarted { connection }
            if state.is_current(connection) && state.capture == CaptureStatus::Starting =>
        {
            next.capture = CaptureStatus::Running;
            (next, vec![EmitStatus])
        }
        // Started after stop, session end or reconnect: release it again
        CaptureStarted { .. } => (state.clone(), vec![StopCapture]),
        CaptureFailed { connection, err }
            if state.is_current(connection) && state.capture == CaptureStatus::Starting =>
        {
            next.capture = CaptureStatus::Stopped;
            next.last_error = Some(err);
            (next, vec![EmitStatus])
        }
        CaptureFailed { err, .. } => {
            log::debug!("Lifecycle: ignoring stale capture failure: {}", err);
            (state.clone(), vec![])
        }

        // -----------------
        // Playback
        // -----------------
        PlaybackStarted if state.playback != PlaybackState::Playing => {
            next.playback = PlaybackState::Playing;
            (next, vec![EmitStatus])
        }
        PlaybackQuiescent if state.playback != PlaybackState::Idle => {
            next.playback = PlaybackState::Idle;
            (next, vec![EmitStatus])
        }
        PlaybackStarted | PlaybackQuiescent => (state.clone(), vec![]),

        // -----------------
        // Shutdown
        // -----------------
        ShutdownRequested => {
            next.link = LinkStatus::Disconnected;
            next.capture = CaptureStatus::Stopped;
            (next, vec![StopCapture, Disconnect])
        }
    }
}

/// User-visible status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connecting,
    Idle,
    Listening,
    Responding,
    SessionEnded,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Disconnected => "disconnected",
            Status::Connecting => "connecting",
            Status::Idle => "idle",
            Status::Listening => "listening",
            Status::Responding => "responding",
            Status::SessionEnded => "session ended",
        }
    }
}

/// Snapshot of the state for the status line
#[derive(Debug, Clone, PartialEq)]
pub struct StatusView {
    pub status: Status,
    pub session_id: Option<String>,
    pub end_reason: Option<EndReason>,
    pub last_error: Option<String>,
    pub notice: Option<String>,
}

impl StatusView {
    pub fn from_state(state: &ClientState) -> Self {
        let status = match (&state.link, &state.session) {
            (LinkStatus::Disconnected, _) => Status::Disconnected,
            (LinkStatus::Connecting, _) => Status::Connecting,
            (LinkStatus::Open { .. }, SessionState::Ended { .. }) => Status::SessionEnded,
            _ if state.playback == PlaybackState::Playing => Status::Responding,
            _ if state.capture != CaptureStatus::Stopped => Status::Listening,
            _ => Status::Idle,
        };

        Self {
            status,
            session_id: state.session.session_id().map(str::to_string),
            end_reason: match state.session {
                SessionState::Ended { reason, .. } => Some(reason),
                _ => None,
            },
            last_error: state.last_error.clone(),
            notice: state.notice.clone(),
        }
    }
}

impl std::fmt::Display for StatusView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "status: {}", self.status.as_str())?;
        if let Some(id) = &self.session_id {
            write!(f, " | session: {}", id)?;
        }
        if let Some(reason) = self.end_reason {
            write!(f, " ({})", reason.as_str())?;
        }
        if let Some(notice) = &self.notice {
            write!(f, " | {}", notice)?;
        }
        if let Some(err) = &self.last_error {
            write!(f, " | error: {}", err)?;
        }
        Ok(())
    }
}
