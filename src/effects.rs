//! Effect runner for voicelink
//!
//! This module handles executing effects produced by the state machine.
//! Each effect runs as a task; completions are reported back to the event
//! loop as events.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::audio::CaptureStream;
use crate::client::ClientEvent;
use crate::control::{ControlClient, ControlRequestError};
use crate::settings::ClientSettings;
use crate::state_machine::{Effect, Event};
use crate::streaming::{ConnectOptions, TransportSession};

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::UnboundedSender<ClientEvent>) -> JoinHandle<()>;
}

fn send(tx: &mpsc::UnboundedSender<ClientEvent>, event: impl Into<ClientEvent>) {
    if tx.send(event.into()).is_err() {
        log::debug!("Effects: event loop gone, dropping completion");
    }
}

/// Effect runner backed by the real transport, capture device and control API
pub struct DeviceEffectRunner {
    capture: Arc<Mutex<CaptureStream>>,
    transport: Arc<Mutex<Option<TransportSession>>>,
    control: ControlClient,
    server_url: String,
    connect_options: ConnectOptions,
}

impl DeviceEffectRunner {
    pub fn new(
        capture: CaptureStream,
        settings: &ClientSettings,
    ) -> Result<Arc<Self>, ControlRequestError> {
        Ok(Arc::new(Self {
            capture: Arc::new(Mutex::new(capture)),
            transport: Arc::new(Mutex::new(None)),
            control: ControlClient::new(&settings.control_url)?,
            server_url: settings.server_url.clone(),
            connect_options: settings.connect_options(),
        }))
    }
}

impl EffectRunner for DeviceEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::UnboundedSender<ClientEvent>) -> JoinHandle<()> {
        match effect {
            Effect::Connect => {
                let transport = self.transport.clone();
                let url = self.server_url.clone();
                let options = self.connect_options.clone();

                tokio::spawn(async move {
                    // Exactly one live transport: close any previous one first
                    let previous = transport.lock().await.take();
                    if let Some(old) = previous {
                        old.close().await;
                    }

                    match TransportSession::connect(&url, &options, tx.clone()).await {
                        Ok(session) => {
                            log::info!("Effects: connected to {}", url);
                            *transport.lock().await = Some(session);
                        }
                        Err(e) => {
                            log::warn!("Effects: connection to {} failed: {}", url, e);
                            send(&tx, Event::TransportFailed { err: e.to_string() });
                        }
                    }
                })
            }

            Effect::Disconnect => {
                let transport = self.transport.clone();

                tokio::spawn(async move {
                    let current = transport.lock().await.take();
                    match current {
                        Some(session) => session.close().await,
                        None => log::debug!("Effects: disconnect with no transport"),
                    }
                })
            }

            Effect::StartCapture { connection } => {
                let transport = self.transport.clone();
                let capture = self.capture.clone();

                tokio::spawn(async move {
                    let sender = {
                        let guard = transport.lock().await;
                        guard
                            .as_ref()
                            .filter(|t| t.id() == connection)
                            .map(|t| t.sender())
                    };

                    let event = match sender {
                        Some(sender) => {
                            let result = capture.lock().await.start(sender);
                            match result {
                                Ok(()) => Event::CaptureStarted { connection },
                                Err(e) => {
                                    log::warn!("Effects: capture failed to start: {}", e);
                                    Event::CaptureFailed {
                                        connection,
                                        err: e.to_string(),
                                    }
                                }
                            }
                        }
                        None => Event::CaptureFailed {
                            connection,
                            err: "Not connected".to_string(),
                        },
                    };
                    send(&tx, event);
                })
            }

            Effect::StopCapture => {
                let transport = self.transport.clone();
                let capture = self.capture.clone();

                tokio::spawn(async move {
                    let was_running = capture.lock().await.stop();
                    if !was_running {
                        return;
                    }

                    let counts = transport
                        .lock()
                        .await
                        .as_ref()
                        .map(|t| (t.id(), t.sender().counts()));
                    if let Some((connection, (sent, dropped))) = counts {
                        send(
                            &tx,
                            ClientEvent::SendCounts {
                                connection,
                                sent,
                                dropped,
                            },
                        );
                    }
                })
            }

            Effect::RequestForceStop { session_id } => {
                let control = self.control.clone();

                tokio::spawn(async move {
                    let result = control
                        .force_stop(&session_id)
                        .await
                        .map_err(|e| e.to_string());
                    send(&tx, Event::ForceStopFinished { session_id, result });
                })
            }

            Effect::EmitStatus => {
                // Handled by the event loop
                log::debug!("Effects: ignoring EmitStatus");
                tokio::spawn(async {})
            }
        }
    }
}
