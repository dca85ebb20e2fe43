//! voicelink: real-time bidirectional voice streaming client
//!
//! Microphone audio is streamed to a voice server over a WebSocket while
//! synthesized speech coming back is played without gaps. One event loop
//! owns all client state; devices, the transport and effect tasks talk to it
//! through channels.

pub mod audio;
pub mod client;
pub mod commands;
pub mod control;
pub mod effects;
pub mod metrics;
pub mod playback;
pub mod settings;
pub mod state_machine;
pub mod streaming;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use audio::{CaptureStream, CpalOutput, OutputSink};
use client::{ClientEvent, VoiceClient};
use commands::{spawn_stdin_reader, Command, HELP};
use effects::{DeviceEffectRunner, EffectRunner};
use metrics::MetricsCollector;
use settings::ClientSettings;
use state_machine::{Effect, Event};

/// How long shutdown waits for capture release and the close handshake
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Install the log subscriber (`RUST_LOG` overrides the default level).
///
/// `log` records are forwarded through the `tracing-log` bridge.
pub fn init_logging(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

/// Run the client against the default audio devices until `quit` or EOF.
pub async fn run(settings: ClientSettings) -> Result<(), String> {
    let (tx, rx) = mpsc::unbounded_channel::<ClientEvent>();

    let completion_tx = tx.clone();
    let output = CpalOutput::new(move |ticket| {
        let _ = completion_tx.send(ClientEvent::BufferCompleted { ticket });
    });
    let mut client = VoiceClient::new(output, settings.max_queued_ms);

    let capture = CaptureStream::with_default_device(settings.block_size);
    let runner = DeviceEffectRunner::new(capture, &settings)
        .map_err(|e| format!("Failed to set up control client: {}", e))?;

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
    let cancel = CancellationToken::new();
    spawn_stdin_reader(cmd_tx.clone(), cancel.clone())
        .map_err(|e| format!("Failed to start command reader: {}", e))?;

    log::info!(
        "voicelink: server {}, control {}",
        settings.server_url,
        settings.control_url
    );
    println!("{}", HELP);

    if settings.auto_connect {
        let _ = cmd_tx.send(Command::Connect);
    }
    // The reader holds the remaining sender; EOF on stdin ends the loop
    drop(cmd_tx);

    run_event_loop(&mut client, runner, tx, rx, cmd_rx, |line| println!("{}", line)).await;
    cancel.cancel();

    Ok(())
}

/// Main event loop.
///
/// Handles events one at a time: user commands from `commands`, everything
/// else from `events`. Status lines and command output go to `report`.
/// Returns after `quit` (or when `commands` closes) once shutdown effects
/// have finished or the grace period has passed.
pub async fn run_event_loop<S: OutputSink>(
    client: &mut VoiceClient<S>,
    runner: Arc<dyn EffectRunner>,
    tx: mpsc::UnboundedSender<ClientEvent>,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut report: impl FnMut(String),
) {
    report(client.status().to_string());
    log::info!("Event loop started");

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command.unwrap_or(Command::Quit) {
                    Command::Status => report(client.status().to_string()),
                    Command::Metrics => report(metrics_json(client.metrics())),
                    Command::Help => report(HELP.to_string()),
                    Command::Quit => {
                        log::info!("Quit requested, shutting down");
                        let effects = client.handle(Event::ShutdownRequested.into());
                        let pending = execute(client, effects, &runner, &tx, &mut report);
                        let finished = tokio::time::timeout(
                            SHUTDOWN_GRACE,
                            futures_util::future::join_all(pending),
                        )
                        .await;
                        if finished.is_err() {
                            log::warn!("Shutdown effects did not finish in {:?}", SHUTDOWN_GRACE);
                        }
                        break;
                    }
                    other => {
                        if let Some(event) = other.to_event() {
                            let effects = client.handle(event.into());
                            execute(client, effects, &runner, &tx, &mut report);
                        }
                    }
                }
            }
            Some(event) = events.recv() => {
                let effects = client.handle(event);
                execute(client, effects, &runner, &tx, &mut report);
            }
        }
    }

    let summary = client.metrics().get_summary();
    log::info!(
        "Event loop ended: {} sessions, {} chunks received, {} frames sent ({} dropped)",
        summary.total_sessions,
        summary.total_chunks_received,
        summary.total_frames_sent,
        summary.total_frames_dropped
    );
}

/// Run effects: status lines are reported inline, the rest go to the runner
fn execute<S: OutputSink>(
    client: &VoiceClient<S>,
    effects: Vec<Effect>,
    runner: &Arc<dyn EffectRunner>,
    tx: &mpsc::UnboundedSender<ClientEvent>,
    report: &mut impl FnMut(String),
) -> Vec<JoinHandle<()>> {
    let mut pending = Vec::new();
    for effect in effects {
        match effect {
            Effect::EmitStatus => report(client.status().to_string()),
            other => pending.push(runner.spawn(other, tx.clone())),
        }
    }
    pending
}

fn metrics_json(metrics: &MetricsCollector) -> String {
    let value = serde_json::json!({
        "summary": metrics.get_summary(),
        "sessions": metrics.get_history(),
        "errors": metrics.get_errors(),
    });
    serde_json::to_string_pretty(&value).unwrap_or_else(|e| format!("metrics unavailable: {}", e))
}
