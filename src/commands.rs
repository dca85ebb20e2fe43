//! Terminal commands
//!
//! One command per line on stdin. Lines are read on their own thread and
//! forwarded to the event loop.

use std::io::BufRead;
use std::str::FromStr;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::state_machine::Event;

/// Commands understood by the terminal front end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start streaming the microphone
    Start,
    /// Stop the microphone
    Stop,
    /// Force-stop the remote session
    End,
    /// Open a new connection
    Connect,
    /// Print the status line
    Status,
    /// Print session metrics as JSON
    Metrics,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            "end" => Ok(Command::End),
            "connect" | "reconnect" => Ok(Command::Connect),
            "status" => Ok(Command::Status),
            "metrics" => Ok(Command::Metrics),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(format!("Unknown command: {} (try 'help')", other)),
        }
    }
}

impl Command {
    /// Lifecycle event for commands that change state
    pub fn to_event(self) -> Option<Event> {
        match self {
            Command::Start => Some(Event::StartCaptureRequested),
            Command::Stop => Some(Event::StopCaptureRequested),
            Command::End => Some(Event::ForceStopRequested),
            Command::Connect => Some(Event::ConnectRequested),
            Command::Quit => Some(Event::ShutdownRequested),
            Command::Status | Command::Metrics | Command::Help => None,
        }
    }
}

pub const HELP: &str = "commands: start | stop | end | connect | status | metrics | help | quit";

/// Read commands from stdin until EOF or cancellation.
///
/// Runs on a plain thread: a blocking stdin read cannot be interrupted, and
/// it must not hold up runtime shutdown. Unknown commands are reported on
/// stdout and skipped. The sender is dropped on EOF, which the event loop
/// treats as `quit`.
pub fn spawn_stdin_reader(
    tx: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("voicelink-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                if cancel.is_cancelled() {
                    break;
                }
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        log::warn!("Commands: failed to read stdin: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(cmd) => {
                        if tx.send(cmd).is_err() {
                            break;
                        }
                    }
                    Err(e) => println!("{}", e),
                }
            }
            log::debug!("Commands: stdin reader exiting");
        })
}
