//! End-to-end run of the event loop
//!
//! Real transport and effect runner against a local WebSocket server, with a
//! scripted capture device and an output that finishes buffers immediately.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use voicelink::audio::{
    BlockCallback, CaptureDevice, CaptureStream, DeviceError, OutputSink, StreamGuard,
};
use voicelink::client::{ClientEvent, VoiceClient};
use voicelink::commands::Command;
use voicelink::effects::{DeviceEffectRunner, EffectRunner};
use voicelink::playback::PlaybackState;
use voicelink::settings::ClientSettings;
use voicelink::state_machine::{EndReason, SessionState};
use voicelink::streaming::SampleFrame;

type Mic = Arc<Mutex<Option<BlockCallback>>>;

/// Capture device whose blocks are pushed by the test
struct ScriptedMic {
    callback: Mic,
}

impl CaptureDevice for ScriptedMic {
    fn open(
        &mut self,
        _block_size: usize,
        on_block: BlockCallback,
    ) -> Result<StreamGuard, DeviceError> {
        *self.callback.lock().unwrap() = Some(on_block);
        let callback = self.callback.clone();
        Ok(StreamGuard::new(move || {
            callback.lock().unwrap().take();
        }))
    }
}

/// Output that reports each buffer as played as soon as it is submitted
struct InstantSink {
    played: Arc<Mutex<Vec<SampleFrame>>>,
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl OutputSink for InstantSink {
    fn submit(&mut self, ticket: u64, buffer: SampleFrame) -> Result<(), DeviceError> {
        self.played.lock().unwrap().push(buffer);
        let _ = self.tx.send(ClientEvent::BufferCompleted { ticket });
        Ok(())
    }
}

async fn wait_for(lines: &mut mpsc::UnboundedReceiver<String>, needle: &str) -> String {
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(line) = lines.recv().await {
            if line.contains(needle) {
                return Some(line);
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(line)) => line,
        _ => panic!("never saw a line containing {:?}", needle),
    }
}

#[tokio::test]
async fn test_session_round_trip_through_event_loop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Text(
            r#"{"type":"session_id","session_id":"abc123"}"#.to_string(),
        ))
        .await
        .unwrap();

        let mut frames = Vec::new();
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Text(text) => {
                    frames.push(text);
                    if frames.len() == 1 {
                        ws.send(Message::Text(
                            r#"{"type":"audio_chunk","audio":"AAAAAAAAAAA="}"#.to_string(),
                        ))
                        .await
                        .unwrap();
                        ws.send(Message::Text(r#"{"type":"session_end"}"#.to_string()))
                            .await
                            .unwrap();
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        frames
    });

    let mut settings = ClientSettings::default();
    settings.server_url = format!("ws://{}", addr);
    settings.control_url = "http://127.0.0.1:9".to_string();
    settings.connect_attempts = 1;
    settings.block_size = 4;

    let mic: Mic = Arc::new(Mutex::new(None));
    let capture = CaptureStream::new(
        Box::new(ScriptedMic {
            callback: mic.clone(),
        }),
        settings.block_size,
    );
    let runner: Arc<dyn EffectRunner> = DeviceEffectRunner::new(capture, &settings).unwrap();

    let (tx, rx) = mpsc::unbounded_channel::<ClientEvent>();
    let played = Arc::new(Mutex::new(Vec::new()));
    let mut client = VoiceClient::new(
        InstantSink {
            played: played.clone(),
            tx: tx.clone(),
        },
        settings.max_queued_ms,
    );

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (line_tx, mut lines) = mpsc::unbounded_channel::<String>();

    let event_loop = voicelink::run_event_loop(&mut client, runner, tx, rx, cmd_rx, move |line| {
        let _ = line_tx.send(line);
    });

    let driver = async move {
        assert!(wait_for(&mut lines, "status:").await.contains("disconnected"));

        cmd_tx.send(Command::Connect).unwrap();
        wait_for(&mut lines, "session: abc123").await;

        cmd_tx.send(Command::Start).unwrap();
        wait_for(&mut lines, "status: listening").await;

        {
            let mut mic = mic.lock().unwrap();
            let on_block = mic.as_mut().expect("capture device not open");
            on_block(vec![0.5, -0.5, 0.25, 0.0]);
        }

        let ended = wait_for(&mut lines, "status: session ended").await;
        assert!(ended.contains("ended by server"), "{}", ended);

        // Capture counters are reported once the mic has been released
        let mut metrics = String::new();
        for _ in 0..50 {
            cmd_tx.send(Command::Metrics).unwrap();
            metrics = wait_for(&mut lines, "total_chunks_received").await;
            if metrics.contains("\"total_frames_sent\": 1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(metrics.contains("\"total_chunks_received\": 1"), "{}", metrics);
        assert!(metrics.contains("\"total_frames_sent\": 1"), "{}", metrics);
        assert!(metrics.contains("\"buffers_played\": 1"), "{}", metrics);

        cmd_tx.send(Command::Quit).unwrap();
        mic
    };

    let ((), mic) = tokio::join!(event_loop, driver);

    // Capture released on session end
    assert!(mic.lock().unwrap().is_none());

    let frames = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    let first: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
    assert_eq!(first, serde_json::json!({ "audio": [0.5, -0.5, 0.25, 0.0] }));

    assert_eq!(played.lock().unwrap().as_slice(), &[vec![0.0f32; 4]]);
    assert_eq!(client.scheduler().state(), PlaybackState::Idle);
    assert_eq!(
        client.state().session,
        SessionState::Ended {
            session_id: Some("abc123".to_string()),
            reason: EndReason::Remote
        }
    );
}

#[tokio::test]
async fn test_closed_command_channel_shuts_down() {
    let settings = ClientSettings {
        control_url: "http://127.0.0.1:9".to_string(),
        ..ClientSettings::default()
    };
    let capture = CaptureStream::new(
        Box::new(ScriptedMic {
            callback: Arc::new(Mutex::new(None)),
        }),
        settings.block_size,
    );
    let runner: Arc<dyn EffectRunner> = DeviceEffectRunner::new(capture, &settings).unwrap();

    let (tx, rx) = mpsc::unbounded_channel::<ClientEvent>();
    let mut client = VoiceClient::new(
        InstantSink {
            played: Arc::new(Mutex::new(Vec::new())),
            tx: tx.clone(),
        },
        settings.max_queued_ms,
    );

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
    drop(cmd_tx);

    let mut lines = Vec::new();
    tokio::time::timeout(
        Duration::from_secs(5),
        voicelink::run_event_loop(&mut client, runner, tx, rx, cmd_rx, |line| lines.push(line)),
    )
    .await
    .expect("event loop did not stop on EOF");

    assert_eq!(lines.first().map(String::as_str), Some("status: disconnected"));
}
