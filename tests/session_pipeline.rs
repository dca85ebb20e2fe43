//! Session pipeline tests
//!
//! Drive the client with the same events the transport produces, using the
//! real codec and dispatch, without a network or audio device.

use std::sync::{Arc, Mutex};

use voicelink::audio::{DeviceError, OutputSink};
use voicelink::client::{ClientEvent, VoiceClient};
use voicelink::playback::PlaybackState;
use voicelink::state_machine::{CaptureStatus, Effect, EndReason, Event, SessionState, Status};
use voicelink::streaming::{
    codec, dispatch, AudioSender, LinkState, SampleFrame, SendOutcome, ServerMessage,
};

/// Output that records submissions; completions are delivered by the test
#[derive(Clone, Default)]
struct RecordingSink {
    submitted: Arc<Mutex<Vec<(u64, SampleFrame)>>>,
}

impl OutputSink for RecordingSink {
    fn submit(&mut self, ticket: u64, buffer: SampleFrame) -> Result<(), DeviceError> {
        self.submitted.lock().unwrap().push((ticket, buffer));
        Ok(())
    }
}

fn server_says(
    client: &mut VoiceClient<RecordingSink>,
    connection: uuid::Uuid,
    json: &str,
) -> Vec<Effect> {
    match dispatch(connection, ServerMessage::parse(json)) {
        Some(event) => client.handle(event.into()),
        None => vec![],
    }
}

fn connected_client() -> (VoiceClient<RecordingSink>, RecordingSink, uuid::Uuid) {
    let sink = RecordingSink::default();
    let mut client = VoiceClient::new(sink.clone(), 30_000);

    let effects = client.handle(Event::ConnectRequested.into());
    assert!(effects.contains(&Effect::Connect));

    let connection = uuid::Uuid::new_v4();
    client.handle(voicelink::streaming::TransportEvent::Opened { connection }.into());
    (client, sink, connection)
}

#[test]
fn test_session_audio_then_end() {
    let (mut client, sink, connection) = connected_client();

    server_says(
        &mut client,
        connection,
        r#"{"type":"session_id","session_id":"abc123"}"#,
    );
    assert_eq!(
        client.state().session,
        SessionState::Active {
            session_id: "abc123".to_string()
        }
    );

    // Microphone on
    let effects = client.handle(Event::StartCaptureRequested.into());
    assert!(effects.contains(&Effect::StartCapture { connection }));
    client.handle(Event::CaptureStarted { connection }.into());
    assert_eq!(client.status().status, Status::Listening);

    server_says(
        &mut client,
        connection,
        r#"{"type":"audio_chunk","audio":"AAAAAAAAAAA="}"#,
    );
    assert_eq!(client.state().playback, PlaybackState::Playing);
    assert_eq!(client.status().status, Status::Responding);

    let effects = server_says(&mut client, connection, r#"{"type":"session_end"}"#);
    assert!(effects.contains(&Effect::StopCapture));
    assert_eq!(client.state().capture, CaptureStatus::Stopped);
    assert_eq!(
        client.state().session,
        SessionState::Ended {
            session_id: Some("abc123".to_string()),
            reason: EndReason::Remote
        }
    );

    // The buffer still plays out after the session ends
    let (ticket, buffer) = sink.submitted.lock().unwrap()[0].clone();
    assert_eq!(buffer, vec![0.0; 4]);
    client.handle(ClientEvent::BufferCompleted { ticket });

    assert_eq!(client.state().playback, PlaybackState::Idle);
    assert_eq!(client.scheduler().stats().played, 1);
    assert_eq!(client.status().status, Status::SessionEnded);
}

#[test]
fn test_chunks_play_in_arrival_order() {
    let (mut client, sink, connection) = connected_client();

    let payloads: Vec<String> = [100i16, 200, 300]
        .iter()
        .map(|v| {
            use base64::Engine;
            let bytes: Vec<u8> = std::iter::repeat(*v)
                .take(8)
                .flat_map(|s| s.to_le_bytes())
                .collect();
            base64::engine::general_purpose::STANDARD.encode(bytes)
        })
        .collect();

    for payload in &payloads {
        server_says(
            &mut client,
            connection,
            &format!(r#"{{"type":"audio_chunk","audio":"{}"}}"#, payload),
        );
    }

    // One at a time: only the first is at the output
    assert_eq!(sink.submitted.lock().unwrap().len(), 1);

    for _ in 0..3 {
        let ticket = sink.submitted.lock().unwrap().last().unwrap().0;
        client.handle(ClientEvent::BufferCompleted { ticket });
    }

    let firsts: Vec<i16> = sink
        .submitted
        .lock()
        .unwrap()
        .iter()
        .map(|(_, b)| codec::quantize(&b[..1])[0])
        .collect();
    // Quantization is within one step of the original integers
    for (got, want) in firsts.iter().zip([100i16, 200, 300]) {
        assert!((got - want).abs() <= 1, "{} vs {}", got, want);
    }
    assert_eq!(client.state().playback, PlaybackState::Idle);
}

#[test]
fn test_junk_audio_never_reaches_playback() {
    let (mut client, sink, connection) = connected_client();

    server_says(&mut client, connection, r#"{"type":"audio_chunk","audio":"AA"}"#);
    server_says(&mut client, connection, r#"{"type":"audio_chunk","audio":"!!!!!!!!!!!!"}"#);
    server_says(&mut client, connection, r#"{"type":"mystery"}"#);
    server_says(&mut client, connection, "not json");

    assert!(sink.submitted.lock().unwrap().is_empty());
    assert_eq!(client.state().session, SessionState::NoSession);
}

#[test]
fn test_misaligned_chunk_is_recovered() {
    let (mut client, sink, connection) = connected_client();

    server_says(
        &mut client,
        connection,
        r#"{"type":"audio_chunk","audio":"AAAAAAAAAAAA"}"#,
    );

    let submitted = sink.submitted.lock().unwrap();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].1.len(), 4);
}

#[test]
fn test_force_stop_ends_session_locally() {
    let (mut client, _sink, connection) = connected_client();
    server_says(
        &mut client,
        connection,
        r#"{"type":"session_id","session_id":"abc123"}"#,
    );

    let effects = client.handle(Event::ForceStopRequested.into());
    assert!(effects.contains(&Effect::RequestForceStop {
        session_id: "abc123".to_string()
    }));
    assert!(effects.contains(&Effect::StopCapture));

    // Server confirms out of band, then the channel follows with session_end
    client.handle(
        Event::ForceStopFinished {
            session_id: "abc123".to_string(),
            result: Ok("Session forcefully stopped".to_string()),
        }
        .into(),
    );
    let effects = server_says(&mut client, connection, r#"{"type":"session_end"}"#);
    assert!(effects.contains(&Effect::StopCapture));

    assert!(matches!(
        client.state().session,
        SessionState::Ended {
            reason: EndReason::ForceStopped,
            ..
        }
    ));
    assert_eq!(
        client.status().notice.as_deref(),
        Some("Session forcefully stopped")
    );
}

#[test]
fn test_reconnect_starts_new_session() {
    let (mut client, _sink, first) = connected_client();
    server_says(&mut client, first, r#"{"type":"session_id","session_id":"one"}"#);
    client.handle(
        voicelink::streaming::TransportEvent::Closed {
            connection: first,
            reason: "stream ended".to_string(),
        }
        .into(),
    );
    assert_eq!(client.status().status, Status::Disconnected);

    client.handle(Event::ConnectRequested.into());
    let second = uuid::Uuid::new_v4();
    client.handle(voicelink::streaming::TransportEvent::Opened { connection: second }.into());

    // Late message from the old connection is ignored
    server_says(&mut client, first, r#"{"type":"session_id","session_id":"stale"}"#);
    assert_eq!(client.state().session, SessionState::NoSession);

    server_says(&mut client, second, r#"{"type":"session_id","session_id":"two"}"#);
    assert_eq!(client.state().session.session_id(), Some("two"));
}

#[test]
fn test_send_while_closed_is_silently_dropped() {
    let sender = AudioSender::closed();

    assert_eq!(sender.link_state(), LinkState::Closed);
    assert_eq!(sender.offer(&vec![0.25; 4096]), SendOutcome::LinkDown);
    assert_eq!(sender.counts(), (0, 1));
}
