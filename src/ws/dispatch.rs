//! Routes inbound control messages to their handlers.
//!
//! Every text frame passes through [`handle_text_frame`]: a structural peek
//! of the envelope, the sequence check, then a strict typed parse and a match
//! on the message kind. A sequence violation is the only condition that
//! terminates the connection from here; every other failure drops the frame
//! and leaves the session running.

use crate::config::OpenFailurePolicy;
use crate::registry::{Session, SessionPhase};
use crate::state::AppState;
use crate::ws::protocol::{
    ClientMessage, DisconnectReason, EnvelopeHeader, OpenParameters, ServerKind, select_media,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Message kinds this server understands. Anything else is logged and
/// dropped without a reply.
const KNOWN_KINDS: [&str; 5] = ["open", "ping", "update", "close", "error"];

/// Handles one inbound text frame for the named session.
pub async fn handle_text_frame(state: &AppState, session_id: &str, text: &str) {
    let Some(session) = state.registry.get(session_id) else {
        warn!(session_id, "Control message for unknown session dropped");
        return;
    };

    // Stage one: the envelope fields every message must carry.
    let header: EnvelopeHeader = match serde_json::from_str(text) {
        Ok(header) => header,
        Err(e) => {
            warn!(session_id, error = %e, "Invalid message format; frame dropped");
            return;
        }
    };

    let expected = session.client_seq() + 1;
    if header.seq != expected {
        warn!(
            session_id,
            received = header.seq,
            expected,
            "Client sequence violation; disconnecting"
        );
        disconnect(state, &session, DisconnectReason::Error).await;
        return;
    }
    session.set_client_seq(header.seq);

    if !KNOWN_KINDS.contains(&header.kind.as_str()) {
        warn!(session_id, kind = %header.kind, "Unknown message type");
        return;
    }

    // Stage two: strict typed parse for the known kind.
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(session_id, kind = %header.kind, error = %e, "Malformed message dropped");
            return;
        }
    };

    match message {
        ClientMessage::Open { parameters } => {
            handle_open(state, &session, &header, parameters, text).await;
        }
        ClientMessage::Ping { .. } => {
            session
                .send_control(ServerKind::Pong, header.id, json!({}))
                .await;
        }
        ClientMessage::Update { parameters } => {
            info!(session_id, parameters = ?parameters, "Received update message");
        }
        ClientMessage::Close { parameters } => {
            match parameters.and_then(|p| p.reason) {
                Some(reason) => info!(session_id, %reason, "Received close message"),
                None => warn!(session_id, "Close message without a reason"),
            }
            session
                .send_control(ServerKind::Closed, header.id, json!({}))
                .await;
            // The client closes the socket after `closed`; teardown happens
            // in the read loop once it does.
            session.advance_phase(SessionPhase::Closing);
        }
        ClientMessage::Error { parameters } => match parameters {
            Some(p) => error!(
                session_id,
                code = p.code,
                message = p.message.as_deref().unwrap_or(""),
                retry_after = p.retry_after.as_deref().unwrap_or(""),
                "Client reported an error"
            ),
            None => warn!(session_id, "Error message without parameters"),
        },
    }
}

async fn handle_open(
    state: &AppState,
    session: &Arc<Session>,
    header: &EnvelopeHeader,
    parameters: Option<OpenParameters>,
    raw: &str,
) {
    let session_id = session.id();

    let Some(parameters) = parameters else {
        warn!(session_id, "Open message without parameters");
        apply_open_failure_policy(state, session).await;
        return;
    };

    // A nil conversation id is a connectivity probe: acknowledge nothing,
    // start nothing.
    if parameters.is_probe() {
        info!(session_id, "Connection probe; conversation not started");
        return;
    }

    let Some(selected) = select_media(&parameters.media) else {
        warn!(session_id, "No usable media format offered");
        apply_open_failure_policy(state, session).await;
        return;
    };
    let selected = selected.clone();

    info!(
        session_id,
        conversation_id = ?parameters.conversation_id,
        organization_id = parameters.organization_id.as_deref().unwrap_or(""),
        language = parameters.language.as_deref().unwrap_or(""),
        channels = ?selected.channels,
        "Opening conversation"
    );

    {
        let mut storage = session.storage.lock().unwrap();
        storage.conversation_id = parameters.conversation_id;
        storage.open_transaction = Some(raw.to_string());
    }

    session
        .send_control(
            ServerKind::Opened,
            header.id.clone(),
            json!({
                "startPaused": false,
                "media": [selected],
            }),
        )
        .await;
}

/// Policy hook for an `open` that cannot be honored: either leave the
/// connection idle (the peer decides what to do next) or actively end it.
async fn apply_open_failure_policy(state: &AppState, session: &Arc<Session>) {
    match state.config.open_failure_policy {
        OpenFailurePolicy::Idle => {}
        OpenFailurePolicy::Disconnect => {
            disconnect(state, session, DisconnectReason::Error).await;
        }
    }
}

/// Sends a `disconnect` reply and tears the session down.
pub(crate) async fn disconnect(
    state: &AppState,
    session: &Arc<Session>,
    reason: DisconnectReason,
) {
    info!(session_id = %session.id(), ?reason, "Disconnecting session");
    session.advance_phase(SessionPhase::Closing);
    session
        .send_control(
            ServerKind::Disconnect,
            session.id().to_string(),
            json!({ "reason": reason }),
        )
        .await;
    state.registry.remove(session.id()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::SessionPhase;
    use crate::transport::test_support::{RecordingSink, SentFrame};
    use serde_json::Value;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn test_state(policy: OpenFailurePolicy) -> AppState {
        AppState::new(Config {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            log_level: tracing::Level::INFO,
            open_failure_policy: policy,
            shutdown_grace: Duration::from_millis(100),
        })
    }

    fn add_session(state: &AppState, id: &str) -> (Arc<Session>, Arc<Mutex<Vec<SentFrame>>>) {
        let (sink, frames) = RecordingSink::new();
        let session = state.registry.add(id.into(), Box::new(sink)).unwrap();
        session.advance_phase(SessionPhase::Open);
        (session, frames)
    }

    fn sent_json(frames: &Arc<Mutex<Vec<SentFrame>>>) -> Vec<Value> {
        frames
            .lock()
            .unwrap()
            .iter()
            .filter_map(|frame| match frame {
                SentFrame::Text(text) => Some(serde_json::from_str(text).unwrap()),
                _ => None,
            })
            .collect()
    }

    fn open_message(seq: u64, conversation_id: &str, media: Value) -> String {
        json!({
            "id": format!("m{seq}"),
            "type": "open",
            "seq": seq,
            "parameters": {
                "organizationId": "org-1",
                "conversationId": conversation_id,
                "language": "en-US",
                "participant": {"ani": "+15551234", "aniName": "Ada", "dnis": "+15550000"},
                "media": media,
            }
        })
        .to_string()
    }

    const CONVERSATION: &str = "7f3c2a44-9a1b-4c6a-8a6e-1f2d3c4b5a69";
    const PROBE: &str = "00000000-0000-0000-0000-000000000000";

    #[tokio::test]
    async fn ping_yields_pong_echoing_id_and_clientseq() {
        let state = test_state(OpenFailurePolicy::Idle);
        let (_, frames) = add_session(&state, "s1");

        handle_text_frame(&state, "s1", r#"{"id":"abc","type":"ping","seq":1,"parameters":{}}"#)
            .await;

        let sent = sent_json(&frames);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "pong");
        assert_eq!(sent[0]["id"], "abc");
        assert_eq!(sent[0]["version"], "2");
        assert_eq!(sent[0]["seq"], 1);
        assert_eq!(sent[0]["clientseq"], 1);
        assert_eq!(sent[0]["parameters"], json!({}));
    }

    #[tokio::test]
    async fn sequence_violation_disconnects_and_stops_processing() {
        let state = test_state(OpenFailurePolicy::Idle);
        let (_, frames) = add_session(&state, "s1");

        handle_text_frame(&state, "s1", r#"{"id":"a","type":"ping","seq":5}"#).await;

        let sent = sent_json(&frames);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "disconnect");
        assert_eq!(sent[0]["id"], "s1");
        assert_eq!(sent[0]["parameters"]["reason"], "error");
        assert!(state.registry.get("s1").is_none());
        assert_eq!(
            frames.lock().unwrap().last().unwrap().clone(),
            SentFrame::Close
        );

        // Nothing further is processed for the torn-down session.
        handle_text_frame(&state, "s1", r#"{"id":"b","type":"ping","seq":1}"#).await;
        assert_eq!(sent_json(&frames).len(), 1);
    }

    #[tokio::test]
    async fn malformed_json_is_dropped_and_connection_survives() {
        let state = test_state(OpenFailurePolicy::Idle);
        let (session, frames) = add_session(&state, "s1");

        handle_text_frame(&state, "s1", "this is not json").await;
        handle_text_frame(&state, "s1", r#"{"id":"a","type":"ping"}"#).await;

        assert!(frames.lock().unwrap().is_empty());
        assert!(state.registry.get("s1").is_some());
        assert_eq!(session.client_seq(), 0);

        // A well-formed frame afterwards is still processed.
        handle_text_frame(&state, "s1", r#"{"id":"a","type":"ping","seq":1}"#).await;
        assert_eq!(sent_json(&frames).len(), 1);
    }

    #[tokio::test]
    async fn unknown_type_is_dropped_without_reply() {
        let state = test_state(OpenFailurePolicy::Idle);
        let (session, frames) = add_session(&state, "s1");

        handle_text_frame(&state, "s1", r#"{"id":"a","type":"dtmf","seq":1}"#).await;

        assert!(frames.lock().unwrap().is_empty());
        assert!(state.registry.get("s1").is_some());
        // The envelope was accepted, so the sequence advanced.
        assert_eq!(session.client_seq(), 1);
    }

    #[tokio::test]
    async fn probe_open_is_silent_and_mutation_free() {
        let state = test_state(OpenFailurePolicy::Idle);
        let (session, frames) = add_session(&state, "s1");

        let media = json!([{"type": "audio", "format": "PCMU", "channels": ["external"], "rate": 8000}]);
        handle_text_frame(&state, "s1", &open_message(1, PROBE, media)).await;

        assert!(frames.lock().unwrap().is_empty());
        let storage = session.storage.lock().unwrap();
        assert!(storage.conversation_id.is_none());
        assert!(storage.open_transaction.is_none());
    }

    #[tokio::test]
    async fn open_selects_stereo_media_and_persists_storage() {
        let state = test_state(OpenFailurePolicy::Idle);
        let (session, frames) = add_session(&state, "s1");

        let media = json!([
            {"type": "audio", "format": "PCMU", "channels": ["internal"], "rate": 8000},
            {"type": "audio", "format": "PCMU", "channels": ["internal", "external"], "rate": 8000},
            {"type": "audio", "format": "PCMU", "channels": ["external"], "rate": 8000},
        ]);
        let raw = open_message(1, CONVERSATION, media);
        handle_text_frame(&state, "s1", &raw).await;

        let sent = sent_json(&frames);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "opened");
        assert_eq!(sent[0]["id"], "m1");
        assert_eq!(sent[0]["clientseq"], 1);
        assert_eq!(sent[0]["parameters"]["startPaused"], json!(false));
        let media_reply = sent[0]["parameters"]["media"].as_array().unwrap();
        assert_eq!(media_reply.len(), 1);
        assert_eq!(
            media_reply[0]["channels"],
            json!(["internal", "external"])
        );

        let storage = session.storage.lock().unwrap();
        assert_eq!(
            storage.conversation_id.map(|u| u.to_string()).as_deref(),
            Some(CONVERSATION)
        );
        assert_eq!(storage.open_transaction.as_deref(), Some(raw.as_str()));
    }

    #[tokio::test]
    async fn open_without_stereo_falls_back_to_first_offer() {
        let state = test_state(OpenFailurePolicy::Idle);
        let (_, frames) = add_session(&state, "s1");

        let media = json!([
            {"type": "audio", "format": "L16", "channels": ["external"], "rate": 16000},
            {"type": "audio", "format": "PCMU", "channels": ["internal"], "rate": 8000},
        ]);
        handle_text_frame(&state, "s1", &open_message(1, CONVERSATION, media)).await;

        let sent = sent_json(&frames);
        assert_eq!(sent[0]["parameters"]["media"][0]["channels"], json!(["external"]));
        assert_eq!(sent[0]["parameters"]["media"][0]["format"], "L16");
    }

    #[tokio::test]
    async fn open_with_empty_media_sends_nothing_under_idle_policy() {
        let state = test_state(OpenFailurePolicy::Idle);
        let (_, frames) = add_session(&state, "s1");

        handle_text_frame(&state, "s1", &open_message(1, CONVERSATION, json!([]))).await;

        assert!(frames.lock().unwrap().is_empty());
        assert!(state.registry.get("s1").is_some());
    }

    #[tokio::test]
    async fn open_with_empty_media_disconnects_under_disconnect_policy() {
        let state = test_state(OpenFailurePolicy::Disconnect);
        let (_, frames) = add_session(&state, "s1");

        handle_text_frame(&state, "s1", &open_message(1, CONVERSATION, json!([]))).await;

        let sent = sent_json(&frames);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "disconnect");
        assert_eq!(sent[0]["parameters"]["reason"], "error");
        assert!(state.registry.get("s1").is_none());
    }

    #[tokio::test]
    async fn open_without_parameters_is_idle_by_default() {
        let state = test_state(OpenFailurePolicy::Idle);
        let (_, frames) = add_session(&state, "s1");

        handle_text_frame(&state, "s1", r#"{"id":"m1","type":"open","seq":1}"#).await;

        assert!(frames.lock().unwrap().is_empty());
        assert!(state.registry.get("s1").is_some());
    }

    #[tokio::test]
    async fn close_replies_closed_and_marks_session_closing() {
        let state = test_state(OpenFailurePolicy::Idle);
        let (session, frames) = add_session(&state, "s1");

        handle_text_frame(
            &state,
            "s1",
            r#"{"id":"m9","type":"close","seq":1,"parameters":{"reason":"end"}}"#,
        )
        .await;

        let sent = sent_json(&frames);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "closed");
        assert_eq!(sent[0]["id"], "m9");
        assert_eq!(sent[0]["clientseq"], 1);
        assert_eq!(sent[0]["parameters"], json!({}));
        assert_eq!(session.phase(), SessionPhase::Closing);
        // The reply went out before the session becomes eligible for removal.
        assert!(state.registry.get("s1").is_some());
    }

    #[tokio::test]
    async fn close_without_reason_still_replies_closed() {
        let state = test_state(OpenFailurePolicy::Idle);
        let (_, frames) = add_session(&state, "s1");

        handle_text_frame(&state, "s1", r#"{"id":"m9","type":"close","seq":1}"#).await;

        let sent = sent_json(&frames);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "closed");
    }

    #[tokio::test]
    async fn client_error_is_logged_without_reply() {
        let state = test_state(OpenFailurePolicy::Idle);
        let (session, frames) = add_session(&state, "s1");

        handle_text_frame(
            &state,
            "s1",
            r#"{"id":"e1","type":"error","seq":1,"parameters":{"code":408,"message":"client timeout"}}"#,
        )
        .await;

        assert!(frames.lock().unwrap().is_empty());
        assert_eq!(session.client_seq(), 1);
        assert!(state.registry.get("s1").is_some());
    }

    #[tokio::test]
    async fn update_is_logged_without_reply_or_state_change() {
        let state = test_state(OpenFailurePolicy::Idle);
        let (session, frames) = add_session(&state, "s1");

        handle_text_frame(
            &state,
            "s1",
            r#"{"id":"u1","type":"update","seq":1,"parameters":{"language":"fr-FR"}}"#,
        )
        .await;

        assert!(frames.lock().unwrap().is_empty());
        assert_eq!(session.client_seq(), 1);
        let storage = session.storage.lock().unwrap();
        assert!(storage.conversation_id.is_none());
    }

    #[tokio::test]
    async fn sequence_replies_track_consecutive_messages() {
        let state = test_state(OpenFailurePolicy::Idle);
        let (_, frames) = add_session(&state, "s1");

        for seq in 1..=3u64 {
            handle_text_frame(
                &state,
                "s1",
                &json!({"id": format!("p{seq}"), "type": "ping", "seq": seq}).to_string(),
            )
            .await;
        }

        let sent = sent_json(&frames);
        assert_eq!(sent.len(), 3);
        for (i, reply) in sent.iter().enumerate() {
            let n = (i + 1) as u64;
            assert_eq!(reply["seq"], json!(n));
            assert_eq!(reply["clientseq"], json!(n));
        }
    }
}
