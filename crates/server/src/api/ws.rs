//! WebSocket endpoint, `GET /ws-flux`.
//!
//! # Protocol
//!
//! 1. Client opens a WebSocket to `ws://host/ws-flux`.
//! 2. Client sends `prepare_latents` with a prompt (and optionally a step
//!    count); the server prepares a new session and acknowledges.
//! 3. Each `on_sample` advances the session by one step and returns the
//!    decoded image plus one attention map per prompt token.
//! 4. Once all steps ran, `on_sample` answers `on_sample_done`.
//!
//! Errors are reported as `{"error": ...}` frames; the connection is only
//! closed by the client.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use super::protocol::{parse_frame, ClientMessage, PrepareAck, ServerMessage, StepEvent};
use super::session::StepReply;
use super::AppState;

/// Upgrades `GET /ws-flux` and serves the step-wise generation protocol.
pub async fn flux_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|socket| {
        let conn_id = Uuid::new_v4();
        handle_socket(socket, state).instrument(info_span!("ws", %conn_id))
    })
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    info!("client connected");
    loop {
        let msg = match socket.recv().await {
            Some(Ok(m)) => m,
            // Client closed or network error.
            _ => break,
        };

        let text = match msg {
            Message::Text(t) => t.as_str().to_owned(),
            Message::Close(_) => break,
            // Ignore binary, ping, pong.
            _ => continue,
        };

        let reply = handle_text(&state, &text).await;
        if socket.send(Message::Text(reply.to_json().into())).await.is_err() {
            break;
        }
    }
    info!("client disconnected");
}

/// Handles one client text frame and produces the reply frame.
pub async fn handle_text(state: &AppState, text: &str) -> ServerMessage {
    let frame = match parse_frame(text) {
        Ok(frame) => frame,
        Err(e) => return ServerMessage::error(e),
    };

    match frame.message {
        Ok(ClientMessage::PrepareLatents(params)) => {
            debug!(prompt = %params.prompt, steps = ?params.steps, "prepare_latents");
            let error = state
                .coordinator
                .prepare(params)
                .await
                .err()
                .map(|e| e.to_string());
            ServerMessage::Prepare(PrepareAck {
                success: error.is_none(),
                error,
                data: frame.raw,
            })
        }
        Ok(ClientMessage::OnSample) => match state.coordinator.advance().await {
            Ok(StepReply::Sample(data)) => ServerMessage::Step(StepEvent::OnSample { data }),
            Ok(StepReply::Done) => ServerMessage::Step(StepEvent::OnSampleDone),
            Err(e) => ServerMessage::error(e),
        },
        Err(e @ super::error::TransportError::InvalidData { .. }) => {
            ServerMessage::Prepare(PrepareAck {
                success: false,
                error: Some(e.to_string()),
                data: frame.raw,
            })
        }
        Err(e) => ServerMessage::error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::session::{SessionCoordinator, SessionDefaults};
    use fluxstep_core::testing::MockComponents;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn state() -> AppState {
        AppState::new(Arc::new(SessionCoordinator::new(
            MockComponents::tiny().components,
            SessionDefaults {
                height: 64,
                width: 64,
                ..Default::default()
            },
        )))
    }

    async fn send(state: &AppState, frame: Value) -> Value {
        let reply = handle_text(state, &frame.to_string()).await;
        serde_json::from_str(&reply.to_json()).unwrap()
    }

    #[tokio::test]
    async fn red_fox_session_over_the_protocol() {
        let state = state();
        let prepare = json!({"type": "prepare_latents", "data": {"prompt": "a red fox", "steps": 2}});
        let ack = send(&state, prepare.clone()).await;
        assert_eq!(ack, json!({"success": true, "data": prepare}));

        for _ in 0..2 {
            let reply = send(&state, json!({"type": "on_sample", "data": {}})).await;
            assert_eq!(reply["type"], "on_sample");
            assert_eq!(reply["data"]["images"].as_array().unwrap().len(), 1);
            assert_eq!(reply["data"]["attn_maps"].as_array().unwrap().len(), 3);
        }
        let done = send(&state, json!({"type": "on_sample", "data": {}})).await;
        assert_eq!(done, json!({"type": "on_sample_done"}));
    }

    #[tokio::test]
    async fn malformed_frames_get_error_replies() {
        let state = state();
        let reply = handle_text(&state, "{\"type\": ").await;
        assert_eq!(reply.to_json(), r#"{"error":"Invalid JSON"}"#);

        let reply = send(&state, json!({"type": "upscale", "data": {}})).await;
        assert_eq!(reply, json!({"error": "Unknown message type: upscale"}));

        let reply = send(&state, json!({"type": "on_sample", "data": {}})).await;
        assert!(reply["error"].as_str().unwrap().contains("No active session"));
    }

    #[tokio::test]
    async fn failed_prepare_is_acknowledged_with_error() {
        let state = state();
        let frame = json!({"type": "prepare_latents", "data": {"steps": 2}});
        let ack = send(&state, frame.clone()).await;
        assert_eq!(ack["success"], false);
        assert_eq!(ack["data"], frame);
        assert!(ack["error"].as_str().unwrap().contains("prompt"));

        let frame = json!({"type": "prepare_latents", "data": {"prompt": "a red fox", "steps": 0}});
        let ack = send(&state, frame).await;
        assert_eq!(ack["success"], false);

        let frame = json!({"type": "prepare_latents", "data": {"prompt": "a red fox", "steps": 100000000000u64}});
        let ack = send(&state, frame.clone()).await;
        assert_eq!(ack["success"], false);
        assert_eq!(ack["data"], frame);
        assert!(ack["error"].as_str().unwrap().contains("at most 1000"));
    }
}
