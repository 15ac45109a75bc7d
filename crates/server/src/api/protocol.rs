//! JSON wire protocol of `/ws-flux`.
//!
//! Client frames are `{"type": ..., "data": {...}}`. Replies mirror the
//! shapes the web editor expects:
//!
//! * `prepare_latents` -> `{"success": bool, "error"?: string, "data": <request>}`
//! * `on_sample` -> `{"type": "on_sample", "data": {"images": [...], "attn_maps": [...]}}`
//!   or `{"type": "on_sample_done"}`
//! * anything unusable -> `{"error": string}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::TransportError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PrepareParams {
    pub prompt: String,
    #[serde(default)]
    pub steps: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    PrepareLatents(PrepareParams),
    OnSample,
}

/// A parsed frame together with the raw JSON it came from, echoed back in
/// prepare acknowledgments.
#[derive(Debug)]
pub struct ClientFrame {
    pub raw: Value,
    pub message: Result<ClientMessage, TransportError>,
}

/// Parses a text frame. Only unparseable JSON fails outright; bad payloads
/// of known types are kept so the reply can echo the request.
pub fn parse_frame(text: &str) -> Result<ClientFrame, TransportError> {
    let raw: Value = serde_json::from_str(text).map_err(|_| TransportError::InvalidJson)?;
    let kind = raw.get("type").cloned().unwrap_or(Value::Null);
    let data = raw.get("data").cloned().unwrap_or(Value::Null);

    let message = match kind.as_str() {
        Some("prepare_latents") => serde_json::from_value::<PrepareParams>(data)
            .map(ClientMessage::PrepareLatents)
            .map_err(|e| TransportError::InvalidData {
                kind: "prepare_latents",
                reason: e.to_string(),
            }),
        Some("on_sample") => Ok(ClientMessage::OnSample),
        Some(other) => Err(TransportError::UnknownType(other.to_string())),
        None => Err(TransportError::UnknownType(kind.to_string())),
    };
    Ok(ClientFrame { raw, message })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleData {
    pub images: Vec<String>,
    pub attn_maps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepEvent {
    OnSample { data: SampleData },
    OnSampleDone,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrepareAck {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReply {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Prepare(PrepareAck),
    Step(StepEvent),
    Error(ErrorReply),
}

impl ServerMessage {
    pub fn error(message: impl ToString) -> Self {
        Self::Error(ErrorReply {
            error: message.to_string(),
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({ "error": format!("failed to serialize reply: {e}") }).to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_prepare_with_and_without_steps() {
        let frame = parse_frame(r#"{"type":"prepare_latents","data":{"prompt":"a red fox","steps":2}}"#)
            .unwrap();
        assert_eq!(
            frame.message.unwrap(),
            ClientMessage::PrepareLatents(PrepareParams {
                prompt: "a red fox".into(),
                steps: Some(2),
            })
        );
        assert_eq!(frame.raw["data"]["steps"], 2);

        let frame = parse_frame(r#"{"type":"prepare_latents","data":{"prompt":"a cat"}}"#).unwrap();
        assert!(matches!(
            frame.message,
            Ok(ClientMessage::PrepareLatents(PrepareParams { steps: None, .. }))
        ));
    }

    #[test]
    fn prepare_without_prompt_keeps_raw() {
        let frame = parse_frame(r#"{"type":"prepare_latents","data":{}}"#).unwrap();
        assert!(matches!(frame.message, Err(TransportError::InvalidData { .. })));
        assert_eq!(frame.raw["type"], "prepare_latents");
    }

    #[test]
    fn on_sample_ignores_data() {
        let frame = parse_frame(r#"{"type":"on_sample","data":{}}"#).unwrap();
        assert_eq!(frame.message.unwrap(), ClientMessage::OnSample);
        let frame = parse_frame(r#"{"type":"on_sample"}"#).unwrap();
        assert_eq!(frame.message.unwrap(), ClientMessage::OnSample);
    }

    #[test]
    fn bad_frames() {
        assert!(matches!(parse_frame("{not json"), Err(TransportError::InvalidJson)));
        let frame = parse_frame(r#"{"type":"resize","data":{}}"#).unwrap();
        assert_eq!(
            frame.message.unwrap_err().to_string(),
            "Unknown message type: resize"
        );
        let frame = parse_frame(r#"{"data":{}}"#).unwrap();
        assert_eq!(
            frame.message.unwrap_err().to_string(),
            "Unknown message type: null"
        );
    }

    #[test]
    fn replies_serialize_to_wire_shapes() {
        let ack = ServerMessage::Prepare(PrepareAck {
            success: true,
            error: None,
            data: json!({"type": "prepare_latents"}),
        });
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"success": true, "data": {"type": "prepare_latents"}})
        );

        let step = ServerMessage::Step(StepEvent::OnSample {
            data: SampleData {
                images: vec!["aW1n".into()],
                attn_maps: vec![],
            },
        });
        assert_eq!(
            serde_json::to_value(&step).unwrap(),
            json!({"type": "on_sample", "data": {"images": ["aW1n"], "attn_maps": []}})
        );

        let done = ServerMessage::Step(StepEvent::OnSampleDone);
        assert_eq!(done.to_json(), r#"{"type":"on_sample_done"}"#);

        assert_eq!(
            ServerMessage::error("Invalid JSON").to_json(),
            r#"{"error":"Invalid JSON"}"#
        );
    }
}
