//! Boundary frames exchanged between the gateway and a client connection.
//!
//! Every frame is a JSON object of shape `{type, payload, requestId?}`,
//! newline-framed on the wire (or carried verbatim inside a WebSocket frame
//! by the boundary layer). The op enums are adjacently tagged on
//! `type`/`payload`; the optional `requestId` rides alongside them, so the
//! envelope (de)serializes through an explicit merge.

use serde::Deserialize;
use serde::Serialize;
use serde::de::Deserializer;
use serde::ser::Error as _;
use serde::ser::Serializer;

use crate::ir::ApprovalDecision;
use crate::ir::RunView;

#[derive(Debug, Clone, PartialEq)]
pub struct ClientFrame {
    pub op: ClientOp,
    pub request_id: Option<String>,
}

/// Client-originated verbs. Thread/turn payloads are forwarded to the agent
/// verbatim, so they stay untyped here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientOp {
    #[serde(rename = "thread/start")]
    ThreadStart(serde_json::Value),
    #[serde(rename = "thread/resume")]
    ThreadResume(serde_json::Value),
    #[serde(rename = "turn/start")]
    TurnStart(serde_json::Value),
    #[serde(rename = "turn/interrupt")]
    TurnInterrupt(serde_json::Value),
    #[serde(rename = "approval/respond")]
    ApprovalRespond(ApprovalRespondPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRespondPayload {
    pub approval_id: String,
    pub decision: ApprovalDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_settings: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerFrame {
    pub op: ServerOp,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerOp {
    /// Reply to a client verb, correlated by `requestId`.
    #[serde(rename = "response")]
    Response(serde_json::Value),
    /// An agent notification, forwarded verbatim.
    #[serde(rename = "event")]
    Event(EventPayload),
    /// A pending approval dispatched to the user.
    #[serde(rename = "approval/request")]
    ApprovalRequest(serde_json::Value),
    #[serde(rename = "error")]
    Error(ErrorPayload),
    /// Current run-view snapshot for one thread.
    #[serde(rename = "ir/update")]
    IrUpdate(RunView),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ServerFrame {
    pub fn response(request_id: Option<String>, payload: serde_json::Value) -> Self {
        Self {
            op: ServerOp::Response(payload),
            request_id,
        }
    }

    pub fn event(method: String, params: Option<serde_json::Value>) -> Self {
        Self {
            op: ServerOp::Event(EventPayload { method, params }),
            request_id: None,
        }
    }

    pub fn approval_request(payload: serde_json::Value) -> Self {
        Self {
            op: ServerOp::ApprovalRequest(payload),
            request_id: None,
        }
    }

    pub fn error(request_id: Option<String>, message: String) -> Self {
        Self {
            op: ServerOp::Error(ErrorPayload {
                message,
                details: None,
            }),
            request_id,
        }
    }

    pub fn error_with_details(
        request_id: Option<String>,
        message: String,
        details: serde_json::Value,
    ) -> Self {
        Self {
            op: ServerOp::Error(ErrorPayload {
                message,
                details: Some(details),
            }),
            request_id,
        }
    }

    pub fn ir_update(view: RunView) -> Self {
        Self {
            op: ServerOp::IrUpdate(view),
            request_id: None,
        }
    }
}

fn serialize_envelope<S, Op>(op: &Op, request_id: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    Op: Serialize,
{
    let mut value = serde_json::to_value(op).map_err(S::Error::custom)?;
    if let (Some(request_id), Some(map)) = (request_id, value.as_object_mut()) {
        map.insert(
            "requestId".to_string(),
            serde_json::Value::String(request_id.clone()),
        );
    }
    value.serialize(serializer)
}

fn split_request_id(value: &mut serde_json::Value) -> Option<String> {
    value
        .as_object_mut()
        .and_then(|map| map.remove("requestId"))
        .and_then(|id| id.as_str().map(str::to_owned))
}

impl Serialize for ClientFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_envelope(&self.op, &self.request_id, serializer)
    }
}

impl<'de> Deserialize<'de> for ClientFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut value = serde_json::Value::deserialize(deserializer)?;
        let request_id = split_request_id(&mut value);
        let op = serde_json::from_value(value).map_err(serde::de::Error::custom)?;
        Ok(Self { op, request_id })
    }
}

impl Serialize for ServerFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_envelope(&self.op, &self.request_id, serializer)
    }
}

impl<'de> Deserialize<'de> for ServerFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut value = serde_json::Value::deserialize(deserializer)?;
        let request_id = split_request_id(&mut value);
        let op = serde_json::from_value(value).map_err(serde::de::Error::custom)?;
        Ok(Self { op, request_id })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn client_frame_round_trips_with_request_id() {
        let line = r#"{"type":"turn/start","payload":{"text":"hi"},"requestId":"r1"}"#;
        let frame: ClientFrame = serde_json::from_str(line).expect("parse");
        assert_eq!(frame.request_id, Some("r1".to_string()));
        assert_eq!(frame.op, ClientOp::TurnStart(json!({"text": "hi"})));
        let encoded = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(
            encoded,
            json!({"type": "turn/start", "payload": {"text": "hi"}, "requestId": "r1"})
        );
    }

    #[test]
    fn approval_respond_payload_is_typed() {
        let line = r#"{"type":"approval/respond","payload":{"approvalId":"a1","decision":"decline"}}"#;
        let frame: ClientFrame = serde_json::from_str(line).expect("parse");
        assert_eq!(frame.request_id, None);
        assert_eq!(
            frame.op,
            ClientOp::ApprovalRespond(ApprovalRespondPayload {
                approval_id: "a1".to_string(),
                decision: ApprovalDecision::Decline,
                accept_settings: None,
            })
        );
    }

    #[test]
    fn server_error_frame_keeps_optional_request_id() {
        let frame = ServerFrame::error(Some("r9".to_string()), "nope".to_string());
        let encoded = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(
            encoded,
            json!({"type": "error", "payload": {"message": "nope"}, "requestId": "r9"})
        );
    }

    #[test]
    fn ir_update_frames_round_trip() {
        let frame = ServerFrame::ir_update(RunView::new("t1".to_string()));
        let line = serde_json::to_string(&frame).expect("serialize");
        let decoded: ServerFrame = serde_json::from_str(&line).expect("parse");
        assert_eq!(decoded, frame);
    }
}
