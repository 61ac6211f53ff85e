//! Line-framed JSON-RPC message model for the agent dialect.
//!
//! The dialect does not tag messages; the three shapes are told apart by the
//! fields they carry. `id` + `method` is a request, `id` + (`result` |
//! `error`) is a response, `method` without `id` is a notification.

use serde::Deserialize;
use serde::Serialize;
use serde::de::Deserializer;
use tracing::error;

/// Request identifier. IDs are opaque: an integer id and a string id that
/// happen to render the same are different ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Integer(i) => write!(f, "{i}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// `error` wins when a peer sends both fields.
    pub fn into_outcome(self) -> Result<serde_json::Value, JsonRpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(serde_json::Value::Null)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// Discriminate a decoded JSON object by field shape.
    pub fn from_value(value: serde_json::Value) -> Result<Self, String> {
        let object = value
            .as_object()
            .ok_or_else(|| "frame is not a JSON object".to_string())?;
        let has_id = object.contains_key("id");
        let has_method = object.contains_key("method");

        if has_id && has_method {
            let request = serde_json::from_value(value).map_err(|e| e.to_string())?;
            return Ok(JsonRpcMessage::Request(request));
        }
        if has_id {
            if !object.contains_key("result") && !object.contains_key("error") {
                return Err("response carries neither result nor error".to_string());
            }
            let response = serde_json::from_value(value).map_err(|e| e.to_string())?;
            return Ok(JsonRpcMessage::Response(response));
        }
        if has_method {
            let notification = serde_json::from_value(value).map_err(|e| e.to_string())?;
            return Ok(JsonRpcMessage::Notification(notification));
        }
        Err("frame has neither id nor method".to_string())
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        JsonRpcMessage::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// Serialize a message as a single frame. The transport appends the `\n`
/// terminator.
pub fn encode_line(message: &JsonRpcMessage) -> serde_json::Result<String> {
    serde_json::to_string(message)
}

/// Decode one line into a message. A malformed line is logged and dropped; it
/// must never abort the surrounding stream.
pub fn decode_line(line: &str) -> Option<JsonRpcMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<JsonRpcMessage>(trimmed) {
        Ok(message) => Some(message),
        Err(e) => {
            error!("dropping malformed frame: {e}; line = {line}");
            None
        }
    }
}
