use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error code sent when an inbound line is not valid JSON.
pub const PARSE_ERROR: &str = "PARSE_ERROR";
/// Error code sent when valid JSON is not a request frame.
pub const INVALID_REQUEST: &str = "INVALID_REQUEST";

/// Caller → server request.
/// Wire: `{ "type": "req", "id": "abc", "method": "tasks.get", "params": {...} }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReqFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl ReqFrame {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            frame_type: "req".to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// Server → caller response.
/// Wire: `{ "type": "res", "id": "abc", "ok": true, "payload": {...} }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResFrame {
    pub fn ok(id: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            frame_type: "res".to_string(),
            id: id.into(),
            ok: true,
            payload: Some(serde_json::to_value(payload).unwrap_or(Value::Null)),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, code: &str, message: &str) -> Self {
        Self {
            frame_type: "res".to_string(),
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

/// Raw inbound frame: parse the `type` discriminator first, then extract body.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

impl InboundFrame {
    /// Try to interpret this frame as a caller request.
    pub fn as_req(&self) -> Option<ReqFrame> {
        if self.frame_type != "req" {
            return None;
        }
        let mut map = self.rest.clone();
        map.insert("type".to_string(), Value::String("req".to_string()));
        serde_json::from_value(Value::Object(map)).ok()
    }
}

/// Why an inbound line could not be turned into a [`ReqFrame`].
///
/// Carries whatever request id could be salvaged so the error response can
/// still be correlated by the caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    #[error("parse error: {reason}")]
    Parse { id: Option<String>, reason: String },

    #[error("invalid request: {reason}")]
    Invalid { id: Option<String>, reason: String },
}

impl FrameError {
    pub fn id(&self) -> Option<&str> {
        match self {
            FrameError::Parse { id, .. } | FrameError::Invalid { id, .. } => id.as_deref(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            FrameError::Parse { .. } => PARSE_ERROR,
            FrameError::Invalid { .. } => INVALID_REQUEST,
        }
    }

    /// Error response for this failure, echoing the salvaged id (or "").
    pub fn to_response(&self) -> ResFrame {
        ResFrame::err(self.id().unwrap_or_default(), self.code(), &self.to_string())
    }
}

/// Decode one line of the stdio transport into a request.
///
/// Accepts string or numeric ids; numeric ids are echoed back as strings.
pub fn parse_request(line: &str) -> Result<ReqFrame, FrameError> {
    let value: Value = serde_json::from_str(line).map_err(|e| FrameError::Parse {
        id: None,
        reason: e.to_string(),
    })?;

    let id = match value.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };

    let mut map = match value {
        Value::Object(map) => map,
        _ => {
            return Err(FrameError::Invalid {
                id,
                reason: "frame must be a JSON object".to_string(),
            })
        }
    };

    let Some(id_str) = id.clone() else {
        return Err(FrameError::Invalid {
            id: None,
            reason: "missing 'id' field".to_string(),
        });
    };
    map.insert("id".to_string(), Value::String(id_str));
    map.entry("type")
        .or_insert_with(|| Value::String("req".to_string()));

    let frame: InboundFrame =
        serde_json::from_value(Value::Object(map)).map_err(|e| FrameError::Invalid {
            id: id.clone(),
            reason: e.to_string(),
        })?;
    frame.as_req().ok_or_else(|| FrameError::Invalid {
        id,
        reason: "expected a 'req' frame with a 'method'".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_id_is_echoed_as_string() {
        let req = parse_request(r#"{"type":"req","id":7,"method":"ping"}"#).unwrap();
        assert_eq!(req.id, "7");
        assert_eq!(req.method, "ping");
    }

    #[test]
    fn type_defaults_to_req() {
        let req = parse_request(r#"{"id":"a","method":"tasks.list"}"#).unwrap();
        assert_eq!(req.frame_type, "req");
        assert!(req.params.is_none());
    }

    #[test]
    fn malformed_json_is_a_parse_error_without_id() {
        let err = parse_request(r#"{"id":"a","method":"#).unwrap_err();
        assert_eq!(err.code(), PARSE_ERROR);
        assert_eq!(err.id(), None);
    }

    #[test]
    fn missing_method_keeps_the_id() {
        let err = parse_request(r#"{"type":"req","id":"x1"}"#).unwrap_err();
        assert_eq!(err.code(), INVALID_REQUEST);
        assert_eq!(err.id(), Some("x1"));
        let res = err.to_response();
        assert_eq!(res.id, "x1");
        assert!(!res.ok);
    }

    #[test]
    fn non_request_frame_type_is_rejected() {
        let err = parse_request(r#"{"type":"res","id":"x2","ok":true}"#).unwrap_err();
        assert_eq!(err.code(), INVALID_REQUEST);
    }
}
