//! Wire message envelope — the tagged union exchanged with agents.
//!
//! Every frame on an agent connection is one `Message`. A Response carries
//! the same `id` as the Request it answers; correlation by `id` is
//! authoritative because completion order is not arrival order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Error;

/// Message kind discriminant. Serialized as its numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageType {
    Request,
    Response,
    Notification,
    Error,
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        match t {
            MessageType::Request => 0,
            MessageType::Response => 1,
            MessageType::Notification => 2,
            MessageType::Error => 3,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(v: u8) -> std::result::Result<Self, String> {
        match v {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::Response),
            2 => Ok(MessageType::Notification),
            3 => Ok(MessageType::Error),
            other => Err(format!("Unknown message type code: {other}")),
        }
    }
}

/// The error body carried inside a Response envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            data: None,
        }
    }
}

/// One frame on an agent connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID; a Response echoes its Request's id.
    pub id: String,

    /// Request / Response / Notification / Error.
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Method name (Request and Notification only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Method parameters (Request and Notification only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// Successful result (Response only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error detail (Response and Error only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Message {
    /// Create a new request with a fresh id.
    pub fn request(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: MessageType::Request,
            method: Some(method.into()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Create a notification (no response expected).
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: MessageType::Notification,
            method: Some(method.into()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Create a successful response correlated to `request_id`.
    pub fn response(request_id: impl Into<String>, result: Value) -> Self {
        Self {
            id: request_id.into(),
            kind: MessageType::Response,
            method: None,
            params: None,
            result: None,
            error: None,
        }
        .with_result(result)
    }

    /// Create an error response correlated to `request_id`.
    pub fn error_response(request_id: impl Into<String>, err: &Error) -> Self {
        Self {
            id: request_id.into(),
            kind: MessageType::Response,
            method: None,
            params: None,
            result: None,
            error: Some(ErrorBody::from(err)),
        }
    }

    fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Whether this message expects a response.
    pub fn expects_response(&self) -> bool {
        self.kind == MessageType::Request
    }
}
