//! Request and reply envelopes exchanged over transport sockets.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::path;

/// Request envelope: `{ "_": id, "p": path, "d": data }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "_")]
    pub id: String,

    #[serde(rename = "p")]
    pub path: String,

    #[serde(rename = "d", default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Request {
    pub fn new(id: impl Into<String>, path: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            data,
        }
    }

    /// The request that tells a server to terminate.
    pub fn shutdown(id: impl Into<String>, delimiter: &str) -> Self {
        Self::new(id, path::shutdown_path(delimiter), Value::Null)
    }

    /// Best-effort correlation id of a frame that failed to decode as a request.
    pub fn peek_id(bytes: &[u8]) -> Option<String> {
        let value: Value = serde_json::from_slice(bytes).ok()?;
        value.get("_")?.as_str().map(str::to_string)
    }
}

/// Failure codes a server puts in the `e` field of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyCode {
    InvalidMessage,
    InvalidService,
    InvalidMethod,
    HandlerFailed,
    #[serde(other)]
    Unknown,
}

/// Reply envelope: `{ "_": id, "s": service, "d": value, "e": code }`.
///
/// A success always carries `d`, even when it is `null`. A failure carries
/// `e` and the failure message in `d`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(rename = "_")]
    pub id: String,

    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    #[serde(
        rename = "d",
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Value>,

    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyCode>,
}

// Distinguishes `"d": null` (Some(Null)) from a missing `d` (None).
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Reply {
    pub fn success(id: impl Into<String>, service: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            service: Some(service.into()),
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(
        id: impl Into<String>,
        service: Option<String>,
        code: ReplyCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            service,
            data: Some(Value::String(message.into())),
            error: Some(code),
        }
    }

    /// Turn the reply into the value or typed error its caller receives.
    pub fn into_result(self) -> Result<Value> {
        let Some(code) = self.error else {
            return self.data.ok_or(Error::EmptyResponse(self.id));
        };

        let message = match self.data {
            Some(Value::String(message)) => message,
            Some(other) => other.to_string(),
            None => format!("{code:?}"),
        };

        Err(match code {
            ReplyCode::InvalidService => {
                Error::UnknownService(self.service.unwrap_or(message))
            }
            ReplyCode::InvalidMethod => Error::InvalidMethod(message),
            ReplyCode::InvalidMessage | ReplyCode::HandlerFailed | ReplyCode::Unknown => {
                Error::InvalidResponse {
                    id: self.id,
                    reason: message,
                }
            }
        })
    }
}
