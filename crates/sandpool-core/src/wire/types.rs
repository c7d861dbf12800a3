//! Message types for the supervisor/worker wire protocol.
//!
//! Implements tolerant reader pattern: unknown fields ignored, ambiguous
//! documents rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Compute request sent from the supervisor to a worker.
///
/// One request per connection; end-of-stream delimits the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRequest {
    /// URL of the compute module to load and invoke.
    pub module_url: String,
    /// Arbitrary JSON value passed to the module's compute entry point.
    pub params: Value,
}

/// Error payload returned by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub name: String,
    pub message: String,
    pub status: u16,
}

/// Execution profile attached to successful responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// Wall-clock duration of the module invocation.
    pub duration_ms: u64,
}

/// Compute response: exactly one of the result or error branches.
#[derive(Debug, Clone, PartialEq)]
pub enum WireResponse {
    Result {
        value: Value,
        profile: Option<Profile>,
    },
    Error(WireError),
}

impl WireResponse {
    /// Build a successful response.
    pub fn result(value: Value, profile: Option<Profile>) -> Self {
        Self::Result { value, profile }
    }

    /// Build an error response.
    pub fn error(name: impl Into<String>, message: impl Into<String>, status: u16) -> Self {
        Self::Error(WireError {
            name: name.into(),
            message: message.into(),
            status,
        })
    }

    /// Parse a response document.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::Protocol("empty response document".into()));
        }
        let raw: Value = serde_json::from_slice(bytes)?;
        Self::from_value(&raw)
    }

    /// Parse a response from a decoded JSON value.
    pub fn from_value(raw: &Value) -> Result<Self> {
        let obj = raw
            .as_object()
            .ok_or_else(|| Error::Protocol("response is not a JSON object".into()))?;

        match (obj.get("result"), obj.get("error")) {
            (Some(_), Some(_)) => Err(Error::Protocol(
                "response carries both result and error".into(),
            )),
            (None, None) => Err(Error::Protocol(
                "response carries neither result nor error".into(),
            )),
            (Some(value), None) => {
                // Tolerant reader: a malformed profile is dropped, not fatal.
                let profile = obj
                    .get("profile")
                    .and_then(|p| serde_json::from_value(p.clone()).ok());
                Ok(Self::Result {
                    value: value.clone(),
                    profile,
                })
            }
            (None, Some(err)) => {
                let err: WireError = serde_json::from_value(err.clone())
                    .map_err(|e| Error::Protocol(format!("malformed error payload: {e}")))?;
                Ok(Self::Error(err))
            }
        }
    }

    /// Serialize to a wire document.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let value = match self {
            Self::Result { value, profile } => match profile {
                Some(profile) => serde_json::json!({
                    "result": value,
                    "profile": profile,
                }),
                None => serde_json::json!({ "result": value }),
            },
            Self::Error(err) => serde_json::json!({ "error": err }),
        };
        Ok(serde_json::to_vec(&value)?)
    }
}
