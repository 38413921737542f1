//! Wire frame shaping: outbound requests and inbound frame classification.
//!
//! One JSON object per WebSocket text frame:
//!
//! | Frame | Shape |
//! |-------|-------|
//! | Outbound command | `{"method": ..., "params": ..., "id": ...}` |
//! | Inbound success | `{"id": ..., "result": ...}` |
//! | Inbound error | `{"id": ..., "error": {"message": ..., "code": ...}}` |
//! | Inbound event | no `id`; carries a `method` discriminator |

// ============================================================================
// Imports
// ============================================================================

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::protocol::command::CommandDescriptor;

// ============================================================================
// Request
// ============================================================================

/// An outbound command frame.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    /// Qualified method name.
    pub method: Cow<'static, str>,

    /// Parameter payload.
    pub params: Value,

    /// Correlation id, strictly increasing per connection.
    pub id: u64,
}

impl Request {
    /// Creates a request from a descriptor and an assigned correlation id.
    #[inline]
    #[must_use]
    pub fn new(descriptor: &CommandDescriptor, id: u64) -> Self {
        Self {
            method: descriptor.method.clone(),
            params: descriptor.params.clone(),
            id,
        }
    }

    /// Serializes the request to its wire form.
    pub fn to_message(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Reply
// ============================================================================

/// A correlated reply frame.
#[derive(Debug, Clone, Deserialize)]
pub struct Reply {
    /// Matches the command `id`.
    pub id: u64,

    /// Result payload (if success).
    #[serde(default)]
    pub result: Option<Value>,

    /// Error payload (if error).
    #[serde(default)]
    pub error: Option<Value>,
}

impl Reply {
    /// Applies the completion rules: an error payload rejects, a result
    /// payload resolves, neither is a malformed response.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] when the peer answered with an error payload;
    /// [`Error::MalformedResponse`] when both `error` and `result` are
    /// absent.
    pub fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(Error::protocol_payload(&error));
        }
        match self.result {
            Some(result) => Ok(result),
            None => Err(Error::malformed_response("result")),
        }
    }
}

// ============================================================================
// InboundFrame
// ============================================================================

/// Classification of one inbound frame.
///
/// Frames carrying a correlation `id` are replies; everything else is an
/// event notification, left raw for the schema's event decoder.
#[derive(Debug)]
pub enum InboundFrame {
    /// A correlated reply.
    Reply(Reply),
    /// A raw event notification.
    Event(Value),
}

impl InboundFrame {
    /// Parses and classifies a frame.
    ///
    /// # Errors
    ///
    /// [`Error::Json`] when the frame is not valid JSON, or when a frame
    /// carrying an `id` does not deserialize as a reply.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("id").is_some() {
            let reply: Reply = serde_json::from_value(value)?;
            Ok(Self::Reply(reply))
        } else {
            Ok(Self::Event(value))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
