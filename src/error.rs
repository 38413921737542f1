//! Error types for the CDP client.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use cdp_client::{Result, Error};
//!
//! async fn example(conn: &Connection) -> Result<()> {
//!     conn.send(RawCommand::new("Page.enable", json!({}))).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Peer | [`Error::Protocol`], [`Error::MalformedResponse`] |
//! | Events | [`Error::EventDecode`], [`Error::Handler`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`] |
//! | External | [`Error::WebSocket`], [`Error::Json`], [`Error::Url`] |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::result::Result as StdResult;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Peer Errors
    // ========================================================================
    /// The peer answered a command with an error payload.
    ///
    /// Carries the human-readable message and, when the peer supplied one,
    /// the machine error code.
    #[error(fmt = protocol_fmt)]
    Protocol {
        /// Error message from the peer.
        message: String,
        /// Machine error code, if present in the payload.
        code: Option<i64>,
    },

    /// An ostensibly successful reply is missing an expected key.
    #[error("key '{key}' not found in response payload")]
    MalformedResponse {
        /// The key that was expected.
        key: String,
    },

    // ========================================================================
    // Event Errors
    // ========================================================================
    /// An inbound event payload could not be decoded.
    ///
    /// Never fatal: the listener logs the error and drops the frame.
    #[error("event decode error: {message}")]
    EventDecode {
        /// Description of the decode failure.
        message: String,
    },

    /// An event callback failed.
    ///
    /// Isolated in the listener loop and logged; never surfaced to
    /// protocol logic.
    #[error("event handler failed: {message}")]
    Handler {
        /// Description of the handler failure.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// WebSocket connection could not be established.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// The transport is closed.
    ///
    /// Detected on send or receive; triggers disconnect.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // External Errors
    // ========================================================================
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Endpoint URL parse error.
    #[error("Invalid endpoint URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Renders a protocol error as `"<message> [code: <code>]"` when a code is
/// present, or just the message otherwise.
fn protocol_fmt(message: &String, code: &Option<i64>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match code {
        Some(code) => write!(f, "{message} [code: {code}]"),
        None => write!(f, "{message}"),
    }
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a protocol error without a code.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            code: None,
        }
    }

    /// Creates a protocol error from a peer error payload.
    ///
    /// Three payload shapes are accepted:
    ///
    /// - object with `message` (and optional `code`): taken verbatim
    /// - any other object: rendered as an indented key/value tree
    /// - anything else: parts joined with `" | "`
    #[must_use]
    pub fn protocol_payload(payload: &Value) -> Self {
        match payload {
            Value::Object(map) if map.contains_key("message") => Self::Protocol {
                message: map.get("message").map(value_text).unwrap_or_default(),
                code: map.get("code").and_then(Value::as_i64),
            },
            Value::Object(map) => Self::Protocol {
                message: dump_tree(map, 0),
                code: None,
            },
            Value::Array(parts) => Self::Protocol {
                message: parts.iter().map(value_text).collect::<Vec<_>>().join(" | "),
                code: None,
            },
            other => Self::Protocol {
                message: value_text(other),
                code: None,
            },
        }
    }

    /// Creates a malformed-response error for a missing key.
    #[inline]
    pub fn malformed_response(key: impl Into<String>) -> Self {
        Self::MalformedResponse { key: key.into() }
    }

    /// Creates an event decode error.
    #[inline]
    pub fn event_decode(message: impl Into<String>) -> Self {
        Self::EventDecode {
            message: message.into(),
        }
    }

    /// Creates a handler error.
    #[inline]
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if the peer rejected a command.
    #[inline]
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Protocol { .. } | Self::MalformedResponse { .. })
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionClosed | Self::WebSocket(_)
        )
    }

    /// The peer-supplied error code, if any.
    #[inline]
    #[must_use]
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Protocol { code, .. } => *code,
            _ => None,
        }
    }
}

// ============================================================================
// Payload Rendering
// ============================================================================

/// Text form of a JSON value: strings without quotes, everything else as
/// compact JSON.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Renders an object as an indented key/value tree, one line per entry,
/// nested objects indented one tab deeper.
fn dump_tree(map: &Map<String, Value>, depth: usize) -> String {
    let mut out = String::from("\n");
    let indent = "\t".repeat(depth);
    for (key, value) in map {
        match value {
            Value::Object(inner) => {
                out.push_str(&format!("{indent}{key}: {}\n", dump_tree(inner, depth + 1)));
            }
            other => {
                out.push_str(&format!("{indent}{key}: {}\n", value_text(other)));
            }
        }
    }
    out
}

// ============================================================================
// Tests
// ============================================================================
