//! Command descriptors and the two-step command codec.
//!
//! A protocol command is encoded in two steps:
//!
//! 1. [`Command::descriptor`] yields the outbound [`CommandDescriptor`]
//!    (method name plus parameter payload), produced once per send.
//! 2. [`Command::decode`] is a pure function from the raw `result` object of
//!    the correlated reply to the typed response value. A missing expected
//!    key surfaces as [`Error::MalformedResponse`].

// ============================================================================
// Imports
// ============================================================================

use std::borrow::Cow;

use serde_json::Value;

use crate::error::{Error, Result};

// ============================================================================
// CommandDescriptor
// ============================================================================

/// Outbound form of a command: qualified method name plus parameters.
///
/// Method names use the `namespace.methodName` format, e.g.
/// `network.enable` or `page.navigate`.
#[derive(Debug, Clone)]
pub struct CommandDescriptor {
    /// Qualified method name.
    pub method: Cow<'static, str>,
    /// Parameter payload (a JSON object).
    pub params: Value,
}

impl CommandDescriptor {
    /// Creates a new descriptor.
    #[inline]
    #[must_use]
    pub fn new(method: impl Into<Cow<'static, str>>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// The namespace prefix of the method name.
    #[inline]
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.method.split('.').next().unwrap_or_default()
    }
}

// ============================================================================
// Command Trait
// ============================================================================

/// A typed protocol command.
///
/// Implementors supply the outbound descriptor and the decoding of the raw
/// reply `result` into [`Command::Response`]. Schema crates generate one
/// implementor per protocol method; [`RawCommand`] covers ad-hoc use.
pub trait Command: Send {
    /// Decoded response type.
    type Response: Send + 'static;

    /// Builds the outbound descriptor. Called once per send.
    fn descriptor(&self) -> Result<CommandDescriptor>;

    /// Decodes the raw `result` object of a successful reply.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedResponse`] when an expected key is absent.
    fn decode(raw: Value) -> Result<Self::Response>;
}

// ============================================================================
// RawCommand
// ============================================================================

/// An untyped command passing raw JSON in both directions.
///
/// Used for ad-hoc protocol calls and internally for namespace enable
/// commands produced by the schema.
#[derive(Debug, Clone)]
pub struct RawCommand {
    descriptor: CommandDescriptor,
}

impl RawCommand {
    /// Creates a raw command from method name and parameters.
    #[inline]
    #[must_use]
    pub fn new(method: impl Into<Cow<'static, str>>, params: Value) -> Self {
        Self {
            descriptor: CommandDescriptor::new(method, params),
        }
    }
}

impl From<CommandDescriptor> for RawCommand {
    fn from(descriptor: CommandDescriptor) -> Self {
        Self { descriptor }
    }
}

impl Command for RawCommand {
    type Response = Value;

    fn descriptor(&self) -> Result<CommandDescriptor> {
        Ok(self.descriptor.clone())
    }

    fn decode(raw: Value) -> Result<Self::Response> {
        Ok(raw)
    }
}

// ============================================================================
// Decode Helpers
// ============================================================================

/// Extracts a required key from a reply `result` object.
///
/// # Errors
///
/// [`Error::MalformedResponse`] when the key is absent.
pub fn expect_key(value: &Value, key: &str) -> Result<Value> {
    value
        .get(key)
        .cloned()
        .ok_or_else(|| Error::malformed_response(key))
}

// ============================================================================
// Tests
// ============================================================================
