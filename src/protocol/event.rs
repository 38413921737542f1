//! Event notifications.
//!
//! Events are unsolicited frames from the peer, carrying no correlation id.
//! Decoding is delegated to the schema collaborator; the connection layer
//! only needs the concrete event's kind to route it to registered handlers.

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;

use serde_json::Value;

// ============================================================================
// ProtocolEvent
// ============================================================================

/// A decoded concrete event.
///
/// `kind` is the qualified `namespace.eventName` discriminator, e.g.
/// `network.requestWillBeSent`. Handlers receiving `Arc<dyn ProtocolEvent>`
/// can recover the concrete type through [`ProtocolEvent::as_any`].
pub trait ProtocolEvent: Any + fmt::Debug + Send + Sync {
    /// Qualified event name.
    fn kind(&self) -> &str;

    /// Upcast for downcasting to the concrete event type.
    fn as_any(&self) -> &dyn Any;
}

/// The namespace prefix of a qualified event kind.
#[inline]
#[must_use]
pub fn namespace_of(kind: &str) -> &str {
    kind.split('.').next().unwrap_or_default()
}

// ============================================================================
// JsonEvent
// ============================================================================

/// A generic event carrying its raw parameter payload.
///
/// Schema implementations without generated event structs (notably
/// [`StaticSchema`](crate::protocol::schema::StaticSchema)) decode every
/// event to this type.
#[derive(Debug, Clone)]
pub struct JsonEvent {
    /// Qualified event name.
    pub method: String,
    /// Event parameters.
    pub params: Value,
}

impl JsonEvent {
    /// Creates a new raw event.
    #[inline]
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

impl ProtocolEvent for JsonEvent {
    fn kind(&self) -> &str {
        &self.method
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
