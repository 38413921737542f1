//! Namespace schema collaborator.
//!
//! The connection layer is schema-agnostic: which namespaces exist, which
//! event kinds each declares, how a namespace's event stream is enabled and
//! how raw event frames decode are all supplied through [`Schema`].
//! [`StaticSchema`] is the explicit, statically built table implementation.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::protocol::command::CommandDescriptor;
use crate::protocol::event::{JsonEvent, ProtocolEvent, namespace_of};

// ============================================================================
// Schema Trait
// ============================================================================

/// External protocol schema: namespace declarations and event decoding.
pub trait Schema: Send + Sync {
    /// The concrete event kinds a namespace declares, in declaration order.
    ///
    /// Registering a handler against a namespace expands to exactly these
    /// kinds.
    fn namespace_events(&self, namespace: &str) -> Vec<String>;

    /// The command that enables a namespace's event stream on the peer.
    fn enable_command(&self, namespace: &str) -> CommandDescriptor;

    /// Decodes a raw inbound event frame into a concrete event.
    ///
    /// # Errors
    ///
    /// [`Error::EventDecode`] when the frame is not a recognizable event.
    fn decode_event(&self, raw: &Value) -> Result<Arc<dyn ProtocolEvent>>;
}

// ============================================================================
// StaticSchema
// ============================================================================

/// Schema backed by an explicit namespace → event-kind table.
///
/// Enable commands are `<namespace>.enable` with empty parameters; events
/// decode to [`JsonEvent`]. Frames whose `method` is missing, or names a
/// kind no namespace declares, are rejected.
///
/// ```
/// use cdp_client::StaticSchema;
///
/// let schema = StaticSchema::new()
///     .namespace("network", ["network.requestWillBeSent", "network.loadingFailed"])
///     .namespace("page", ["page.loadEventFired"]);
/// ```
#[derive(Debug, Default)]
pub struct StaticSchema {
    namespaces: FxHashMap<String, Vec<String>>,
}

impl StaticSchema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a namespace with its event kinds, in declaration order.
    #[must_use]
    pub fn namespace<I, S>(mut self, name: impl Into<String>, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces
            .insert(name.into(), events.into_iter().map(Into::into).collect());
        self
    }

    fn declares(&self, kind: &str) -> bool {
        self.namespaces
            .get(namespace_of(kind))
            .is_some_and(|events| events.iter().any(|e| e == kind))
    }
}

impl Schema for StaticSchema {
    fn namespace_events(&self, namespace: &str) -> Vec<String> {
        self.namespaces.get(namespace).cloned().unwrap_or_default()
    }

    fn enable_command(&self, namespace: &str) -> CommandDescriptor {
        CommandDescriptor::new(format!("{namespace}.enable"), json!({}))
    }

    fn decode_event(&self, raw: &Value) -> Result<Arc<dyn ProtocolEvent>> {
        let method = raw
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::event_decode("frame has no 'method' discriminator"))?;
        if !self.declares(method) {
            return Err(Error::event_decode(format!(
                "unknown event kind '{method}'"
            )));
        }
        let params = raw.get("params").cloned().unwrap_or(Value::Null);
        Ok(Arc::new(JsonEvent::new(method, params)))
    }
}

// ============================================================================
// Tests
// ============================================================================
