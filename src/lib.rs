//! Async connection layer for Chrome-DevTools-style JSON protocols.
//!
//! One persistent WebSocket to one peer; many independent logical callers
//! issue commands concurrently on the same connection. Each command gets
//! exactly one correlated reply, while the peer also emits unsolicited
//! events routed to dynamically registered listeners. Per-namespace event
//! subscriptions are enabled on the peer automatically, based on which
//! listeners currently exist.
//!
//! # Architecture
//!
//! - **Transaction**: one pending request with an exactly-once completion
//!   slot, correlated by a strictly increasing id.
//! - **Handler registry**: event kind → ordered callback list, plus the
//!   subscribed-namespace set.
//! - **Reconciliation pass**: runs before each outward command; enables
//!   newly needed namespaces and drops bookkeeping for unneeded ones.
//! - **Listener loop**: the sole reader of the transport; routes replies to
//!   transactions and events to callbacks.
//! - **Connection**: owns the transport, the pending table and the registry,
//!   and orchestrates connect/disconnect.
//!
//! The command/event *schema* is external: implement [`Schema`] (or use
//! [`StaticSchema`]) and typed commands via [`Command`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use cdp_client::{Connection, EventHandler, RawCommand, Result, StaticSchema, Target};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let schema = Arc::new(
//!         StaticSchema::new().namespace("page", ["page.loadEventFired"]),
//!     );
//!     let conn = Connection::builder("ws://127.0.0.1:9222/devtools/page/1", schema).build()?;
//!
//!     conn.register(
//!         Target::namespace("page"),
//!         EventHandler::sync_event(|event| {
//!             println!("event: {}", event.kind());
//!             Ok(())
//!         }),
//!     );
//!
//!     let result = conn
//!         .send(RawCommand::new("page.navigate", json!({"url": "https://example.com"})))
//!         .await?;
//!     println!("navigated: {result}");
//!
//!     conn.disconnect().await
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`error`] | Error types and [`Result`] alias |
//! | [`protocol`] | Frame shaping, command codec, schema collaborators |
//! | [`transport`] | Connection, listener loop, handler registry |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Protocol message types and schema collaborators.
pub mod protocol;

/// WebSocket transport layer.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Error types
pub use error::{Error, Result};

// Protocol types
pub use protocol::{
    Command, CommandDescriptor, InboundFrame, JsonEvent, ProtocolEvent, RawCommand, Reply,
    Request, Schema, StaticSchema, expect_key, namespace_of,
};

// Transport types
pub use transport::{
    Connection, ConnectionBuilder, ConnectionConfig, EventHandler, HandlerId, SessionRef, Target,
};
