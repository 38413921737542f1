//! WebSocket transport layer.
//!
//! One persistent duplex connection to one peer, shared by many concurrent
//! logical callers.
//!
//! # Architecture
//!
//! ```text
//! callers ──► Connection::send ──► pending table ──► WebSocket ──► peer
//!                                      ▲                │
//!                                      │                ▼
//!                               listener task ◄── replies + events
//!                                      │
//!                                      ▼
//!                              handler registry
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Connection lifecycle, send path, listener loop |
//! | `registry` | Event handler registry and subscription bookkeeping |
//! | `transaction` | Pending requests and correlation table |

// ============================================================================
// Submodules
// ============================================================================

/// Connection lifecycle, send path and listener loop.
pub mod connection;

/// Handler registry and namespace subscription bookkeeping.
pub mod registry;

/// Pending request bookkeeping.
pub(crate) mod transaction;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{
    Connection, ConnectionBuilder, ConnectionConfig, DEFAULT_KEEPALIVE, DEFAULT_MAX_FRAME_SIZE,
};
pub use registry::{EventHandler, HandlerId, SessionRef, Target};
