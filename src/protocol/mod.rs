//! Protocol message types and schema collaborators.
//!
//! One JSON object per WebSocket frame. Commands and events use
//! `namespace.name` qualified names.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `command` | Two-step command codec: descriptor + response decode |
//! | `request` | Outbound frames and inbound frame classification |
//! | `event` | Decoded event trait and the generic raw event |
//! | `schema` | Namespace schema collaborator and static table |

// ============================================================================
// Submodules
// ============================================================================

/// Command descriptors and the two-step command codec.
pub mod command;

/// Event notification types.
pub mod event;

/// Wire frame shaping.
pub mod request;

/// Namespace schema collaborator.
pub mod schema;

// ============================================================================
// Re-exports
// ============================================================================

pub use command::{Command, CommandDescriptor, RawCommand, expect_key};
pub use event::{JsonEvent, ProtocolEvent, namespace_of};
pub use request::{InboundFrame, Reply, Request};
pub use schema::{Schema, StaticSchema};
