//! Pending request bookkeeping: transactions, completion slots and the
//! correlation table.
//!
//! A [`Transaction`] represents one outstanding command. Its completion slot
//! settles at most once; redundant resolve/reject attempts are silently
//! discarded, which tolerates completion races by construction.

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::protocol::request::Reply;

// ============================================================================
// CompletionSlot
// ============================================================================

/// Exactly-once completion slot.
///
/// Wraps the sending half of a oneshot channel; the first resolve or reject
/// consumes it, later attempts are no-ops.
#[derive(Debug)]
pub(crate) struct CompletionSlot {
    sender: Option<oneshot::Sender<Result<Value>>>,
}

impl CompletionSlot {
    /// Creates a slot and the receiver the caller awaits.
    pub(crate) fn new() -> (Self, oneshot::Receiver<Result<Value>>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// Resolves the slot with a raw result value. No-op if already settled.
    pub(crate) fn resolve(&mut self, value: Value) {
        if let Some(sender) = self.sender.take() {
            // the caller may have gone away; that is not our problem
            let _ = sender.send(Ok(value));
        }
    }

    /// Rejects the slot with an error. No-op if already settled.
    pub(crate) fn reject(&mut self, error: Error) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Err(error));
        }
    }

    /// Returns `true` once the slot has been resolved or rejected.
    #[cfg(test)]
    pub(crate) fn is_settled(&self) -> bool {
        self.sender.is_none()
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// One pending request awaiting its correlated reply.
#[derive(Debug)]
pub(crate) struct Transaction {
    method: String,
    slot: CompletionSlot,
}

impl Transaction {
    /// Creates a transaction and the receiver for its eventual outcome.
    pub(crate) fn new(method: impl Into<String>) -> (Self, oneshot::Receiver<Result<Value>>) {
        let (slot, receiver) = CompletionSlot::new();
        (
            Self {
                method: method.into(),
                slot,
            },
            receiver,
        )
    }

    /// The method name this transaction was sent for.
    pub(crate) fn method(&self) -> &str {
        &self.method
    }

    /// Completes the transaction from a correlated reply frame.
    ///
    /// An error payload rejects with the rendered protocol error; a result
    /// payload resolves with the raw value; a reply carrying neither rejects
    /// as malformed.
    pub(crate) fn complete(mut self, reply: Reply) {
        match reply.into_result() {
            Ok(value) => self.slot.resolve(value),
            Err(error) => self.slot.reject(error),
        }
    }

    #[cfg(test)]
    pub(crate) fn slot_mut(&mut self) -> &mut CompletionSlot {
        &mut self.slot
    }
}

// ============================================================================
// PendingTable
// ============================================================================

/// The pending-request table: monotonic id counter plus id → transaction map.
///
/// Ids are strictly increasing and never reused within a connection's
/// lifetime; every id present maps to exactly one unresolved transaction.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    next_id: u64,
    entries: FxHashMap<u64, Transaction>,
}

impl PendingTable {
    /// Inserts a transaction, assigning and returning the next id.
    pub(crate) fn insert(&mut self, transaction: Transaction) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, transaction);
        id
    }

    /// Pops the transaction for a correlated reply, if any.
    pub(crate) fn remove(&mut self, id: u64) -> Option<Transaction> {
        self.entries.remove(&id)
    }

    /// Number of unresolved transactions.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
