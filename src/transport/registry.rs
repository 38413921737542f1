//! Handler registry and namespace subscription bookkeeping.
//!
//! Maps concrete event kinds to ordered callback lists and tracks which
//! namespaces are currently subscribed on the peer. Guarded by a plain
//! `parking_lot` mutex (not a cooperative one) so registration remains
//! callable from non-async call sites.
//!
//! The reconciliation primitives here only mutate local bookkeeping; the
//! connection drives the actual enable commands (see
//! [`transport::connection`](crate::transport::connection)).

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::warn;

use crate::error::Result;
use crate::protocol::event::{ProtocolEvent, namespace_of};
use crate::protocol::schema::Schema;

// ============================================================================
// SessionRef
// ============================================================================

/// Opaque reference to the session owning a connection.
///
/// Passed to every callback invocation alongside the event. The connection
/// layer attaches no behavior to it; callers that need the concrete type
/// back use [`SessionRef::downcast`].
#[derive(Clone, Default)]
pub struct SessionRef(Option<Arc<dyn Any + Send + Sync>>);

impl SessionRef {
    /// Wraps an owning-session value.
    #[must_use]
    pub fn new<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self(Some(value))
    }

    /// An absent session reference.
    #[inline]
    #[must_use]
    pub fn none() -> Self {
        Self(None)
    }

    /// Returns `true` if no session reference was attached.
    #[inline]
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    /// Recovers the concrete session type, if it matches.
    #[must_use]
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.0.clone()?.downcast().ok()
    }
}

impl fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_some() {
            f.write_str("SessionRef(set)")
        } else {
            f.write_str("SessionRef(none)")
        }
    }
}

// ============================================================================
// EventHandler
// ============================================================================

type SyncFn = dyn Fn(Arc<dyn ProtocolEvent>, SessionRef) -> Result<()> + Send + Sync;
type AsyncFn = dyn Fn(Arc<dyn ProtocolEvent>, SessionRef) -> BoxFuture<'static, Result<()>>
    + Send
    + Sync;

/// An event callback with the fixed signature `(event, session)`.
///
/// One-argument callbacks are adapted here, at construction, rather than
/// probed at call time. Failures are isolated: a sync error is logged, an
/// async handler runs as its own spawned task whose outcome is logged by a
/// completion hook. Neither stops delivery to other callbacks nor the
/// listener loop.
pub enum EventHandler {
    /// Runs inline on the listener loop.
    Sync(Box<SyncFn>),
    /// Spawned as an independent task per invocation.
    Async(Box<AsyncFn>),
}

impl EventHandler {
    /// Synchronous callback receiving the event and the session reference.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Arc<dyn ProtocolEvent>, SessionRef) -> Result<()> + Send + Sync + 'static,
    {
        Self::Sync(Box::new(f))
    }

    /// Synchronous callback receiving only the event.
    pub fn sync_event<F>(f: F) -> Self
    where
        F: Fn(Arc<dyn ProtocolEvent>) -> Result<()> + Send + Sync + 'static,
    {
        Self::Sync(Box::new(move |event, _session| f(event)))
    }

    /// Asynchronous callback receiving the event and the session reference.
    pub fn async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<dyn ProtocolEvent>, SessionRef) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::Async(Box::new(move |event, session| Box::pin(f(event, session))))
    }

    /// Asynchronous callback receiving only the event.
    pub fn async_event<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<dyn ProtocolEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::Async(Box::new(move |event, _session| Box::pin(f(event))))
    }

    /// Invokes the callback for one event.
    ///
    /// Must run inside a tokio runtime (async handlers are spawned).
    pub(crate) fn invoke(&self, event: Arc<dyn ProtocolEvent>, session: SessionRef) {
        match self {
            Self::Sync(f) => {
                let kind = event.kind().to_owned();
                if let Err(error) = f(event, session) {
                    warn!(kind = %kind, error = %error, "event handler failed");
                }
            }
            Self::Async(f) => {
                let kind = event.kind().to_owned();
                let future = f(event, session);
                tokio::spawn(async move {
                    // completion hook: capture and log, never propagate
                    if let Err(error) = future.await {
                        warn!(kind = %kind, error = %error, "async event handler failed");
                    }
                });
            }
        }
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("EventHandler::Sync"),
            Self::Async(_) => f.write_str("EventHandler::Async"),
        }
    }
}

// ============================================================================
// HandlerId
// ============================================================================

/// Key identifying one registered callback.
///
/// Returned by registration; passing it to
/// [`remove_handler`](HandlerRegistry::remove_handler) removes the callback
/// wherever it was attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

// ============================================================================
// Target
// ============================================================================

/// What a callback is registered against.
#[derive(Debug, Clone)]
pub enum Target {
    /// One concrete event kind, e.g. `network.loadingFailed`.
    Event(String),
    /// Every event kind a namespace declares (expanded via the schema).
    Namespace(String),
    /// A set of targets.
    Many(Vec<Target>),
}

impl Target {
    /// Target for one concrete event kind.
    #[inline]
    #[must_use]
    pub fn event(kind: impl Into<String>) -> Self {
        Self::Event(kind.into())
    }

    /// Target for an entire namespace.
    #[inline]
    #[must_use]
    pub fn namespace(name: impl Into<String>) -> Self {
        Self::Namespace(name.into())
    }
}

// ============================================================================
// HandlerRegistry
// ============================================================================

/// Event-kind → callback lists plus the subscribed-namespace set.
///
/// Insertion order of callbacks is invocation order. Always-on namespaces
/// are permanent members of the subscribed set and are never enabled
/// explicitly nor removed.
pub(crate) struct HandlerRegistry {
    schema: Arc<dyn Schema>,
    handlers: FxHashMap<String, Vec<(HandlerId, Arc<EventHandler>)>>,
    subscribed: FxHashSet<String>,
    always_on: Vec<String>,
    next_id: u64,
}

impl HandlerRegistry {
    pub(crate) fn new(schema: Arc<dyn Schema>, always_on: Vec<String>) -> Self {
        let subscribed = always_on.iter().cloned().collect();
        Self {
            schema,
            handlers: FxHashMap::default(),
            subscribed,
            always_on,
            next_id: 0,
        }
    }

    /// Appends a callback to every event kind the target resolves to.
    pub(crate) fn register(&mut self, target: &Target, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;

        let handler = Arc::new(handler);
        let mut kinds = Vec::new();
        self.resolve(target, &mut kinds);
        for kind in kinds {
            self.handlers
                .entry(kind)
                .or_default()
                .push((id, Arc::clone(&handler)));
        }
        id
    }

    /// Removes the whole callback list of every kind the target resolves to.
    pub(crate) fn unregister(&mut self, target: &Target) {
        let mut kinds = Vec::new();
        self.resolve(target, &mut kinds);
        for kind in kinds {
            self.handlers.remove(&kind);
        }
    }

    /// Removes one callback wherever it is attached.
    pub(crate) fn remove_handler(&mut self, id: HandlerId) {
        for callbacks in self.handlers.values_mut() {
            callbacks.retain(|(handler_id, _)| *handler_id != id);
        }
    }

    /// Callback list for one event kind, in registration order.
    pub(crate) fn snapshot(&self, kind: &str) -> Vec<Arc<EventHandler>> {
        self.handlers
            .get(kind)
            .map(|callbacks| callbacks.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// The namespaces implied by kinds with at least one callback.
    ///
    /// Prunes kinds whose callback list has become empty.
    pub(crate) fn implied_namespaces(&mut self) -> FxHashSet<String> {
        self.handlers.retain(|_, callbacks| !callbacks.is_empty());
        self.handlers
            .keys()
            .map(|kind| namespace_of(kind).to_owned())
            .collect()
    }

    /// Tentatively marks newly implied namespaces as subscribed and returns
    /// them, sorted, for the caller to enable on the peer.
    ///
    /// Membership check is idempotent: a namespace already subscribed (or
    /// always-on) is never returned, so concurrent passes cannot
    /// double-subscribe.
    pub(crate) fn begin_subscriptions(&mut self, implied: &FxHashSet<String>) -> Vec<String> {
        let mut pending: Vec<String> = implied
            .iter()
            .filter(|ns| !self.subscribed.contains(*ns))
            .cloned()
            .collect();
        pending.sort();
        for namespace in &pending {
            self.subscribed.insert(namespace.clone());
        }
        pending
    }

    /// Rolls back a tentative subscription whose enable command failed.
    ///
    /// A namespace already removed by a concurrent pass is a benign no-op.
    pub(crate) fn rollback_subscription(&mut self, namespace: &str) {
        self.subscribed.remove(namespace);
    }

    /// Drops subscriptions no longer implied by any callback.
    ///
    /// No disable command is sent for these; local disinterest suffices.
    /// Always-on namespaces are kept unconditionally.
    pub(crate) fn prune_subscriptions(&mut self, implied: &FxHashSet<String>) {
        let always_on = &self.always_on;
        self.subscribed
            .retain(|ns| implied.contains(ns) || always_on.iter().any(|a| a == ns));
    }

    /// Resets the subscribed set to exactly the always-on namespaces.
    pub(crate) fn reset_subscriptions(&mut self) {
        self.subscribed = self.always_on.iter().cloned().collect();
    }

    /// Sorted snapshot of the subscribed-namespace set.
    pub(crate) fn subscribed(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self.subscribed.iter().cloned().collect();
        namespaces.sort();
        namespaces
    }

    fn resolve(&self, target: &Target, out: &mut Vec<String>) {
        match target {
            Target::Event(kind) => out.push(kind.clone()),
            Target::Namespace(name) => out.extend(self.schema.namespace_events(name)),
            Target::Many(targets) => {
                for target in targets {
                    self.resolve(target, out);
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use crate::protocol::event::JsonEvent;
    use crate::protocol::schema::StaticSchema;

    fn registry() -> HandlerRegistry {
        let schema = Arc::new(
            StaticSchema::new()
                .namespace(
                    "network",
                    [
                        "network.requestWillBeSent",
                        "network.responseReceived",
                        "network.loadingFailed",
                    ],
                )
                .namespace("page", ["page.loadEventFired"]),
        );
        HandlerRegistry::new(schema, vec!["target".into(), "storage".into()])
    }

    fn noop() -> EventHandler {
        EventHandler::sync(|_, _| Ok(()))
    }

    #[test]
    fn test_namespace_registration_expands() {
        let mut reg = registry();
        reg.register(&Target::namespace("network"), noop());

        assert_eq!(reg.snapshot("network.requestWillBeSent").len(), 1);
        assert_eq!(reg.snapshot("network.responseReceived").len(), 1);
        assert_eq!(reg.snapshot("network.loadingFailed").len(), 1);
        assert!(reg.snapshot("page.loadEventFired").is_empty());
    }

    #[test]
    fn test_registration_order_preserved() {
        let mut reg = registry();
        let first = reg.register(&Target::event("page.loadEventFired"), noop());
        let second = reg.register(&Target::event("page.loadEventFired"), noop());

        let kinds = reg.handlers.get("page.loadEventFired").expect("entry");
        assert_eq!(kinds[0].0, first);
        assert_eq!(kinds[1].0, second);
    }

    #[test]
    fn test_remove_handler_everywhere() {
        let mut reg = registry();
        let id = reg.register(&Target::namespace("network"), noop());
        reg.register(&Target::event("network.loadingFailed"), noop());

        reg.remove_handler(id);
        assert!(reg.snapshot("network.requestWillBeSent").is_empty());
        assert_eq!(reg.snapshot("network.loadingFailed").len(), 1);
    }

    #[test]
    fn test_unregister_drops_entries() {
        let mut reg = registry();
        reg.register(&Target::namespace("network"), noop());
        reg.register(&Target::event("page.loadEventFired"), noop());

        reg.unregister(&Target::namespace("network"));
        assert!(reg.snapshot("network.requestWillBeSent").is_empty());
        assert_eq!(reg.snapshot("page.loadEventFired").len(), 1);
    }

    #[test]
    fn test_implied_namespaces_prune_empty() {
        let mut reg = registry();
        let id = reg.register(&Target::event("network.loadingFailed"), noop());
        reg.register(&Target::event("page.loadEventFired"), noop());
        reg.remove_handler(id);

        let implied = reg.implied_namespaces();
        assert!(implied.contains("page"));
        assert!(!implied.contains("network"));
        assert!(!reg.handlers.contains_key("network.loadingFailed"));
    }

    #[test]
    fn test_subscription_lifecycle() {
        let mut reg = registry();
        reg.register(&Target::namespace("network"), noop());

        let implied = reg.implied_namespaces();
        let pending = reg.begin_subscriptions(&implied);
        assert_eq!(pending, vec!["network"]);
        // a second pass is idempotent
        assert!(reg.begin_subscriptions(&implied).is_empty());
        assert_eq!(reg.subscribed(), vec!["network", "storage", "target"]);

        reg.unregister(&Target::namespace("network"));
        let implied = reg.implied_namespaces();
        reg.prune_subscriptions(&implied);
        assert_eq!(reg.subscribed(), vec!["storage", "target"]);
    }

    #[test]
    fn test_always_on_never_enabled_never_removed() {
        let mut reg = registry();
        let implied = reg.implied_namespaces();
        assert!(reg.begin_subscriptions(&implied).is_empty());
        reg.prune_subscriptions(&implied);
        assert_eq!(reg.subscribed(), vec!["storage", "target"]);

        reg.reset_subscriptions();
        assert_eq!(reg.subscribed(), vec!["storage", "target"]);
    }

    #[test]
    fn test_rollback_subscription() {
        let mut reg = registry();
        reg.register(&Target::event("network.loadingFailed"), noop());
        let implied = reg.implied_namespaces();
        let pending = reg.begin_subscriptions(&implied);
        assert_eq!(pending, vec!["network"]);

        reg.rollback_subscription("network");
        // removing twice is a benign no-op
        reg.rollback_subscription("network");
        assert_eq!(reg.subscribed(), vec!["storage", "target"]);
    }

    #[tokio::test]
    async fn test_sync_handler_failure_is_contained() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let failing = EventHandler::sync(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(crate::error::Error::handler("deliberate"))
        });

        let event: Arc<dyn ProtocolEvent> =
            Arc::new(JsonEvent::new("page.loadEventFired", json!({})));
        failing.invoke(Arc::clone(&event), SessionRef::none());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_async_handler_runs_and_sees_session() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let handler = EventHandler::async_fn(move |_, session: SessionRef| {
            let seen = Arc::clone(&seen);
            async move {
                if session.downcast::<String>().is_some() {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }
        });

        let event: Arc<dyn ProtocolEvent> =
            Arc::new(JsonEvent::new("page.loadEventFired", json!({})));
        let session = SessionRef::new(Arc::new(String::from("owner")));
        handler.invoke(event, session);

        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
