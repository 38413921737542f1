//! WebSocket connection, listener loop and subscription reconciliation.
//!
//! One [`Connection`] owns one persistent WebSocket to one peer. Many
//! logical callers send commands concurrently; each gets exactly the reply
//! correlated to its own id. The peer additionally emits unsolicited events
//! which are routed to registered handlers.
//!
//! # Structure
//!
//! - The WebSocket is split on connect: the sink is shared behind an async
//!   mutex (any caller may transmit), the stream is owned by exactly one
//!   spawned listener task, which is therefore the sole reader.
//! - The pending-request table and its monotonic id counter live behind
//!   their own lock; requests are transmitted outside that lock so slow I/O
//!   never blocks table operations.
//! - Before each outward command (except fire-and-forget updates) a
//!   reconciliation pass aligns the peer's per-namespace event subscriptions
//!   with the currently registered handlers.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::command::{Command, CommandDescriptor};
use crate::protocol::request::{InboundFrame, Request};
use crate::protocol::schema::Schema;
use crate::transport::registry::{EventHandler, HandlerId, HandlerRegistry, SessionRef, Target};
use crate::transport::transaction::{PendingTable, Transaction};

// ============================================================================
// Constants
// ============================================================================

/// Default keepalive: idle time on the read side before probing with a Ping.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(900);

/// Default maximum inbound frame/message size (256 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 28;

/// Namespaces subscribed for the connection's whole lifetime by default.
const DEFAULT_ALWAYS_ON: [&str; 2] = ["target", "storage"];

// ============================================================================
// Types
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

// ============================================================================
// ConnectionConfig
// ============================================================================

/// Fixed transport parameters, set at construction.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Idle-read duration after which the listener sends a Ping.
    pub keepalive: Duration,

    /// Maximum inbound frame/message size in bytes.
    pub max_frame_size: usize,

    /// Namespaces that are permanent members of the subscribed set.
    ///
    /// Baseline signals depend on these; the reconciliation pass never
    /// enables them explicitly and never drops them.
    pub always_on_namespaces: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive: DEFAULT_KEEPALIVE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            always_on_namespaces: DEFAULT_ALWAYS_ON.iter().map(ToString::to_string).collect(),
        }
    }
}

// ============================================================================
// ConnectionBuilder
// ============================================================================

/// Builder for [`Connection`].
///
/// ```no_run
/// use std::sync::Arc;
/// use cdp_client::{Connection, StaticSchema};
///
/// # fn demo() -> cdp_client::Result<()> {
/// let schema = Arc::new(StaticSchema::new());
/// let conn = Connection::builder("ws://127.0.0.1:9222/devtools/page/1", schema).build()?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionBuilder {
    endpoint: String,
    schema: Arc<dyn Schema>,
    config: ConnectionConfig,
    session: SessionRef,
}

impl ConnectionBuilder {
    fn new(endpoint: impl Into<String>, schema: Arc<dyn Schema>) -> Self {
        Self {
            endpoint: endpoint.into(),
            schema,
            config: ConnectionConfig::default(),
            session: SessionRef::none(),
        }
    }

    /// Overrides the transport configuration.
    #[must_use]
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Attaches the owning-session reference handed to event callbacks.
    #[must_use]
    pub fn session_ref(mut self, session: SessionRef) -> Self {
        self.session = session;
        self
    }

    /// Builds the connection. The transport is established lazily on first
    /// use or explicit [`Connection::connect`].
    ///
    /// # Errors
    ///
    /// [`Error::Url`] if the endpoint is not a valid URL.
    pub fn build(self) -> Result<Connection> {
        let url = Url::parse(&self.endpoint)?;
        Ok(Connection::assemble(url, self.schema, self.config, self.session))
    }
}

// ============================================================================
// Transport
// ============================================================================

/// The write half of a live WebSocket plus its closed flag.
///
/// The read half is owned exclusively by the listener task and never appears
/// here; reads need no lock because no other task ever reads.
struct Transport {
    sink: AsyncMutex<WsSink>,
    closed: AtomicBool,
}

impl Transport {
    fn new(sink: WsSink) -> Self {
        Self {
            sink: AsyncMutex::new(sink),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    async fn send_text(&self, text: String) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.into())).await.map_err(|error| {
            self.mark_closed();
            Error::WebSocket(error)
        })
    }

    async fn send_ping(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Ping(Bytes::new()))
            .await
            .map_err(|error| {
                self.mark_closed();
                Error::WebSocket(error)
            })
    }

    async fn close(&self) {
        self.mark_closed();
        let _ = self.sink.lock().await.close().await;
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Live-transport state, serialized by the connection-state lock.
#[derive(Default)]
struct ConnState {
    transport: Option<Arc<Transport>>,
    listener: Option<JoinHandle<()>>,
}

impl ConnState {
    fn is_live(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| !t.is_closed())
    }
}

struct Inner {
    url: Url,
    config: ConnectionConfig,
    schema: Arc<dyn Schema>,
    session: SessionRef,
    /// Serializes connect/disconnect.
    state: AsyncMutex<ConnState>,
    /// Serializes pending-table mutation and id assignment.
    pending: AsyncMutex<PendingTable>,
    /// Plain mutex: registration must work from non-async call sites.
    registry: Mutex<HandlerRegistry>,
}

/// A connection to one protocol peer.
///
/// Cloning yields another handle to the same connection; all operations are
/// usable from any task.
///
/// # Thread Safety
///
/// `Connection` is `Send + Sync`. The pending table and id counter are only
/// touched under the pending-table lock; the handler registry only under the
/// registry lock; transport establishment and teardown only under the
/// connection-state lock.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Creates a connection with default configuration and no session
    /// reference. The transport is established lazily.
    #[must_use]
    pub fn new(url: Url, schema: Arc<dyn Schema>) -> Self {
        Self::assemble(url, schema, ConnectionConfig::default(), SessionRef::none())
    }

    /// Starts building a connection from an endpoint string.
    pub fn builder(endpoint: impl Into<String>, schema: Arc<dyn Schema>) -> ConnectionBuilder {
        ConnectionBuilder::new(endpoint, schema)
    }

    fn assemble(
        url: Url,
        schema: Arc<dyn Schema>,
        config: ConnectionConfig,
        session: SessionRef,
    ) -> Self {
        let registry = HandlerRegistry::new(
            Arc::clone(&schema),
            config.always_on_namespaces.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                url,
                config,
                schema,
                session,
                state: AsyncMutex::new(ConnState::default()),
                pending: AsyncMutex::new(PendingTable::default()),
                registry: Mutex::new(registry),
            }),
        }
    }

    /// The peer endpoint.
    #[inline]
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.inner.url
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Opens the WebSocket if no live transport exists.
    ///
    /// Idempotent and serialized by the connection-state lock: concurrent
    /// callers race on the lock and the loser observes an already-live
    /// transport. On a fresh transport, exactly one listener task is started
    /// and the reconciliation pass runs so previously registered handlers
    /// regain their server-side subscriptions.
    ///
    /// # Errors
    ///
    /// [`Error::Connection`] if the WebSocket handshake fails.
    pub async fn connect(&self) -> Result<()> {
        let established = {
            let mut state = self.inner.state.lock().await;
            if state.is_live() {
                false
            } else {
                self.establish(&mut state).await?;
                true
            }
        };
        if established {
            self.reconcile().await;
        }
        Ok(())
    }

    async fn establish(&self, state: &mut ConnState) -> Result<()> {
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(self.inner.config.max_frame_size))
            .max_frame_size(Some(self.inner.config.max_frame_size));

        let (stream, _response) =
            connect_async_with_config(self.inner.url.as_str(), Some(ws_config), false)
                .await
                .map_err(|error| Error::connection(error.to_string()))?;
        debug!(url = %self.inner.url, "websocket connected");

        let (sink, stream) = stream.split();
        let transport = Arc::new(Transport::new(sink));
        state.transport = Some(Arc::clone(&transport));
        state.listener = Some(tokio::spawn(listener_loop(
            Arc::clone(&self.inner),
            stream,
            transport,
            self.inner.config.keepalive,
        )));
        Ok(())
    }

    /// Closes the WebSocket and stops the listener task.
    ///
    /// Idempotent and serialized by the connection-state lock. Cancels the
    /// listener and waits for its termination (cancellation during that wait
    /// is the expected outcome), resets the subscribed-namespace set to the
    /// always-on members, then closes the transport.
    ///
    /// Commands still pending at this point are left unresolved: their
    /// callers remain suspended unless they impose their own timeout.
    /// Registered handlers survive; a later reconnect re-subscribes their
    /// namespaces.
    pub async fn disconnect(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if let Some(listener) = state.listener.take() {
            listener.abort();
            match listener.await {
                Ok(()) => {}
                Err(error) if error.is_cancelled() => {}
                Err(error) => warn!(error = %error, "listener task ended abnormally"),
            }
        }
        self.inner.registry.lock().reset_subscriptions();
        if let Some(transport) = state.transport.take() {
            transport.close().await;
            debug!(url = %self.inner.url, "closed websocket connection");
        }
        Ok(())
    }

    /// Returns `true` if no live transport exists.
    pub async fn is_closed(&self) -> bool {
        !self.inner.state.lock().await.is_live()
    }

    /// Number of commands awaiting their reply.
    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    // ========================================================================
    // Send Path
    // ========================================================================

    /// Sends a command and awaits its correlated reply.
    ///
    /// Ensures the transport is connected, runs the reconciliation pass, then
    /// assigns the next id, enqueues the transaction and transmits. No
    /// timeout is imposed by this layer.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] if the peer answered with an error payload
    /// - [`Error::MalformedResponse`] if the reply lacks an expected key
    /// - [`Error::ConnectionClosed`] / [`Error::WebSocket`] on transmit
    ///   failure
    pub async fn send<C: Command>(&self, command: C) -> Result<C::Response> {
        let raw = self.execute(command.descriptor()?, false).await?;
        C::decode(raw)
    }

    /// Fire-and-forget variant: skips the reconciliation pass, but still
    /// awaits the correlated reply internally.
    ///
    /// Used for commands issued *by* the reconciliation pass, and by callers
    /// that must not trigger one.
    pub async fn send_oneshot<C: Command>(&self, command: C) -> Result<C::Response> {
        let raw = self.execute(command.descriptor()?, true).await?;
        C::decode(raw)
    }

    async fn execute(&self, descriptor: CommandDescriptor, is_update: bool) -> Result<Value> {
        self.connect().await?;
        if !is_update {
            // best-effort ordering relative to the new command, not a
            // strict precondition
            self.reconcile().await;
        }
        self.dispatch(descriptor).await
    }

    /// Enqueues a transaction and transmits the request.
    ///
    /// Requires a live transport; never connects or reconciles.
    async fn dispatch(&self, descriptor: CommandDescriptor) -> Result<Value> {
        let (transaction, receiver) = Transaction::new(descriptor.method.to_string());
        let id = self.inner.pending.lock().await.insert(transaction);

        // transmit outside the pending-table lock so slow I/O never blocks
        // table operations
        if let Err(error) = self.transmit(id, &descriptor).await {
            self.inner.pending.lock().await.remove(id);
            return Err(error);
        }
        trace!(id, method = %descriptor.method, "request sent");

        receiver.await.map_err(|_| Error::ConnectionClosed)?
    }

    async fn transmit(&self, id: u64, descriptor: &CommandDescriptor) -> Result<()> {
        let message = Request::new(descriptor, id).to_message()?;
        let transport = self
            .inner
            .state
            .lock()
            .await
            .transport
            .clone()
            .ok_or(Error::ConnectionClosed)?;
        transport.send_text(message).await
    }

    // ========================================================================
    // Handler Registration
    // ========================================================================

    /// Registers a callback for the given target.
    ///
    /// A namespace target expands to every concrete event kind it currently
    /// declares. The returned id removes this callback everywhere via
    /// [`remove_handler`](Self::remove_handler).
    ///
    /// The peer-side subscription is not enabled here; the next outward
    /// command (or explicit [`connect`](Self::connect)) runs the
    /// reconciliation pass.
    pub fn register(&self, target: Target, handler: EventHandler) -> HandlerId {
        self.inner.registry.lock().register(&target, handler)
    }

    /// Removes the entire callback list of every event kind the target
    /// resolves to.
    pub fn unregister(&self, target: Target) {
        self.inner.registry.lock().unregister(&target);
    }

    /// Removes one registered callback wherever it is attached.
    pub fn remove_handler(&self, id: HandlerId) {
        self.inner.registry.lock().remove_handler(id);
    }

    /// Sorted snapshot of the currently subscribed namespaces.
    #[must_use]
    pub fn subscribed_namespaces(&self) -> Vec<String> {
        self.inner.registry.lock().subscribed()
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Aligns the peer's per-namespace subscriptions with the registry.
    ///
    /// Snapshot under the registry lock; enable commands are sent outside it
    /// as fire-and-forget updates, with the tentative marking rolled back on
    /// failure. Namespaces no longer implied are dropped locally without a
    /// disable command. Immediately after the pass, the subscribed set
    /// equals {implied namespaces} ∪ {always-on namespaces}.
    async fn reconcile(&self) {
        let (implied, pending) = {
            let mut registry = self.inner.registry.lock();
            let implied = registry.implied_namespaces();
            let pending = registry.begin_subscriptions(&implied);
            (implied, pending)
        };

        for namespace in pending {
            let descriptor = self.inner.schema.enable_command(&namespace);
            match self.dispatch(descriptor).await {
                Ok(_) => debug!(namespace = %namespace, "namespace subscribed"),
                Err(error) => {
                    debug!(namespace = %namespace, error = %error, "enable command failed");
                    self.inner.registry.lock().rollback_subscription(&namespace);
                }
            }
        }

        self.inner.registry.lock().prune_subscriptions(&implied);
    }
}

// ============================================================================
// Listener Loop
// ============================================================================

/// The sole reader of one live transport.
///
/// Terminates when the peer closes, the stream errors or ends, or the task
/// is cancelled by [`Connection::disconnect`].
async fn listener_loop(
    inner: Arc<Inner>,
    mut stream: SplitStream<WsStream>,
    transport: Arc<Transport>,
    keepalive: Duration,
) {
    loop {
        let frame = match timeout(keepalive, stream.next()).await {
            Ok(frame) => frame,
            Err(_) => {
                // idle: probe the peer so half-dead connections surface
                if transport.send_ping().await.is_err() {
                    break;
                }
                continue;
            }
        };

        match frame {
            Some(Ok(Message::Text(text))) => dispatch_frame(&inner, &text).await,

            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "close frame from peer");
                break;
            }

            // Binary, Ping and Pong frames carry no protocol payload
            Some(Ok(_)) => {}

            Some(Err(error)) => {
                warn!(error = %error, "websocket receive error");
                break;
            }

            None => {
                debug!("websocket stream ended");
                break;
            }
        }
    }

    transport.mark_closed();
    teardown(&inner, &transport).await;
    debug!("listener terminated");
}

/// Routes one inbound frame to transaction completion or event dispatch.
async fn dispatch_frame(inner: &Arc<Inner>, text: &str) {
    let frame = match InboundFrame::parse(text) {
        Ok(frame) => frame,
        Err(error) => {
            warn!(error = %error, "failed to parse incoming frame");
            return;
        }
    };

    match frame {
        InboundFrame::Reply(reply) => {
            let transaction = inner.pending.lock().await.remove(reply.id);
            match transaction {
                Some(transaction) => {
                    debug!(id = reply.id, method = %transaction.method(), "reply correlated");
                    // complete outside the pending-table lock
                    transaction.complete(reply);
                }
                // stale or duplicate reply; drop and keep going
                None => warn!(id = reply.id, "reply for unknown request id"),
            }
        }

        InboundFrame::Event(raw) => {
            let event = match inner.schema.decode_event(&raw) {
                Ok(event) => event,
                Err(error) => {
                    debug!(error = %error, "dropping undecodable event");
                    return;
                }
            };
            let callbacks = inner.registry.lock().snapshot(event.kind());
            trace!(kind = %event.kind(), callbacks = callbacks.len(), "event dispatch");
            for callback in callbacks {
                callback.invoke(Arc::clone(&event), inner.session.clone());
            }
        }
    }
}

/// Clears connection state after the listener observed a closed transport.
///
/// A newer transport may already have superseded this one, in which case its
/// state is left alone.
async fn teardown(inner: &Arc<Inner>, transport: &Arc<Transport>) {
    {
        let mut state = inner.state.lock().await;
        match &state.transport {
            Some(current) if Arc::ptr_eq(current, transport) => {
                state.transport = None;
                // our own handle; dropping it detaches the finished task
                state.listener = None;
            }
            _ => return,
        }
    }
    inner.registry.lock().reset_subscriptions();
    transport.close().await;
}

// ============================================================================
// Tests
// ============================================================================
