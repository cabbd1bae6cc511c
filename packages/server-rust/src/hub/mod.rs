//! The message hub: handler dispatch, middleware and the outbound queue.
//!
//! The hub is the central entity of the server. Inbound messages are
//! validated, passed through the request middleware chain and fed to the
//! registered handlers; outbound messages are queued on a bounded channel
//! and delivered by the dispatcher task, either to a single client or as a
//! broadcast through the cached per-channel-type fan-out.

pub mod middleware;
pub mod rate_limit;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, warn};

use fleetlink_core::{Disposer, Envelope, MessageBuilder};

use crate::client::Client;
use crate::registry::channel_types::Broadcaster;
use crate::registry::{ChannelTypeRegistry, ClientRegistry};
use middleware::{MiddlewareChain, MiddlewarePosition, RequestMiddleware, ResponseMiddleware};

/// Message types that arrive from clients we do not serve; their lack of a
/// handler is expected and not worth a log line.
const QUIET_UNHANDLED_TYPES: &[&str] = &["BCN-INF", "DOCK-INF", "MSN-INF"];

/// Result of one message handler invocation.
pub enum HandlerResult {
    /// The handler processed the message; no response needed from it.
    Handled,
    /// The handler did not recognize the message.
    Ignored,
    /// The handler produced a response body; the hub wraps it in an
    /// envelope referring to the request and queues it.
    Body(Value),
    /// The handler produced a fully built response envelope.
    Response(Envelope),
}

/// A registered message handler.
///
/// Handlers receive the validated message, its sender and the hub itself,
/// and must report failures by logging and returning
/// [`HandlerResult::Ignored`]; a panicking handler is caught, logged and
/// skipped, and the remaining handlers still run.
pub type MessageHandler =
    Arc<dyn Fn(Envelope, Arc<Client>, Arc<MessageHub>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wraps a synchronous closure into a [`MessageHandler`].
pub fn handler_fn<F>(f: F) -> MessageHandler
where
    F: Fn(&Envelope, &Arc<Client>, &Arc<MessageHub>) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(move |message, sender, hub| {
        let result = f(&message, &sender, &hub);
        async move { result }.boxed()
    })
}

/// Wraps an async closure into a [`MessageHandler`].
pub fn async_handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Envelope, Arc<Client>, Arc<MessageHub>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |message, sender, hub| f(message, sender, hub).boxed())
}

/// Schema validation hook; the actual validator is an external collaborator.
///
/// Experimental (`X-` prefixed) message types bypass this hook.
pub trait MessageValidator: Send + Sync {
    /// Validates a structurally sound message against the schema.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the message is invalid; the hub
    /// turns it into an `ACK-NAK`.
    fn validate(&self, message: &Envelope) -> Result<(), String>;
}

/// Recipient of an outbound message.
#[derive(Clone)]
pub enum Recipient {
    Id(String),
    Client(Arc<Client>),
}

impl From<&str> for Recipient {
    fn from(id: &str) -> Self {
        Self::Id(id.to_owned())
    }
}

impl From<String> for Recipient {
    fn from(id: String) -> Self {
        Self::Id(id)
    }
}

impl From<Arc<Client>> for Recipient {
    fn from(client: Arc<Client>) -> Self {
        Self::Client(client)
    }
}

impl From<&Arc<Client>> for Recipient {
    fn from(client: &Arc<Client>) -> Self {
        Self::Client(Arc::clone(client))
    }
}

struct SentState {
    sent: AtomicBool,
    notify: Notify,
    callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl SentState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: AtomicBool::new(false),
            notify: Notify::new(),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    fn mark_sent(&self) {
        self.sent.store(true, Ordering::SeqCst);
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for callback in callbacks {
            callback();
        }
        self.notify.notify_waiters();
    }
}

/// Handle resolving when the dispatcher has served an outbound request.
///
/// Used to sequence follow-up messages after a response: the terminal
/// `ASYNC-RESP` of a receipt may only go out once the response carrying the
/// receipt id has been dispatched.
#[derive(Clone)]
pub struct SentHandle {
    state: Arc<SentState>,
}

impl SentHandle {
    /// Returns whether the request has been served.
    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.state.sent.load(Ordering::SeqCst)
    }

    /// Waits until the request has been served.
    pub async fn wait(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_sent() {
                return;
            }
            notified.await;
        }
    }

    /// Runs a callback once the request has been served; immediately when
    /// it already has been.
    pub fn on_sent(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut callbacks = self.state.callbacks.lock();
            if !self.is_sent() {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }
}

impl std::fmt::Debug for SentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentHandle")
            .field("sent", &self.is_sent())
            .finish()
    }
}

struct OutboundRequest {
    message: Envelope,
    /// `None` means broadcast.
    to: Option<Recipient>,
    in_response_to: Option<Envelope>,
    sent: Arc<SentState>,
}

enum BroadcastTarget {
    Broadcaster(Broadcaster),
    Client(String),
}

/// Central message dispatcher of the server.
pub struct MessageHub {
    builder: MessageBuilder,
    handlers: RwLock<HashMap<Option<String>, Vec<(u64, MessageHandler)>>>,
    next_handler_id: AtomicU64,
    request_middleware: Mutex<MiddlewareChain<dyn RequestMiddleware>>,
    response_middleware: Mutex<MiddlewareChain<dyn ResponseMiddleware>>,
    validator: RwLock<Option<Arc<dyn MessageValidator>>>,
    queue_tx: mpsc::Sender<OutboundRequest>,
    queue_rx: Mutex<Option<mpsc::Receiver<OutboundRequest>>>,
    client_registry: RwLock<Option<Arc<ClientRegistry>>>,
    channel_type_registry: RwLock<Option<Arc<ChannelTypeRegistry>>>,
    broadcast_targets: ArcSwapOption<Vec<BroadcastTarget>>,
    registry_hooks: Mutex<Vec<Disposer>>,
}

impl MessageHub {
    /// Creates a hub with the given outbound queue capacity.
    #[must_use]
    pub fn new(queue_capacity: usize) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity);
        Arc::new(Self {
            builder: MessageBuilder::new(),
            handlers: RwLock::new(HashMap::new()),
            next_handler_id: AtomicU64::new(1),
            request_middleware: Mutex::new(MiddlewareChain::new()),
            response_middleware: Mutex::new(MiddlewareChain::new()),
            validator: RwLock::new(None),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            client_registry: RwLock::new(None),
            channel_type_registry: RwLock::new(None),
            broadcast_targets: ArcSwapOption::empty(),
            registry_hooks: Mutex::new(Vec::new()),
        })
    }

    // -----------------------------------------------------------------------
    // Wiring
    // -----------------------------------------------------------------------

    /// Attaches the client registry used for broadcast fan-out and
    /// recipient resolution. The fan-out cache is invalidated whenever the
    /// registry changes.
    pub fn set_client_registry(self: &Arc<Self>, registry: Arc<ClientRegistry>) {
        let weak = Arc::downgrade(self);
        let invalidate = move || {
            if let Some(hub) = weak.upgrade() {
                hub.invalidate_broadcast_targets();
            }
        };
        let mut hooks = self.registry_hooks.lock();
        let on_added = invalidate.clone();
        hooks.push(registry.added().connect(move |_| on_added()));
        hooks.push(registry.removed().connect(move |_| invalidate()));
        drop(hooks);

        *self.client_registry.write() = Some(registry);
        self.invalidate_broadcast_targets();
    }

    /// Attaches the channel type registry used for broadcast fan-out.
    pub fn set_channel_type_registry(self: &Arc<Self>, registry: Arc<ChannelTypeRegistry>) {
        let weak = Arc::downgrade(self);
        let invalidate = move || {
            if let Some(hub) = weak.upgrade() {
                hub.invalidate_broadcast_targets();
            }
        };
        let mut hooks = self.registry_hooks.lock();
        let on_added = invalidate.clone();
        hooks.push(registry.added().connect(move |_| on_added()));
        hooks.push(registry.removed().connect(move |_| invalidate()));
        drop(hooks);

        *self.channel_type_registry.write() = Some(registry);
        self.invalidate_broadcast_targets();
    }

    /// Installs the schema validation hook.
    pub fn set_validator(&self, validator: Arc<dyn MessageValidator>) {
        *self.validator.write() = Some(validator);
    }

    // -----------------------------------------------------------------------
    // Envelope construction
    // -----------------------------------------------------------------------

    /// The message builder of this hub.
    #[must_use]
    pub fn builder(&self) -> &MessageBuilder {
        &self.builder
    }

    /// Creates a notification with the given body.
    #[must_use]
    pub fn create_notification(&self, body: Value) -> Envelope {
        self.builder.create_notification(body)
    }

    /// Creates a response to the given message.
    #[must_use]
    pub fn create_response_to(&self, message: &Envelope, body: Value) -> Envelope {
        self.builder.create_response_to(message, body)
    }

    /// Creates a positive acknowledgment of the given message.
    #[must_use]
    pub fn acknowledge(&self, message: &Envelope) -> Envelope {
        self.builder.acknowledge(message)
    }

    /// Creates a negative acknowledgment of the given message.
    #[must_use]
    pub fn reject(&self, message: &Envelope, reason: Option<&str>) -> Envelope {
        self.builder.reject(message, reason)
    }

    // -----------------------------------------------------------------------
    // Handlers and middleware
    // -----------------------------------------------------------------------

    /// Registers a handler for the given message types; `None` registers a
    /// generic handler invoked for every type after the specific ones.
    ///
    /// The same handler may be registered multiple times. The returned
    /// disposer unregisters the handler; call `detach()` on it to keep the
    /// handler for the lifetime of the hub.
    pub fn register_message_handler(
        self: &Arc<Self>,
        message_types: Option<&[&str]>,
        handler: MessageHandler,
    ) -> Disposer {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let keys: Vec<Option<String>> = match message_types {
            None => vec![None],
            Some(types) => types.iter().map(|t| Some((*t).to_owned())).collect(),
        };

        {
            let mut handlers = self.handlers.write();
            for key in &keys {
                handlers
                    .entry(key.clone())
                    .or_default()
                    .push((id, Arc::clone(&handler)));
            }
        }

        let weak = Arc::downgrade(self);
        Disposer::new(move || {
            if let Some(hub) = weak.upgrade() {
                let mut handlers = hub.handlers.write();
                for key in &keys {
                    if let Some(entries) = handlers.get_mut(key) {
                        entries.retain(|(entry_id, _)| *entry_id != id);
                    }
                }
            }
        })
    }

    /// Registers a request middleware at the given end of the chain.
    pub fn register_request_middleware(
        self: &Arc<Self>,
        middleware: Arc<dyn RequestMiddleware>,
        position: MiddlewarePosition,
    ) -> Disposer {
        let id = self.request_middleware.lock().insert(middleware, position);
        let weak = Arc::downgrade(self);
        Disposer::new(move || {
            if let Some(hub) = weak.upgrade() {
                hub.request_middleware.lock().remove(id);
            }
        })
    }

    /// Registers a response middleware at the given end of the chain.
    pub fn register_response_middleware(
        self: &Arc<Self>,
        middleware: Arc<dyn ResponseMiddleware>,
        position: MiddlewarePosition,
    ) -> Disposer {
        let id = self.response_middleware.lock().insert(middleware, position);
        let weak = Arc::downgrade(self);
        Disposer::new(move || {
            if let Some(hub) = weak.upgrade() {
                hub.response_middleware.lock().remove(id);
            }
        })
    }

    // -----------------------------------------------------------------------
    // Inbound path
    // -----------------------------------------------------------------------

    /// Handles an incoming message, already decoded from its textual
    /// representation into JSON but not yet validated.
    ///
    /// Returns whether the message was handled by at least one handler or
    /// internally by the hub itself.
    pub async fn handle_incoming_message(
        self: &Arc<Self>,
        raw: Value,
        sender: &Arc<Client>,
    ) -> bool {
        let raw_id = raw
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let raw_type = raw
            .pointer("/body/type")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let message = match Envelope::from_value(raw) {
            Ok(message) => message,
            Err(validation_error) => {
                error!(
                    message_type = raw_type.as_deref().unwrap_or(""),
                    %validation_error,
                    "invalid message received"
                );
                if let Some(request_id) = raw_id {
                    let nak = self.builder.create_response_to_id(
                        &request_id,
                        None,
                        fleetlink_core::reject_body(Some(&validation_error.to_string())),
                    );
                    self.send_to(nak, sender).await;
                    return true;
                }
                return false;
            }
        };

        // Schema validation is pluggable; experimental types bypass it.
        if !message.is_experimental() {
            let validator = self.validator.read().clone();
            if let Some(validator) = validator {
                if let Err(reason) = validator.validate(&message) {
                    error!(id = %message.id, %reason, "message failed schema validation");
                    let nak = self.reject(&message, Some(&reason));
                    self.send_to(nak, sender).await;
                    return true;
                }
            }
        }

        let mut message = message;
        for middleware in self.request_middleware.lock().snapshot() {
            match middleware.process(message, sender) {
                Some(next) => message = next,
                None => return true,
            }
        }

        let handled = self.feed_message_to_handlers(&message, sender).await;
        if !handled {
            let message_type = message.message_type().unwrap_or("");
            if !QUIET_UNHANDLED_TYPES.contains(&message_type) {
                warn!(id = %message.id, %message_type, "unhandled message");
            }
            let nak = self.reject(
                &message,
                Some("No handler managed to parse this message in the server"),
            );
            self.send_to(nak, sender).await;
        }
        handled
    }

    /// Feeds a validated message to the specific and then the generic
    /// handlers. A panicking handler is logged and skipped; the remaining
    /// handlers still run.
    async fn feed_message_to_handlers(
        self: &Arc<Self>,
        message: &Envelope,
        sender: &Arc<Client>,
    ) -> bool {
        let message_type = message.message_type().map(str::to_owned);
        let handlers: Vec<MessageHandler> = {
            let table = self.handlers.read();
            let specific = table.get(&message_type).into_iter().flatten();
            let generic = table.get(&None).into_iter().flatten();
            specific
                .chain(generic)
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };

        let mut handled = false;
        for handler in handlers {
            let future = handler(message.clone(), Arc::clone(sender), Arc::clone(self));
            let result = std::panic::AssertUnwindSafe(future).catch_unwind().await;
            match result {
                Ok(HandlerResult::Handled) => handled = true,
                Ok(HandlerResult::Ignored) => {}
                Ok(HandlerResult::Body(body)) => {
                    // The response must be enqueued, not sent inline: async
                    // operation notifications have to trail the response that
                    // carries their receipt ids.
                    self.enqueue_response(body, sender, message);
                    handled = true;
                }
                Ok(HandlerResult::Response(response)) => {
                    self.enqueue(OutboundRequest {
                        message: response,
                        to: Some(Recipient::from(sender)),
                        in_response_to: Some(message.clone()),
                        sent: SentState::new(),
                    });
                    handled = true;
                }
                Err(_panic) => {
                    error!(
                        id = %message.id,
                        "handler panicked; proceeding with next handler"
                    );
                }
            }
        }
        handled
    }

    // -----------------------------------------------------------------------
    // Outbound path
    // -----------------------------------------------------------------------

    fn enqueue(&self, request: OutboundRequest) {
        if let Err(mpsc::error::TrySendError::Full(request)) = self.queue_tx.try_send(request) {
            debug!(id = %request.message.id, "outbound queue full; dropping message");
        }
    }

    /// Enqueues a notification for broadcast; drops it silently when the
    /// queue is full. Only notifications may be broadcast.
    pub fn enqueue_broadcast(&self, message: Envelope) {
        debug_assert!(message.refs.is_none(), "only notifications may be broadcast");
        self.enqueue(OutboundRequest {
            message,
            to: None,
            in_response_to: None,
            sent: SentState::new(),
        });
    }

    /// Enqueues a broadcast, waiting for queue capacity. Only notifications
    /// may be broadcast.
    pub async fn broadcast_message(&self, message: Envelope) -> SentHandle {
        debug_assert!(message.refs.is_none(), "only notifications may be broadcast");
        let sent = SentState::new();
        let handle = SentHandle {
            state: Arc::clone(&sent),
        };
        let request = OutboundRequest {
            message,
            to: None,
            in_response_to: None,
            sent,
        };
        if self.queue_tx.send(request).await.is_err() {
            warn!("message hub is shut down; dropping broadcast");
        }
        handle
    }

    /// Enqueues a message to one recipient; drops it silently when the
    /// queue is full.
    pub fn enqueue_to(&self, message: Envelope, to: impl Into<Recipient>) {
        self.enqueue(OutboundRequest {
            message,
            to: Some(to.into()),
            in_response_to: None,
            sent: SentState::new(),
        });
    }

    /// Enqueues a response body to the sender of a request; drops it
    /// silently when the queue is full.
    pub fn enqueue_response(&self, body: Value, to: &Arc<Client>, in_response_to: &Envelope) {
        let response = self.builder.create_response_to(in_response_to, body);
        self.enqueue(OutboundRequest {
            message: response,
            to: Some(Recipient::from(to)),
            in_response_to: Some(in_response_to.clone()),
            sent: SentState::new(),
        });
    }

    /// Enqueues a message to one recipient, waiting for queue capacity.
    /// The returned handle resolves when the dispatcher has served the
    /// request.
    pub async fn send_to(&self, message: Envelope, to: impl Into<Recipient>) -> SentHandle {
        self.send_request(message, Some(to.into()), None).await
    }

    /// Builds a response to `in_response_to` and enqueues it, waiting for
    /// queue capacity.
    pub async fn send_response(
        &self,
        body: Value,
        to: impl Into<Recipient>,
        in_response_to: &Envelope,
    ) -> SentHandle {
        let response = self.builder.create_response_to(in_response_to, body);
        self.send_request(response, Some(to.into()), Some(in_response_to.clone()))
            .await
    }

    async fn send_request(
        &self,
        message: Envelope,
        to: Option<Recipient>,
        in_response_to: Option<Envelope>,
    ) -> SentHandle {
        let sent = SentState::new();
        let handle = SentHandle {
            state: Arc::clone(&sent),
        };
        let request = OutboundRequest {
            message,
            to,
            in_response_to,
            sent,
        };
        if self.queue_tx.send(request).await.is_err() {
            warn!("message hub is shut down; dropping message");
        }
        handle
    }

    /// Runs the outbound dispatcher in an infinite loop.
    ///
    /// Requests are served strictly in queue order, which provides the
    /// per-client ordering guarantee of the protocol.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` mirrors the other long-running
    /// tasks of the server.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let Some(mut queue_rx) = self.queue_rx.lock().take() else {
            anyhow::bail!("message hub is already running");
        };
        while let Some(request) = queue_rx.recv().await {
            match request.to {
                Some(recipient) => {
                    self.dispatch_to_recipient(request.message, recipient, request.in_response_to)
                        .await;
                }
                None => self.dispatch_broadcast(request.message).await,
            }
            request.sent.mark_sent();
        }
        Ok(())
    }

    async fn dispatch_to_recipient(
        &self,
        message: Envelope,
        recipient: Recipient,
        in_response_to: Option<Envelope>,
    ) {
        let client = match recipient {
            Recipient::Client(client) => client,
            Recipient::Id(id) => {
                let registry = self.client_registry.read().clone();
                match registry.and_then(|registry| registry.get(&id)) {
                    Some(client) => client,
                    None => {
                        warn!(%id, "client is gone; not sending message");
                        return;
                    }
                }
            }
        };

        let mut message = message;
        for middleware in self.response_middleware.lock().snapshot() {
            match middleware.process(message, Some(&client), in_response_to.as_ref()) {
                Some(next) => message = next,
                None => return,
            }
        }

        match client.channel().send(&message).await {
            Ok(()) => {}
            Err(crate::channel::ChannelError::ClientGone) => {
                warn!(id = %client.id(), "client is gone; not sending message");
            }
            Err(error) => {
                error!(id = %client.id(), %error, "error while sending message to client");
            }
        }
    }

    async fn dispatch_broadcast(&self, message: Envelope) {
        let targets = self.current_broadcast_targets();
        if targets.is_empty() {
            return;
        }

        let mut message = message;
        for middleware in self.response_middleware.lock().snapshot() {
            match middleware.process(message, None, None) {
                Some(next) => message = next,
                None => return,
            }
        }

        let mut failures = 0_usize;
        for target in targets.iter() {
            match target {
                BroadcastTarget::Broadcaster(broadcast) => {
                    broadcast(message.clone()).await;
                }
                BroadcastTarget::Client(id) => {
                    let registry = self.client_registry.read().clone();
                    let Some(client) = registry.and_then(|registry| registry.get(id)) else {
                        continue;
                    };
                    match client.channel().send(&message).await {
                        Ok(()) | Err(crate::channel::ChannelError::ClientGone) => {}
                        Err(_) => failures += 1,
                    }
                }
            }
        }
        if failures > 0 {
            error!(failures, "error while broadcasting message to clients");
        }
    }

    fn invalidate_broadcast_targets(&self) {
        self.broadcast_targets.store(None);
    }

    /// Returns the cached broadcast fan-out, rebuilding it after an
    /// invalidation.
    fn current_broadcast_targets(&self) -> Arc<Vec<BroadcastTarget>> {
        if let Some(targets) = self.broadcast_targets.load_full() {
            return targets;
        }

        let mut targets = Vec::new();
        let channel_types = self.channel_type_registry.read().clone();
        let clients = self.client_registry.read().clone();
        if let (Some(channel_types), Some(clients)) = (channel_types, clients) {
            for descriptor in channel_types.descriptors() {
                if let Some(broadcaster) = &descriptor.broadcaster {
                    if clients.has_clients_for_channel_type(&descriptor.id) {
                        targets.push(BroadcastTarget::Broadcaster(Arc::clone(broadcaster)));
                    }
                } else {
                    for client_id in clients.client_ids_for_channel_type(&descriptor.id) {
                        targets.push(BroadcastTarget::Client(client_id));
                    }
                }
            }
        }

        let targets = Arc::new(targets);
        self.broadcast_targets.store(Some(Arc::clone(&targets)));
        targets
    }

    // -----------------------------------------------------------------------
    // Pull-style consumption
    // -----------------------------------------------------------------------

    /// Returns a pull-style consumer yielding the messages of the given
    /// types together with their sender and a responder. The backing
    /// handler claims every matching message and is unregistered when the
    /// stream is dropped.
    #[must_use]
    pub fn iterate(self: &Arc<Self>, message_types: &[&str]) -> MessageStream {
        let (tx, rx) = mpsc::channel::<(Envelope, Arc<Client>)>(16);
        let handler: MessageHandler = Arc::new(move |message, sender, _hub| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((message, sender)).await;
                HandlerResult::Handled
            }
            .boxed()
        });
        let guard = self.register_message_handler(Some(message_types), handler);
        MessageStream {
            rx,
            hub: Arc::clone(self),
            _guard: guard,
        }
    }
}

impl std::fmt::Debug for MessageHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHub")
            .field("handler_types", &self.handlers.read().len())
            .finish_non_exhaustive()
    }
}

/// Pull-style message consumer returned by [`MessageHub::iterate`].
pub struct MessageStream {
    rx: mpsc::Receiver<(Envelope, Arc<Client>)>,
    hub: Arc<MessageHub>,
    _guard: Disposer,
}

impl MessageStream {
    /// Yields the next matching message as a `(body, sender, responder)`
    /// triple; `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<(Value, Arc<Client>, Responder)> {
        let (message, sender) = self.rx.recv().await?;
        let body = message.body.clone();
        let responder = Responder {
            hub: Arc::clone(&self.hub),
            request: message,
            to: Arc::clone(&sender),
        };
        Some((body, sender, responder))
    }
}

/// Responds to one message received through a [`MessageStream`].
pub struct Responder {
    hub: Arc<MessageHub>,
    request: Envelope,
    to: Arc<Client>,
}

impl Responder {
    /// Enqueues a response with the given body; returns immediately after
    /// queueing.
    pub fn respond(&self, body: Value) {
        self.hub.enqueue_response(body, &self.to, &self.request);
    }

    /// The request being responded to.
    #[must_use]
    pub fn request(&self) -> &Envelope {
        &self.request
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use std::time::Duration;

    use crate::channel::QueueChannel;
    use crate::registry::channel_types::ChannelTypeDescriptor;

    use super::*;

    /// Test rig: a hub wired to real registries, with a helper to connect
    /// clients whose receive side is exposed.
    struct Rig {
        hub: Arc<MessageHub>,
        clients: Arc<ClientRegistry>,
        channel_types: Arc<ChannelTypeRegistry>,
        rx_store: Arc<Mutex<Vec<mpsc::Receiver<Envelope>>>>,
    }

    impl Rig {
        fn new() -> Self {
            let rx_store: Arc<Mutex<Vec<mpsc::Receiver<Envelope>>>> =
                Arc::new(Mutex::new(Vec::new()));
            let channel_types = Arc::new(ChannelTypeRegistry::new());
            let store = Arc::clone(&rx_store);
            channel_types.add(ChannelTypeDescriptor::new(
                "inproc",
                Arc::new(move || {
                    let (channel, rx) = QueueChannel::new(64);
                    store.lock().push(rx);
                    channel
                }),
            ));

            let clients = Arc::new(ClientRegistry::new(Arc::clone(&channel_types)));
            let hub = MessageHub::new(64);
            hub.set_channel_type_registry(Arc::clone(&channel_types));
            hub.set_client_registry(Arc::clone(&clients));

            Self {
                hub,
                clients,
                channel_types,
                rx_store,
            }
        }

        fn connect(&self, id: &str) -> (Arc<Client>, mpsc::Receiver<Envelope>) {
            let client = self.clients.add(id, "inproc").unwrap();
            let rx = self.rx_store.lock().pop().expect("factory stored an rx");
            (client, rx)
        }

        fn spawn_dispatcher(&self) -> tokio::task::JoinHandle<anyhow::Result<()>> {
            let hub = Arc::clone(&self.hub);
            tokio::spawn(hub.run())
        }
    }

    fn request(message_type: &str) -> Value {
        json!({
            "$fw.version": "1.0",
            "id": fleetlink_core::generate_id(),
            "body": { "type": message_type }
        })
    }

    async fn recv(rx: &mut mpsc::Receiver<Envelope>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn handler_body_result_becomes_response() {
        let rig = Rig::new();
        let _dispatcher = rig.spawn_dispatcher();
        let (client, mut rx) = rig.connect("client-1");

        rig.hub
            .register_message_handler(
                Some(&["SYS-VER"]),
                handler_fn(|_message, _sender, _hub| {
                    HandlerResult::Body(json!({ "version": "2.1" }))
                }),
            )
            .detach();

        let raw = request("SYS-VER");
        let request_id = raw["id"].as_str().unwrap().to_owned();
        assert!(rig.hub.handle_incoming_message(raw, &client).await);

        let response = recv(&mut rx).await;
        assert_eq!(response.refs.as_deref(), Some(request_id.as_str()));
        assert_eq!(response.message_type(), Some("SYS-VER"));
        assert_eq!(response.body["version"], "2.1");
    }

    #[tokio::test]
    async fn unhandled_message_yields_ack_nak() {
        let rig = Rig::new();
        let _dispatcher = rig.spawn_dispatcher();
        let (client, mut rx) = rig.connect("client-1");

        let handled = rig.hub.handle_incoming_message(request("NO-HANDLER"), &client).await;
        assert!(!handled);

        let response = recv(&mut rx).await;
        assert_eq!(response.message_type(), Some("ACK-NAK"));
        assert!(response.body["reason"]
            .as_str()
            .unwrap()
            .contains("No handler"));
    }

    #[tokio::test]
    async fn invalid_message_with_id_is_rejected() {
        let rig = Rig::new();
        let _dispatcher = rig.spawn_dispatcher();
        let (client, mut rx) = rig.connect("client-1");

        let raw = json!({ "id": "zzz", "body": {} });
        assert!(rig.hub.handle_incoming_message(raw, &client).await);

        let response = recv(&mut rx).await;
        assert_eq!(response.message_type(), Some("ACK-NAK"));
        assert_eq!(response.refs.as_deref(), Some("zzz"));
    }

    #[tokio::test]
    async fn invalid_message_without_id_is_dropped() {
        let rig = Rig::new();
        let (client, _rx) = rig.connect("client-1");

        let handled = rig
            .hub
            .handle_incoming_message(json!({ "body": { "type": "SYS-PING" } }), &client)
            .await;
        assert!(!handled);
    }

    #[tokio::test]
    async fn validator_rejects_non_experimental_messages_only() {
        struct RejectEverything;
        impl MessageValidator for RejectEverything {
            fn validate(&self, _message: &Envelope) -> Result<(), String> {
                Err("does not match schema".to_owned())
            }
        }

        let rig = Rig::new();
        let _dispatcher = rig.spawn_dispatcher();
        let (client, mut rx) = rig.connect("client-1");
        rig.hub.set_validator(Arc::new(RejectEverything));

        rig.hub
            .register_message_handler(
                Some(&["X-TEST"]),
                handler_fn(|_m, _s, _h| HandlerResult::Handled),
            )
            .detach();

        // A schema-valid type is rejected by the validator.
        assert!(rig.hub.handle_incoming_message(request("SYS-PING"), &client).await);
        let response = recv(&mut rx).await;
        assert_eq!(response.message_type(), Some("ACK-NAK"));
        assert_eq!(response.body["reason"], "does not match schema");

        // Experimental types bypass the validator.
        assert!(rig.hub.handle_incoming_message(request("X-TEST"), &client).await);
    }

    #[tokio::test]
    async fn specific_handlers_run_before_generic_ones() {
        let rig = Rig::new();
        let (client, _rx) = rig.connect("client-1");
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_specific = Arc::clone(&order);
        rig.hub
            .register_message_handler(
                Some(&["SYS-PING"]),
                handler_fn(move |_m, _s, _h| {
                    order_specific.lock().push("specific");
                    HandlerResult::Handled
                }),
            )
            .detach();
        let order_generic = Arc::clone(&order);
        rig.hub
            .register_message_handler(
                None,
                handler_fn(move |_m, _s, _h| {
                    order_generic.lock().push("generic");
                    HandlerResult::Handled
                }),
            )
            .detach();

        assert!(rig.hub.handle_incoming_message(request("SYS-PING"), &client).await);
        assert_eq!(order.lock().clone(), vec!["specific", "generic"]);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_chain() {
        let rig = Rig::new();
        let (client, _rx) = rig.connect("client-1");

        rig.hub
            .register_message_handler(
                Some(&["SYS-PING"]),
                handler_fn(|_m, _s, _h| panic!("boom")),
            )
            .detach();
        rig.hub
            .register_message_handler(
                Some(&["SYS-PING"]),
                handler_fn(|_m, _s, _h| HandlerResult::Handled),
            )
            .detach();

        assert!(rig.hub.handle_incoming_message(request("SYS-PING"), &client).await);
    }

    #[tokio::test]
    async fn handler_disposer_unregisters() {
        let rig = Rig::new();
        let _dispatcher = rig.spawn_dispatcher();
        let (client, mut rx) = rig.connect("client-1");

        let guard = rig.hub.register_message_handler(
            Some(&["SYS-PING"]),
            handler_fn(|_m, _s, _h| HandlerResult::Handled),
        );
        assert!(rig.hub.handle_incoming_message(request("SYS-PING"), &client).await);

        guard.dispose();
        assert!(!rig.hub.handle_incoming_message(request("SYS-PING"), &client).await);
        // The unhandled message produced an ACK-NAK.
        let response = recv(&mut rx).await;
        assert_eq!(response.message_type(), Some("ACK-NAK"));
    }

    #[tokio::test]
    async fn request_middleware_can_drop_messages() {
        struct DropAll;
        impl RequestMiddleware for DropAll {
            fn process(&self, _message: Envelope, _sender: &Arc<Client>) -> Option<Envelope> {
                None
            }
        }

        let rig = Rig::new();
        let (client, _rx) = rig.connect("client-1");
        let invoked = Arc::new(AtomicBool::new(false));

        let invoked_clone = Arc::clone(&invoked);
        rig.hub
            .register_message_handler(
                Some(&["SYS-PING"]),
                handler_fn(move |_m, _s, _h| {
                    invoked_clone.store(true, Ordering::SeqCst);
                    HandlerResult::Handled
                }),
            )
            .detach();
        rig.hub
            .register_request_middleware(Arc::new(DropAll), MiddlewarePosition::Post)
            .detach();

        // Dropped by middleware counts as handled; the handler never ran.
        assert!(rig.hub.handle_incoming_message(request("SYS-PING"), &client).await);
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn response_middleware_can_rewrite_and_drop() {
        struct Stamp;
        impl ResponseMiddleware for Stamp {
            fn process(
                &self,
                mut message: Envelope,
                _recipient: Option<&Arc<Client>>,
                _in_response_to: Option<&Envelope>,
            ) -> Option<Envelope> {
                if message.message_type() == Some("SECRET") {
                    return None;
                }
                if let Value::Object(map) = &mut message.body {
                    map.insert("stamped".to_owned(), Value::Bool(true));
                }
                Some(message)
            }
        }

        let rig = Rig::new();
        let _dispatcher = rig.spawn_dispatcher();
        let (client, mut rx) = rig.connect("client-1");
        rig.hub
            .register_response_middleware(Arc::new(Stamp), MiddlewarePosition::Post)
            .detach();

        let dropped = rig.hub.create_notification(json!({ "type": "SECRET" }));
        rig.hub.send_to(dropped, &client).await;

        let passed = rig.hub.create_notification(json!({ "type": "SYS-MSG" }));
        rig.hub.send_to(passed, &client).await;

        let received = recv(&mut rx).await;
        assert_eq!(received.message_type(), Some("SYS-MSG"));
        assert_eq!(received.body["stamped"], true);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client_without_broadcaster() {
        let rig = Rig::new();
        let _dispatcher = rig.spawn_dispatcher();
        let (_client_a, mut rx_a) = rig.connect("client-a");
        let (_client_b, mut rx_b) = rig.connect("client-b");

        let message = rig
            .hub
            .create_notification(json!({ "type": "UAV-INF", "status": {} }));
        rig.hub.broadcast_message(message).await.wait().await;

        assert_eq!(recv(&mut rx_a).await.message_type(), Some("UAV-INF"));
        assert_eq!(recv(&mut rx_b).await.message_type(), Some("UAV-INF"));
    }

    #[tokio::test]
    async fn broadcaster_channel_type_is_invoked_once() {
        let rig = Rig::new();
        let broadcast_count = Arc::new(AtomicU64::new(0));

        // A channel type with a broadcaster; its clients are not contacted
        // individually.
        let count = Arc::clone(&broadcast_count);
        let store = Arc::clone(&rig.rx_store);
        rig.channel_types.add(
            ChannelTypeDescriptor::new(
                "bulk",
                Arc::new(move || {
                    let (channel, rx) = QueueChannel::new(64);
                    store.lock().push(rx);
                    channel
                }),
            )
            .with_broadcaster(Arc::new(move |_message| {
                count.fetch_add(1, Ordering::SeqCst);
                Box::pin(async {})
            })),
        );

        let _dispatcher = rig.spawn_dispatcher();
        let (_bulk_1, mut bulk_rx_1) = {
            let client = rig.clients.add("bulk-1", "bulk").unwrap();
            (client, rig.rx_store.lock().pop().unwrap())
        };
        let _bulk_2 = rig.clients.add("bulk-2", "bulk").unwrap();
        rig.rx_store.lock().pop().unwrap();

        let message = rig.hub.create_notification(json!({ "type": "SYS-MSG" }));
        rig.hub.broadcast_message(message).await.wait().await;

        assert_eq!(broadcast_count.load(Ordering::SeqCst), 1);
        assert!(bulk_rx_1.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcaster_is_skipped_without_subscribers() {
        let rig = Rig::new();
        let broadcast_count = Arc::new(AtomicU64::new(0));

        let count = Arc::clone(&broadcast_count);
        rig.channel_types.add(
            ChannelTypeDescriptor::new(
                "bulk",
                Arc::new(|| {
                    let (channel, _rx) = QueueChannel::new(64);
                    channel
                }),
            )
            .with_broadcaster(Arc::new(move |_message| {
                count.fetch_add(1, Ordering::SeqCst);
                Box::pin(async {})
            })),
        );

        let _dispatcher = rig.spawn_dispatcher();
        let message = rig.hub.create_notification(json!({ "type": "SYS-MSG" }));
        rig.hub.broadcast_message(message).await.wait().await;

        assert_eq!(broadcast_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fanout_cache_follows_client_registry_changes() {
        let rig = Rig::new();
        let _dispatcher = rig.spawn_dispatcher();

        // No clients yet: the broadcast reaches nobody.
        let message = rig.hub.create_notification(json!({ "type": "SYS-MSG" }));
        rig.hub.broadcast_message(message).await.wait().await;

        // After connecting, the cache is rebuilt and the client is reached.
        let (_client, mut rx) = rig.connect("late-client");
        let message = rig.hub.create_notification(json!({ "type": "SYS-MSG" }));
        rig.hub.broadcast_message(message).await.wait().await;
        assert_eq!(recv(&mut rx).await.message_type(), Some("SYS-MSG"));

        // After disconnect, broadcasts no longer try to reach the client.
        rig.clients.remove("late-client");
        let message = rig.hub.create_notification(json!({ "type": "SYS-MSG" }));
        rig.hub.broadcast_message(message).await.wait().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn messages_to_one_client_arrive_in_enqueue_order() {
        let rig = Rig::new();
        let _dispatcher = rig.spawn_dispatcher();
        let (client, mut rx) = rig.connect("client-1");

        for i in 0..10 {
            let message = rig
                .hub
                .create_notification(json!({ "type": "SYS-MSG", "seq": i }));
            rig.hub.send_to(message, &client).await;
        }

        for i in 0..10 {
            assert_eq!(recv(&mut rx).await.body["seq"], i);
        }
    }

    #[tokio::test]
    async fn sent_handle_resolves_after_dispatch() {
        let rig = Rig::new();
        let (client, mut rx) = rig.connect("client-1");

        let message = rig.hub.create_notification(json!({ "type": "SYS-MSG" }));
        let handle = rig.hub.send_to(message, &client).await;
        assert!(!handle.is_sent());

        let callback_fired = Arc::new(AtomicBool::new(false));
        let fired = Arc::clone(&callback_fired);
        handle.on_sent(move || fired.store(true, Ordering::SeqCst));

        let _dispatcher = rig.spawn_dispatcher();
        handle.wait().await;
        assert!(handle.is_sent());
        assert!(callback_fired.load(Ordering::SeqCst));
        let _ = recv(&mut rx).await;
    }

    #[tokio::test]
    async fn enqueue_drops_silently_when_queue_is_full() {
        // A tiny hub with no dispatcher: the queue fills up immediately.
        let hub = MessageHub::new(1);
        let message = hub.create_notification(json!({ "type": "SYS-MSG" }));
        hub.enqueue_broadcast(message.clone());
        hub.enqueue_broadcast(message.clone());
        hub.enqueue_broadcast(message);
        // No panic, no error: over-capacity messages are dropped.
    }

    #[tokio::test]
    async fn send_to_missing_client_id_is_swallowed() {
        let rig = Rig::new();
        let _dispatcher = rig.spawn_dispatcher();

        let message = rig.hub.create_notification(json!({ "type": "SYS-MSG" }));
        rig.hub.send_to(message, "ghost").await.wait().await;
    }

    #[tokio::test]
    async fn iterate_yields_messages_and_responds() {
        let rig = Rig::new();
        let _dispatcher = rig.spawn_dispatcher();
        let (client, mut rx) = rig.connect("client-1");

        let mut stream = rig.hub.iterate(&["SYS-TIME"]);

        let raw = request("SYS-TIME");
        let request_id = raw["id"].as_str().unwrap().to_owned();
        let hub = Arc::clone(&rig.hub);
        let sender = Arc::clone(&client);
        let feeder = tokio::spawn(async move { hub.handle_incoming_message(raw, &sender).await });

        let (body, sender, responder) = stream.next().await.unwrap();
        assert_eq!(body["type"], "SYS-TIME");
        assert_eq!(sender.id(), "client-1");
        responder.respond(json!({ "timestamp": 123 }));

        assert!(feeder.await.unwrap());
        let response = recv(&mut rx).await;
        assert_eq!(response.refs.as_deref(), Some(request_id.as_str()));
        assert_eq!(response.body["timestamp"], 123);

        // Dropping the stream unregisters the handler.
        drop(stream);
        assert!(!rig.hub.handle_incoming_message(request("SYS-TIME"), &client).await);
        let _ = recv(&mut rx).await; // the ACK-NAK
    }
}
