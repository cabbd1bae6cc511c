//! Middleware chains of the message hub.
//!
//! Request middleware sees every inbound message after validation and
//! before handler dispatch; response middleware sees every outbound
//! message, unicast or broadcast, just before it is handed to the channel.
//! Returning `None` from a middleware drops the message.

use std::sync::Arc;

use tracing::debug;

use fleetlink_core::Envelope;

use crate::client::Client;

/// Where to insert a middleware relative to the ones already registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MiddlewarePosition {
    /// Before every existing middleware.
    Pre,
    /// After every existing middleware.
    #[default]
    Post,
}

/// Middleware applied to inbound requests.
pub trait RequestMiddleware: Send + Sync {
    /// Processes an inbound message. Return the message (possibly modified)
    /// to pass it on, or `None` to drop it.
    fn process(&self, message: Envelope, sender: &Arc<Client>) -> Option<Envelope>;
}

/// Middleware applied to outbound responses, notifications and broadcasts.
pub trait ResponseMiddleware: Send + Sync {
    /// Processes an outbound message. `recipient` is `None` for broadcasts;
    /// `in_response_to` carries the request being answered, when any.
    /// Return the message (possibly modified) to pass it on, or `None` to
    /// drop it.
    fn process(
        &self,
        message: Envelope,
        recipient: Option<&Arc<Client>>,
        in_response_to: Option<&Envelope>,
    ) -> Option<Envelope>;
}

/// Request middleware that logs every inbound message at debug level.
#[derive(Debug, Default)]
pub struct RequestLogMiddleware;

impl RequestMiddleware for RequestLogMiddleware {
    fn process(&self, message: Envelope, sender: &Arc<Client>) -> Option<Envelope> {
        debug!(
            id = %message.id,
            from = %sender.id(),
            message_type = message.message_type().unwrap_or(""),
            "message received"
        );
        Some(message)
    }
}

/// Response middleware that logs every outbound message at debug level.
#[derive(Debug, Default)]
pub struct ResponseLogMiddleware;

impl ResponseMiddleware for ResponseLogMiddleware {
    fn process(
        &self,
        message: Envelope,
        recipient: Option<&Arc<Client>>,
        _in_response_to: Option<&Envelope>,
    ) -> Option<Envelope> {
        debug!(
            id = %message.id,
            to = recipient.map_or("*", |client| client.id()),
            message_type = message.message_type().unwrap_or(""),
            "message sent"
        );
        Some(message)
    }
}

/// An ordered middleware chain; `T` is one of the two middleware traits.
pub(crate) struct MiddlewareChain<T: ?Sized> {
    entries: Vec<(u64, Arc<T>)>,
    next_id: u64,
}

impl<T: ?Sized> MiddlewareChain<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    /// Inserts a middleware, returning the id used to unregister it.
    pub(crate) fn insert(&mut self, middleware: Arc<T>, position: MiddlewarePosition) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        match position {
            MiddlewarePosition::Pre => self.entries.insert(0, (id, middleware)),
            MiddlewarePosition::Post => self.entries.push((id, middleware)),
        }
        id
    }

    pub(crate) fn remove(&mut self, id: u64) {
        self.entries.retain(|(entry_id, _)| *entry_id != id);
    }

    /// Snapshot of the middleware in application order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries
            .iter()
            .map(|(_, middleware)| Arc::clone(middleware))
            .collect()
    }
}
