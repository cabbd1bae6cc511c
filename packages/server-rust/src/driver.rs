//! UAV driver interface.
//!
//! A driver owns the vehicles it discovered and executes commands on them.
//! Command handlers are registered in a [`CommandTable`] keyed by command
//! token (`takeoff`, `land`, `param-get`, ...): a driver may provide
//! per-token multi-target handlers, per-token single-target handlers, two
//! generic fallbacks, and broadcast handlers used when a command requests
//! whole-fleet transport.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;

use crate::commands::CommandOutcome;
use crate::object::Uav;

/// Handles one command for a single UAV.
pub type SingleCommandHandler = Arc<dyn Fn(Arc<Uav>, Value) -> CommandOutcome + Send + Sync>;

/// Handles one command for a whole group of UAVs owned by the same driver.
pub type MultiCommandHandler =
    Arc<dyn Fn(Vec<Arc<Uav>>, Value) -> MultiCommandOutcome + Send + Sync>;

/// Handles one command as a single broadcast over the driver's downlink.
pub type BroadcastCommandHandler = Arc<dyn Fn(Value) -> CommandOutcome + Send + Sync>;

/// Outcome of a multi-target handler invocation.
pub enum MultiCommandOutcome {
    /// Individual outcomes per UAV id; UAVs missing from the map get an
    /// error attached.
    PerUav(HashMap<String, CommandOutcome>),
    /// A single outcome that applies to every UAV in the group.
    Shared(CommandOutcome),
    /// The outcome is computed asynchronously; the dispatch layer awaits it
    /// before mapping the results.
    Deferred(BoxFuture<'static, MultiCommandOutcome>),
}

impl std::fmt::Debug for MultiCommandOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PerUav(map) => f.debug_tuple("PerUav").field(&map.len()).finish(),
            Self::Shared(outcome) => f.debug_tuple("Shared").field(outcome).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Handler lookup result; multi-target handlers win over single-target
/// ones.
pub enum ResolvedHandler {
    Multi(MultiCommandHandler),
    Single(SingleCommandHandler),
}

/// Command handlers of one driver, keyed by command token.
#[derive(Default)]
pub struct CommandTable {
    multi: HashMap<String, MultiCommandHandler>,
    single: HashMap<String, SingleCommandHandler>,
    broadcast: HashMap<String, BroadcastCommandHandler>,
    generic_multi: Option<MultiCommandHandler>,
    generic: Option<SingleCommandHandler>,
}

impl CommandTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a multi-target handler for a token.
    pub fn register_multi(&mut self, token: &str, handler: MultiCommandHandler) {
        self.multi.insert(token.to_owned(), handler);
    }

    /// Registers a single-target handler for a token.
    pub fn register_single(&mut self, token: &str, handler: SingleCommandHandler) {
        self.single.insert(token.to_owned(), handler);
    }

    /// Registers a broadcast handler for a token, used when a command
    /// requests broadcast transport.
    pub fn register_broadcast(&mut self, token: &str, handler: BroadcastCommandHandler) {
        self.broadcast.insert(token.to_owned(), handler);
    }

    /// Sets the fallback handler for tokens without a registered
    /// multi-target handler.
    pub fn set_generic_multi(&mut self, handler: MultiCommandHandler) {
        self.generic_multi = Some(handler);
    }

    /// Sets the fallback handler for tokens without any registered handler.
    pub fn set_generic(&mut self, handler: SingleCommandHandler) {
        self.generic = Some(handler);
    }

    /// Resolves the handler for a token.
    ///
    /// Lookup order: the token's multi-target handler, the token's
    /// single-target handler, the generic multi-target fallback, the
    /// generic single-target fallback.
    #[must_use]
    pub fn resolve(&self, token: &str) -> Option<ResolvedHandler> {
        if let Some(handler) = self.multi.get(token) {
            return Some(ResolvedHandler::Multi(Arc::clone(handler)));
        }
        if let Some(handler) = self.single.get(token) {
            return Some(ResolvedHandler::Single(Arc::clone(handler)));
        }
        if let Some(handler) = &self.generic_multi {
            return Some(ResolvedHandler::Multi(Arc::clone(handler)));
        }
        if let Some(handler) = &self.generic {
            return Some(ResolvedHandler::Single(Arc::clone(handler)));
        }
        None
    }

    /// Returns the broadcast handler registered for a token.
    #[must_use]
    pub fn resolve_broadcast(&self, token: &str) -> Option<BroadcastCommandHandler> {
        self.broadcast.get(token).cloned()
    }
}

impl std::fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandTable")
            .field("multi", &self.multi.len())
            .field("single", &self.single.len())
            .field("broadcast", &self.broadcast.len())
            .field("has_generic_multi", &self.generic_multi.is_some())
            .field("has_generic", &self.generic.is_some())
            .finish()
    }
}

/// A driver responsible for a family of UAVs.
pub trait UavDriver: Send + Sync {
    /// The unique id of the driver, referenced by the UAVs it owns.
    fn id(&self) -> &str;

    /// The command handlers of the driver.
    fn commands(&self) -> &CommandTable;

    /// Validates a command before dispatch; the default accepts anything.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the command must be refused;
    /// the reason is attached to every targeted UAV.
    fn validate_command(&self, _token: &str, _body: &Value) -> Result<(), String> {
        Ok(())
    }
}

/// Transport options a command message may carry in its `transport` key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportOptions {
    /// Prefer the driver's broadcast handler over per-UAV addressing.
    pub broadcast: bool,
    /// Index of a secondary downlink channel to use.
    pub channel: Option<u32>,
    /// Target every registered driver, not just the drivers of the
    /// addressed UAVs.
    pub ignore_ids: bool,
}

impl TransportOptions {
    /// Extracts the transport options from a command body; a missing or
    /// malformed `transport` key yields the defaults.
    #[must_use]
    pub fn from_body(body: &Value) -> Self {
        body.get("transport")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }
}
