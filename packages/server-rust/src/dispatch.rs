//! Fan-out of multi-target UAV commands to their drivers.
//!
//! A command message addresses a list of UAVs; the dispatch layer groups
//! the targets by driver, resolves the handler for the command token on
//! each driver, and maps the outcomes back into the per-target
//! success/error/result/receipt maps of the response body.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use fleetlink_core::ResponseBody;

use crate::commands::{CommandExecutionManager, CommandOutcome};
use crate::driver::{MultiCommandOutcome, ResolvedHandler, TransportOptions, UavDriver};
use crate::object::{as_uav, Uav};
use crate::registry::{ObjectRegistry, UavDriverRegistry};

/// Error reason attached when no handler exists for a command token.
const NOT_SUPPORTED: &str = "Operation not supported";

/// Outcome of dispatching one command message.
#[derive(Debug)]
pub struct DispatchResult {
    /// The per-target maps to merge into the response.
    pub body: ResponseBody,
    /// Receipts created for deferred outcomes; the caller marks them as
    /// client-notified once the response carrying them has been sent.
    pub receipt_ids: Vec<String>,
}

/// Routes multi-target commands to drivers and collects their outcomes.
pub struct CommandDispatcher {
    objects: Arc<ObjectRegistry>,
    drivers: Arc<UavDriverRegistry>,
    commands: Arc<CommandExecutionManager>,
}

impl CommandDispatcher {
    /// Creates a dispatcher over the given registries.
    #[must_use]
    pub fn new(
        objects: Arc<ObjectRegistry>,
        drivers: Arc<UavDriverRegistry>,
        commands: Arc<CommandExecutionManager>,
    ) -> Self {
        Self {
            objects,
            drivers,
            commands,
        }
    }

    /// Returns the UAV with the given id, if the id names a UAV.
    #[must_use]
    pub fn find_uav_by_id(&self, id: &str) -> Option<Arc<Uav>> {
        self.objects.get(id).and_then(as_uav)
    }

    /// Dispatches the command with the given token and body to the drivers
    /// of the addressed UAVs.
    ///
    /// Deferred and streaming outcomes are converted into receipts owned by
    /// the command execution manager; their terminal notification goes to
    /// `sender_id`.
    pub async fn dispatch(&self, token: &str, body: &Value, sender_id: &str) -> DispatchResult {
        let mut result = DispatchResult {
            body: ResponseBody::new(),
            receipt_ids: Vec::new(),
        };

        let ids: Vec<String> = body
            .get("ids")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        let transport = TransportOptions::from_body(body);
        let args = strip_routing_keys(body);

        // Group the targets by the driver responsible for them.
        let mut groups: HashMap<String, Vec<Arc<Uav>>> = HashMap::new();
        for id in &ids {
            match self.find_uav_by_id(id) {
                Some(uav) => groups.entry(uav.driver_id().to_owned()).or_default().push(uav),
                None => result.body.add_error(id, "no such UAV"),
            }
        }
        if transport.ignore_ids {
            for driver_id in self.drivers.ids() {
                groups.entry(driver_id).or_default();
            }
        }

        for (driver_id, uavs) in groups {
            let Some(driver) = self.drivers.get(&driver_id) else {
                for uav in &uavs {
                    result.body.add_error(uav.id(), "no such driver");
                }
                continue;
            };
            self.dispatch_to_driver(&driver, &uavs, token, &args, transport, sender_id, &mut result)
                .await;
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_to_driver(
        &self,
        driver: &Arc<dyn UavDriver>,
        uavs: &[Arc<Uav>],
        token: &str,
        args: &Value,
        transport: TransportOptions,
        sender_id: &str,
        result: &mut DispatchResult,
    ) {
        if let Err(reason) = driver.validate_command(token, args) {
            for uav in uavs {
                result.body.add_error(uav.id(), &reason);
            }
            return;
        }

        // Broadcast transport prefers the driver's broadcast handler; the
        // outcome then applies to every target in the group.
        if transport.broadcast {
            if let Some(handler) = driver.commands().resolve_broadcast(token) {
                debug!(driver = %driver.id(), %token, "dispatching as broadcast");
                let outcome = handler(args.clone());
                self.apply_shared_outcome(outcome, uavs, sender_id, result).await;
                return;
            }
        }

        match driver.commands().resolve(token) {
            None => {
                for uav in uavs {
                    result.body.add_error(uav.id(), NOT_SUPPORTED);
                }
            }
            Some(ResolvedHandler::Multi(handler)) => {
                let mut outcome = handler(uavs.to_vec(), args.clone());
                // Resolve deferred layers before mapping the results.
                loop {
                    match outcome {
                        MultiCommandOutcome::Deferred(future) => outcome = future.await,
                        MultiCommandOutcome::Shared(shared) => {
                            self.apply_shared_outcome(shared, uavs, sender_id, result).await;
                            return;
                        }
                        MultiCommandOutcome::PerUav(map) => {
                            for (uav_id, uav_outcome) in map {
                                self.apply_outcome(&uav_id, uav_outcome, sender_id, result).await;
                            }
                            return;
                        }
                    }
                }
            }
            Some(ResolvedHandler::Single(handler)) => {
                for uav in uavs {
                    let outcome = handler(Arc::clone(uav), args.clone());
                    self.apply_outcome(uav.id(), outcome, sender_id, result).await;
                }
            }
        }
    }

    /// Applies one outcome to a single target id.
    async fn apply_outcome(
        &self,
        uav_id: &str,
        outcome: CommandOutcome,
        sender_id: &str,
        result: &mut DispatchResult,
    ) {
        match outcome {
            CommandOutcome::Success(value) => result.body.add_result(uav_id, value),
            CommandOutcome::Error(reason) => result.body.add_error(uav_id, reason),
            deferred @ (CommandOutcome::Deferred(_) | CommandOutcome::Stream(_)) => {
                let receipt = self
                    .commands
                    .new_receipt(deferred, Some(sender_id))
                    .await;
                result.body.add_receipt(uav_id, receipt.id());
                result.receipt_ids.push(receipt.id().to_owned());
            }
        }
    }

    /// Applies one outcome to every target in a group.
    async fn apply_shared_outcome(
        &self,
        outcome: CommandOutcome,
        uavs: &[Arc<Uav>],
        sender_id: &str,
        result: &mut DispatchResult,
    ) {
        match outcome {
            CommandOutcome::Success(value) => {
                for uav in uavs {
                    result.body.add_result(uav.id(), value.clone());
                }
            }
            CommandOutcome::Error(reason) => {
                for uav in uavs {
                    result.body.add_error(uav.id(), &reason);
                }
            }
            CommandOutcome::Deferred(future) => {
                // A shared deferred outcome is awaited in place and its
                // result broadcast to the whole group.
                match future.await {
                    Ok(value) => {
                        for uav in uavs {
                            result.body.add_result(uav.id(), value.clone());
                        }
                    }
                    Err(reason) => {
                        for uav in uavs {
                            result.body.add_error(uav.id(), &reason);
                        }
                    }
                }
            }
            stream @ CommandOutcome::Stream(_) => {
                let receipt = self.commands.new_receipt(stream, Some(sender_id)).await;
                for uav in uavs {
                    result.body.add_receipt(uav.id(), receipt.id());
                }
                result.receipt_ids.push(receipt.id().to_owned());
            }
        }
    }
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher").finish_non_exhaustive()
    }
}

/// Removes the routing keys (`type`, `ids`) from a command body, leaving
/// the arguments for the handler. Transport options stay visible.
fn strip_routing_keys(body: &Value) -> Value {
    match body {
        Value::Object(map) => {
            let mut args: Map<String, Value> = map.clone();
            args.remove("type");
            args.remove("ids");
            Value::Object(args)
        }
        _ => Value::Object(Map::new()),
    }
}
