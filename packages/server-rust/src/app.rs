//! Application wiring: owns every core subsystem, connects their signals
//! and installs the core message handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tracing::{info, warn};

use fleetlink_core::{LogMessage, ResponseBody};

use crate::client::Client;
use crate::commands::{CommandExecutionManager, CommandExecutionStatus};
use crate::config::ServerConfig;
use crate::dispatch::CommandDispatcher;
use crate::hub::rate_limit::{
    BatchMessageRateLimiter, ConnectionStatusRateLimiter, Dispatcher, MessageFactory,
    RateLimitRequest, RateLimiters,
};
use crate::hub::{async_handler_fn, handler_fn, HandlerResult, MessageHub};
use crate::object::{as_uav, ModelObject, Uav, OBJECT_TYPE_UAV};
use crate::registry::{
    ChannelTypeRegistry, ClientRegistry, ConnectionRegistry, ObjectRegistry, RegistryError,
    UavDriverRegistry,
};
use crate::supervisor::{ConnectionSupervisor, SupervisionPolicy};
use crate::tree_subscriptions::DeviceTreeSubscriptionManager;

/// How many times a source may run into a full object registry before its
/// warnings are suppressed.
const MAX_REGISTRY_FULL_WARNINGS: u32 = 5;

/// Message types dispatched to UAV drivers, with their command tokens.
const UAV_COMMAND_TOKENS: &[(&str, &str)] = &[
    ("UAV-TAKEOFF", "takeoff"),
    ("UAV-LAND", "land"),
    ("UAV-HOVER", "hover"),
    ("UAV-RST", "reset"),
    ("UAV-HALT", "shutdown"),
    ("UAV-RTH", "return-to-home"),
    ("UAV-MOTOR", "motor"),
    ("UAV-FLY", "fly-to"),
    ("UAV-SLEEP", "enter-low-power"),
    ("UAV-WAKEUP", "resume-from-low-power"),
    ("UAV-SIGNAL", "signal"),
    ("UAV-TEST", "test"),
    ("UAV-CALIB", "calibrate"),
    ("UAV-VER", "version"),
    ("PRM-GET", "param-get"),
    ("PRM-SET", "param-set"),
    ("OBJ-CMD", "command"),
];

/// The assembled ground-control server core.
///
/// Owns the registries, the message hub, the command execution manager, the
/// rate limiters, the device tree and the connection supervisor, and keeps
/// them wired together.
pub struct ServerApp {
    config: ServerConfig,
    channel_types: Arc<ChannelTypeRegistry>,
    clients: Arc<ClientRegistry>,
    objects: Arc<ObjectRegistry>,
    connections: Arc<ConnectionRegistry>,
    drivers: Arc<UavDriverRegistry>,
    hub: Arc<MessageHub>,
    commands: Arc<CommandExecutionManager>,
    rate_limiters: Arc<RateLimiters>,
    supervisor: Arc<ConnectionSupervisor>,
    device_tree: Arc<DeviceTreeSubscriptionManager>,
    dispatcher: Arc<CommandDispatcher>,
    registry_full_counts: Mutex<HashMap<String, u32>>,
}

impl ServerApp {
    /// Builds the server core from the given configuration, wiring every
    /// subsystem together.
    #[must_use]
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let channel_types = Arc::new(ChannelTypeRegistry::new());
        let clients = Arc::new(ClientRegistry::new(Arc::clone(&channel_types)));
        let objects = Arc::new(ObjectRegistry::new());
        objects.set_size_limit(config.object_registry_size_limit);
        let connections = Arc::new(ConnectionRegistry::new());
        let drivers = Arc::new(UavDriverRegistry::new());

        let hub = MessageHub::new(config.outbound_queue_capacity);
        hub.set_channel_type_registry(Arc::clone(&channel_types));
        hub.set_client_registry(Arc::clone(&clients));

        let commands = CommandExecutionManager::new(config.command_timeout);
        let device_tree = Arc::new(DeviceTreeSubscriptionManager::new(Arc::clone(&hub)));
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&objects),
            Arc::clone(&drivers),
            Arc::clone(&commands),
        ));

        let broadcast: Dispatcher = {
            let hub = Arc::clone(&hub);
            Arc::new(move |message| {
                let hub = Arc::clone(&hub);
                async move {
                    hub.broadcast_message(message).await;
                }
                .boxed()
            })
        };
        let rate_limiters = Arc::new(RateLimiters::new(broadcast));

        let app = Arc::new(Self {
            config,
            channel_types,
            clients,
            objects,
            connections,
            drivers,
            hub,
            commands,
            rate_limiters,
            supervisor: Arc::new(ConnectionSupervisor::new()),
            device_tree,
            dispatcher,
            registry_full_counts: Mutex::new(HashMap::new()),
        });

        app.register_rate_limiters();
        app.wire_signals();
        app.install_handlers();
        app
    }

    // -----------------------------------------------------------------------
    // Component accessors
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn channel_types(&self) -> &Arc<ChannelTypeRegistry> {
        &self.channel_types
    }

    #[must_use]
    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    #[must_use]
    pub fn objects(&self) -> &Arc<ObjectRegistry> {
        &self.objects
    }

    #[must_use]
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    #[must_use]
    pub fn drivers(&self) -> &Arc<UavDriverRegistry> {
        &self.drivers
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<MessageHub> {
        &self.hub
    }

    #[must_use]
    pub fn commands(&self) -> &Arc<CommandExecutionManager> {
        &self.commands
    }

    #[must_use]
    pub fn rate_limiters(&self) -> &Arc<RateLimiters> {
        &self.rate_limiters
    }

    #[must_use]
    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    #[must_use]
    pub fn device_tree(&self) -> &Arc<DeviceTreeSubscriptionManager> {
        &self.device_tree
    }

    #[must_use]
    pub fn command_dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Runs the hub, the command manager and the rate limiters until the
    /// shutdown future resolves.
    ///
    /// # Errors
    ///
    /// Propagates the failure of any core task.
    pub async fn run(
        self: Arc<Self>,
        shutdown: impl std::future::Future<Output = ()> + Send,
    ) -> anyhow::Result<()> {
        let mut tasks = JoinSet::new();
        tasks.spawn(Arc::clone(&self.hub).run());
        tasks.spawn(Arc::clone(&self.commands).run(self.config.command_cleanup_period));
        {
            let rate_limiters = Arc::clone(&self.rate_limiters);
            tasks.spawn(async move { rate_limiters.run().await });
        }

        let result = tokio::select! {
            () = shutdown => Ok(()),
            joined = tasks.join_next() => match joined {
                Some(Ok(result)) => result,
                Some(Err(join_error)) => Err(join_error.into()),
                None => Ok(()),
            },
        };
        self.supervisor.cancel_all();
        tasks.shutdown().await;
        result
    }

    /// Connects a new client over the given channel type.
    ///
    /// # Errors
    ///
    /// Fails when the channel type is unknown.
    pub fn new_client(&self, client_id: &str, channel_type: &str) -> Result<Arc<Client>, RegistryError> {
        self.clients.add(client_id, channel_type)
    }

    /// Disconnects a client, closing its channel and dropping its
    /// subscriptions.
    pub async fn disconnect_client(&self, client_id: &str, reason: &str) {
        let Some(client) = self.clients.remove(client_id) else {
            return;
        };
        info!(id = %client_id, %reason, "disconnecting client");
        let _ = client.channel().close().await;
    }

    /// Returns the UAV with the given id, registering a fresh one owned by
    /// the given driver when the id is not tracked yet. Drivers call this
    /// as they discover vehicles.
    ///
    /// # Errors
    ///
    /// Fails with [`RegistryError::Full`] when the registry has no free
    /// slot (counted against the driver's warning allowance) and with
    /// [`RegistryError::IdTaken`] when the id belongs to a non-UAV object.
    pub fn find_or_register_uav(
        &self,
        uav_id: &str,
        driver_id: &str,
    ) -> Result<Arc<Uav>, RegistryError> {
        let object = match self
            .objects
            .add_if_missing(uav_id, |id| Arc::new(Uav::new(id, driver_id)))
        {
            Ok(object) => object,
            Err(RegistryError::Full) => {
                self.handle_registry_full(driver_id);
                return Err(RegistryError::Full);
            }
            Err(error) => return Err(error),
        };
        as_uav(object).ok_or_else(|| RegistryError::IdTaken(uav_id.to_owned()))
    }

    /// Supervises a registered connection with the configured backoff
    /// policy.
    pub fn supervise_connection(&self, connection_id: &str) {
        if let Some(entry) = self.connections.get(connection_id) {
            self.supervisor.supervise(
                &entry,
                SupervisionPolicy {
                    retry_delay: self.config.supervisor_retry_delay,
                    max_attempts: self.config.supervisor_max_attempts,
                },
            );
        }
    }

    // -----------------------------------------------------------------------
    // Requests to send rate-limited notifications
    // -----------------------------------------------------------------------

    /// Asks for a `UAV-INF` notification covering the given UAVs, subject
    /// to rate limiting.
    pub fn request_to_send_uav_inf(&self, uav_ids: impl IntoIterator<Item = String>) {
        let _ = self
            .rate_limiters
            .request_to_send("UAV-INF", RateLimitRequest::Ids(uav_ids.into_iter().collect()));
    }

    /// Asks for a `SYS-MSG` notification forwarding the given log entry,
    /// subject to rate limiting.
    pub fn request_to_send_sys_msg(&self, entry: LogMessage) {
        let _ = self
            .rate_limiters
            .request_to_send("SYS-MSG", RateLimitRequest::Log(entry));
    }

    /// Counts a registry-full refusal from the given source; logs a warning
    /// for the first few occurrences per source, then goes quiet.
    ///
    /// Returns whether a warning was logged.
    pub fn handle_registry_full(&self, source: &str) -> bool {
        let mut counts = self.registry_full_counts.lock();
        let count = counts.entry(source.to_owned()).or_insert(0);
        *count += 1;
        match *count {
            count if count < MAX_REGISTRY_FULL_WARNINGS => {
                warn!(%source, "object registry is full; object not registered");
                true
            }
            MAX_REGISTRY_FULL_WARNINGS => {
                warn!(
                    %source,
                    "object registry is full; suppressing further warnings from this source"
                );
                true
            }
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Message body factories
    // -----------------------------------------------------------------------

    /// Builds a `UAV-INF` body with the status of the given UAVs; unknown
    /// ids are recorded in the error map.
    #[must_use]
    pub fn create_uav_inf_body(&self, uav_ids: &[String]) -> ResponseBody {
        let mut body = ResponseBody::with_type("UAV-INF");
        let mut status = Map::new();
        let is_uav = |object: &Arc<dyn ModelObject>| object.object_type() == OBJECT_TYPE_UAV;
        for id in uav_ids {
            let Some(object) =
                self.objects
                    .find_by_id(id, Some(&is_uav), Some(&mut body), "no such UAV")
            else {
                continue;
            };
            let Some(uav) = as_uav(object) else {
                body.add_error(id, "no such UAV");
                continue;
            };
            match serde_json::to_value(uav.status()) {
                Ok(value) => {
                    status.insert(id.clone(), value);
                }
                Err(error) => body.add_error(id, error),
            }
        }
        body.insert("status", Value::Object(status));
        body
    }

    /// Builds a `CONN-INF` body with the status of the given connections;
    /// unknown ids are recorded in the error map.
    #[must_use]
    pub fn create_conn_inf_body(&self, connection_ids: &[String]) -> ResponseBody {
        let mut body = ResponseBody::with_type("CONN-INF");
        let mut status = Map::new();
        for id in connection_ids {
            let Some(entry) =
                self.connections
                    .find_by_id(id, Some(&mut body), "no such connection")
            else {
                continue;
            };
            match serde_json::to_value(entry.info()) {
                Ok(value) => {
                    status.insert(id.clone(), value);
                }
                Err(error) => body.add_error(id, error),
            }
        }
        body.insert("status", Value::Object(status));
        body
    }

    // -----------------------------------------------------------------------
    // Wiring
    // -----------------------------------------------------------------------

    fn register_rate_limiters(self: &Arc<Self>) {
        let delay = self.config.rate_limit_delay;

        let uav_inf_factory: MessageFactory<String> = {
            let app = Arc::downgrade(self);
            let builder = self.hub.builder().clone();
            Arc::new(move |ids| {
                let body = match app.upgrade() {
                    Some(app) => app.create_uav_inf_body(&ids).into_value(),
                    None => json!({ "type": "UAV-INF" }),
                };
                builder.create_notification(body)
            })
        };
        let _ = self.rate_limiters.register(
            "UAV-INF",
            Arc::new(BatchMessageRateLimiter::<String>::new(
                "UAV-INF",
                uav_inf_factory,
                delay,
            )),
        );

        let sys_msg_factory: MessageFactory<LogMessage> = {
            let builder = self.hub.builder().clone();
            Arc::new(move |entries| {
                builder.create_notification(json!({ "type": "SYS-MSG", "items": entries }))
            })
        };
        let _ = self.rate_limiters.register(
            "SYS-MSG",
            Arc::new(BatchMessageRateLimiter::<LogMessage>::new(
                "SYS-MSG",
                sys_msg_factory,
                delay,
            )),
        );

        let conn_inf_factory: MessageFactory<String> = {
            let app = Arc::downgrade(self);
            let builder = self.hub.builder().clone();
            Arc::new(move |ids| {
                let body = match app.upgrade() {
                    Some(app) => app.create_conn_inf_body(&ids).into_value(),
                    None => json!({ "type": "CONN-INF" }),
                };
                builder.create_notification(body)
            })
        };
        let _ = self.rate_limiters.register(
            "CONN-INF",
            Arc::new(ConnectionStatusRateLimiter::new(
                conn_inf_factory,
                self.config.connection_settle_timeout,
                self.config.stable_state_freshness,
            )),
        );
    }

    fn wire_signals(self: &Arc<Self>) {
        // Command finished -> terminal ASYNC-RESP per interested client.
        let hub = Arc::clone(&self.hub);
        self.commands
            .finished()
            .connect(move |receipt| {
                let message = hub.create_notification(async_resp_body(receipt));
                for client_id in receipt.clients_to_notify() {
                    hub.enqueue_to(message.clone(), client_id);
                }
            })
            .detach();

        // Progress or suspension -> ASYNC-ST per interested client.
        let hub = Arc::clone(&self.hub);
        self.commands
            .progress_updated()
            .connect(move |receipt| {
                let mut body = Map::new();
                body.insert("type".to_owned(), json!("ASYNC-ST"));
                body.insert("id".to_owned(), json!(receipt.id()));
                if let Some(progress) = receipt.progress() {
                    body.insert("progress".to_owned(), json!(progress));
                }
                if receipt.is_suspended() {
                    body.insert("suspended".to_owned(), json!(true));
                }
                let message = hub.create_notification(Value::Object(body));
                for client_id in receipt.clients_to_notify() {
                    hub.enqueue_to(message.clone(), client_id);
                }
            })
            .detach();

        // Timeouts -> one ASYNC-TIMEOUT per client with the receipt ids
        // grouped per client.
        let hub = Arc::clone(&self.hub);
        self.commands
            .expired()
            .connect(move |receipts| {
                let mut per_client: HashMap<String, Vec<String>> = HashMap::new();
                for receipt in receipts {
                    for client_id in receipt.clients_to_notify() {
                        per_client
                            .entry(client_id)
                            .or_default()
                            .push(receipt.id().to_owned());
                    }
                }
                for (client_id, receipt_ids) in per_client {
                    let message = hub
                        .create_notification(json!({ "type": "ASYNC-TIMEOUT", "ids": receipt_ids }));
                    hub.enqueue_to(message, client_id);
                }
            })
            .detach();

        // Object lifecycle -> device tree attachment and OBJ-DEL broadcast.
        let device_tree = Arc::clone(&self.device_tree);
        self.objects
            .added()
            .connect(move |event| {
                device_tree.with_tree_mut(|tree| {
                    if let Err(error) = tree.add_object(&event.id) {
                        warn!(id = %event.id, %error, "could not attach object to device tree");
                    }
                });
            })
            .detach();

        let device_tree = Arc::clone(&self.device_tree);
        let hub = Arc::clone(&self.hub);
        self.objects
            .removed()
            .connect(move |event| {
                device_tree.with_tree_mut(|tree| {
                    let _ = tree.remove_object(&event.id);
                });
                let message =
                    hub.create_notification(json!({ "type": "OBJ-DEL", "ids": [event.id] }));
                hub.enqueue_broadcast(message);
            })
            .detach();

        // Connection removal -> CONN-DEL broadcast.
        let hub = Arc::clone(&self.hub);
        self.connections
            .removed()
            .connect(move |event| {
                let message =
                    hub.create_notification(json!({ "type": "CONN-DEL", "ids": [event.id] }));
                hub.enqueue_broadcast(message);
            })
            .detach();

        // Connection state changes feed the CONN-INF rate limiter.
        let rate_limiters = Arc::clone(&self.rate_limiters);
        self.connections
            .connection_state_changed()
            .connect(move |event| {
                let _ = rate_limiters.request_to_send(
                    "CONN-INF",
                    RateLimitRequest::ConnectionTransition {
                        id: event.id.clone(),
                        old: event.old,
                        new: event.new,
                    },
                );
            })
            .detach();

        // Client disconnect cascades to device-tree unsubscription.
        let device_tree = Arc::clone(&self.device_tree);
        self.clients
            .removed()
            .connect(move |event| {
                device_tree.remove_client(&event.id);
            })
            .detach();
    }

    #[allow(clippy::too_many_lines)]
    fn install_handlers(self: &Arc<Self>) {
        let hub = &self.hub;

        // SYS-PING: positive acknowledgment.
        hub.register_message_handler(
            Some(&["SYS-PING"]),
            handler_fn(|message, _sender, hub| {
                HandlerResult::Response(hub.acknowledge(message))
            }),
        )
        .detach();

        // SYS-VER: server name and version.
        let config = self.config.clone();
        hub.register_message_handler(
            Some(&["SYS-VER"]),
            handler_fn(move |_message, _sender, _hub| {
                HandlerResult::Body(json!({
                    "software": config.server_name,
                    "version": config.server_version,
                }))
            }),
        )
        .detach();

        // SYS-TIME: query returns the epoch milliseconds; setting the clock
        // is refused.
        hub.register_message_handler(
            Some(&["SYS-TIME"]),
            handler_fn(|message, _sender, hub| {
                if message.body.get("adjustment").is_some()
                    || message.body.get("timestamp").is_some()
                {
                    return HandlerResult::Response(
                        hub.reject(message, Some("Setting the server time is not supported")),
                    );
                }
                HandlerResult::Body(json!({ "timestamp": epoch_ms() }))
            }),
        )
        .detach();

        // SYS-PORTS: where each channel type can be reached, as reported by
        // the transports themselves.
        let channel_types = Arc::clone(&self.channel_types);
        hub.register_message_handler(
            Some(&["SYS-PORTS"]),
            handler_fn(move |_message, _sender, _hub| {
                let mut ports = Map::new();
                for descriptor in channel_types.descriptors() {
                    let location = descriptor
                        .get_ssdp_location(None)
                        .map_or(Value::Null, Value::String);
                    ports.insert(descriptor.id.clone(), location);
                }
                HandlerResult::Body(json!({ "ports": ports }))
            }),
        )
        .detach();

        // SYS-CLOSE: the client asks to be disconnected; acknowledge first,
        // then close once the acknowledgment went out.
        let app = Arc::downgrade(self);
        hub.register_message_handler(
            Some(&["SYS-CLOSE"]),
            async_handler_fn(move |message, sender, hub| {
                let app = app.clone();
                async move {
                    let sent = hub
                        .send_response(json!({ "type": "ACK-ACK" }), &sender, &message)
                        .await;
                    let client_id = sender.id().to_owned();
                    sent.on_sent(move || {
                        if let Some(app) = app.upgrade() {
                            tokio::spawn(async move {
                                app.disconnect_client(&client_id, "requested by client").await;
                            });
                        }
                    });
                    HandlerResult::Handled
                }
            }),
        )
        .detach();

        // SYS-MSG from a client: forward the entries through the rate
        // limiter and acknowledge.
        let app = Arc::downgrade(self);
        hub.register_message_handler(
            Some(&["SYS-MSG"]),
            handler_fn(move |message, _sender, hub| {
                if let Some(app) = app.upgrade() {
                    let entries = message
                        .body
                        .get("items")
                        .and_then(Value::as_array)
                        .into_iter()
                        .flatten();
                    for entry in entries {
                        if let Ok(entry) = serde_json::from_value::<LogMessage>(entry.clone()) {
                            app.request_to_send_sys_msg(entry);
                        }
                    }
                }
                HandlerResult::Response(hub.acknowledge(message))
            }),
        )
        .detach();

        // UAV-LIST: ids of all registered UAVs.
        let objects = Arc::clone(&self.objects);
        hub.register_message_handler(
            Some(&["UAV-LIST"]),
            handler_fn(move |_message, _sender, _hub| {
                HandlerResult::Body(json!({ "ids": objects.ids_by_type("uav") }))
            }),
        )
        .detach();

        // UAV-INF: status of the requested UAVs.
        let app = Arc::downgrade(self);
        hub.register_message_handler(
            Some(&["UAV-INF"]),
            handler_fn(move |message, _sender, _hub| {
                match app.upgrade() {
                    Some(app) => HandlerResult::Body(
                        app.create_uav_inf_body(&message.ids()).into_value(),
                    ),
                    None => HandlerResult::Ignored,
                }
            }),
        )
        .detach();

        // OBJ-LIST: ids of the tracked objects, optionally filtered by type
        // tags.
        let objects = Arc::clone(&self.objects);
        hub.register_message_handler(
            Some(&["OBJ-LIST"]),
            handler_fn(move |message, _sender, _hub| {
                let filter: Vec<String> = message
                    .body
                    .get("filter")
                    .and_then(Value::as_array)
                    .map(|tags| {
                        tags.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_owned)
                            .collect()
                    })
                    .unwrap_or_default();
                let ids = if filter.is_empty() {
                    objects.ids()
                } else {
                    objects.ids_by_types(&filter)
                };
                HandlerResult::Body(json!({ "ids": ids }))
            }),
        )
        .detach();

        // CONN-LIST / CONN-INF: connection inventory and status.
        let connections = Arc::clone(&self.connections);
        hub.register_message_handler(
            Some(&["CONN-LIST"]),
            handler_fn(move |_message, _sender, _hub| {
                HandlerResult::Body(json!({ "ids": connections.ids() }))
            }),
        )
        .detach();

        let app = Arc::downgrade(self);
        hub.register_message_handler(
            Some(&["CONN-INF"]),
            handler_fn(move |message, _sender, _hub| {
                match app.upgrade() {
                    Some(app) => HandlerResult::Body(
                        app.create_conn_inf_body(&message.ids()).into_value(),
                    ),
                    None => HandlerResult::Ignored,
                }
            }),
        )
        .detach();

        // DEV-LIST / DEV-INF: device tree structure and channel values.
        let device_tree = Arc::clone(&self.device_tree);
        hub.register_message_handler(
            Some(&["DEV-LIST"]),
            handler_fn(move |message, _sender, _hub| {
                HandlerResult::Body(device_tree.create_dev_list_body(&message.ids()).into_value())
            }),
        )
        .detach();

        let device_tree = Arc::clone(&self.device_tree);
        hub.register_message_handler(
            Some(&["DEV-INF"]),
            handler_fn(move |message, _sender, _hub| {
                HandlerResult::Body(
                    device_tree
                        .create_dev_inf_body(&body_paths(&message.body))
                        .into_value(),
                )
            }),
        )
        .detach();

        // DEV-SUB / DEV-UNSUB / DEV-LISTSUB: subscription management.
        let device_tree = Arc::clone(&self.device_tree);
        hub.register_message_handler(
            Some(&["DEV-SUB"]),
            handler_fn(move |message, sender, _hub| {
                let mut body = ResponseBody::new();
                for path in body_paths(&message.body) {
                    match device_tree.subscribe(sender.id(), &path) {
                        Ok(()) => body.add_success(&path),
                        Err(error) => body.add_error(&path, error),
                    }
                }
                HandlerResult::Body(body.into_value())
            }),
        )
        .detach();

        let device_tree = Arc::clone(&self.device_tree);
        hub.register_message_handler(
            Some(&["DEV-UNSUB"]),
            handler_fn(move |message, sender, _hub| {
                let force = message
                    .body
                    .get("removeAll")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let include_subtrees = message
                    .body
                    .get("includeSubtrees")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let paths = body_paths(&message.body);
                let mut body = ResponseBody::new();
                if include_subtrees {
                    // The paths act as a filter: every subscription in their
                    // subtrees is removed.
                    match device_tree.unsubscribe_subtree(sender.id(), &paths, force) {
                        Ok(removed) => {
                            for path in removed {
                                body.add_success(&path);
                            }
                        }
                        Err(error) => {
                            for path in &paths {
                                body.add_error(path, &error);
                            }
                        }
                    }
                } else {
                    for path in paths {
                        match device_tree.unsubscribe(sender.id(), &path, force) {
                            Ok(()) => body.add_success(&path),
                            Err(error) => body.add_error(&path, error),
                        }
                    }
                }
                HandlerResult::Body(body.into_value())
            }),
        )
        .detach();

        let device_tree = Arc::clone(&self.device_tree);
        hub.register_message_handler(
            Some(&["DEV-LISTSUB"]),
            handler_fn(move |message, sender, _hub| {
                let filter: Vec<String> = message
                    .body
                    .get("pathFilter")
                    .and_then(Value::as_array)
                    .map(|paths| {
                        paths
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_owned)
                            .collect()
                    })
                    .unwrap_or_default();
                match device_tree.list_subscriptions(sender.id(), &filter) {
                    Ok(subscriptions) => {
                        HandlerResult::Body(json!({ "subscriptions": subscriptions }))
                    }
                    Err(error) => {
                        let mut body = ResponseBody::new();
                        for path in &filter {
                            body.add_error(path, &error);
                        }
                        HandlerResult::Body(body.into_value())
                    }
                }
            }),
        )
        .detach();

        // ASYNC-CANCEL / ASYNC-RESUME: receipt lifecycle requests.
        let commands = Arc::clone(&self.commands);
        hub.register_message_handler(
            Some(&["ASYNC-CANCEL"]),
            handler_fn(move |message, _sender, _hub| {
                let mut body = ResponseBody::new();
                let mut to_cancel = Vec::new();
                for receipt_id in message.ids() {
                    if commands.is_valid_receipt_id(&receipt_id) {
                        body.add_success(&receipt_id);
                        to_cancel.push(receipt_id);
                    } else {
                        body.add_error(&receipt_id, "no such receipt");
                    }
                }
                for receipt_id in to_cancel {
                    commands.cancel(&receipt_id);
                }
                HandlerResult::Body(body.into_value())
            }),
        )
        .detach();

        let commands = Arc::clone(&self.commands);
        hub.register_message_handler(
            Some(&["ASYNC-RESUME"]),
            handler_fn(move |message, _sender, _hub| {
                let values = message
                    .body
                    .get("values")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let mut body = ResponseBody::new();
                for receipt_id in message.ids() {
                    let value = values.get(&receipt_id).cloned().unwrap_or(Value::Null);
                    match commands.resume(&receipt_id, value) {
                        Ok(()) => body.add_success(&receipt_id),
                        Err(error) => body.add_error(&receipt_id, error),
                    }
                }
                HandlerResult::Body(body.into_value())
            }),
        )
        .detach();

        // Multi-target UAV commands.
        for (message_type, token) in UAV_COMMAND_TOKENS.iter().copied() {
            let dispatcher = Arc::clone(&self.dispatcher);
            let commands = Arc::clone(&self.commands);
            hub.register_message_handler(
                Some(&[message_type]),
                async_handler_fn(move |message, sender, hub| {
                    let dispatcher = Arc::clone(&dispatcher);
                    let commands = Arc::clone(&commands);
                    async move {
                        let result = dispatcher.dispatch(token, &message.body, sender.id()).await;
                        let sent = hub
                            .send_response(result.body.into_value(), &sender, &message)
                            .await;
                        // The terminal ASYNC-RESP of each receipt may only go
                        // out once the response carrying the receipt ids has
                        // been dispatched.
                        let receipt_ids = result.receipt_ids;
                        sent.on_sent(move || {
                            for receipt_id in &receipt_ids {
                                commands.mark_clients_notified(receipt_id);
                            }
                        });
                        HandlerResult::Handled
                    }
                }),
            )
            .detach();
        }
    }
}

impl std::fmt::Debug for ServerApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerApp")
            .field("clients", &self.clients.len())
            .field("objects", &self.objects.len())
            .finish_non_exhaustive()
    }
}

/// Builds the terminal `ASYNC-RESP` body of a finished receipt.
fn async_resp_body(receipt: &Arc<CommandExecutionStatus>) -> Value {
    let mut body = Map::new();
    body.insert("type".to_owned(), json!("ASYNC-RESP"));
    body.insert("id".to_owned(), json!(receipt.id()));
    match receipt.result() {
        Some(Ok(result)) => {
            body.insert("result".to_owned(), result);
        }
        Some(Err(error)) => {
            body.insert("error".to_owned(), json!(error));
        }
        None => {}
    }
    Value::Object(body)
}

fn body_paths(body: &Value) -> Vec<String> {
    body.get("paths")
        .and_then(Value::as_array)
        .map(|paths| {
            paths
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Registers a UAV in the object registry, reporting registry-full
/// refusals through the app's suppressed warning counter.
///
/// # Errors
///
/// Propagates the registry error.
pub fn register_uav(app: &ServerApp, uav: Arc<Uav>) -> Result<(), RegistryError> {
    let source = uav.driver_id().to_owned();
    match app.objects().add(uav as Arc<dyn ModelObject>) {
        Err(RegistryError::Full) => {
            app.handle_registry_full(&source);
            Err(RegistryError::Full)
        }
        other => other,
    }
}
