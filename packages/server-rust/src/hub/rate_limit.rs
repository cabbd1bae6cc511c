//! Rate limiters: coalesce high-frequency status traffic into bounded
//! bursts.
//!
//! A rate limiter receives dispatch *requests* (UAV ids to report, log
//! entries to forward, connection state transitions) and decides whether and
//! when to emit an aggregated message through the shared dispatcher. The
//! [`RateLimiters`] registry maps message group names (`UAV-INF`,
//! `SYS-MSG`, `CONN-INF`, ...) to their limiter and drives all of them.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use fleetlink_core::{ConnectionState, Envelope, LogMessage};

/// Errors raised by the rate limiter registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limiters may not be added while the registry is running")]
    AlreadyRunning,
    #[error("no rate limiter registered for message group: {0}")]
    UnknownGroup(String),
}

/// A single dispatch request handed to a rate limiter.
///
/// Limiters pick the variants they understand and ignore the rest.
#[derive(Debug, Clone)]
pub enum RateLimitRequest {
    /// Ids of the objects an aggregated message should cover.
    Ids(Vec<String>),
    /// A log entry to forward in a `SYS-MSG` batch.
    Log(LogMessage),
    /// A connection state transition.
    ConnectionTransition {
        id: String,
        old: ConnectionState,
        new: ConnectionState,
    },
}

/// Sends one finished message towards the clients (usually a broadcast
/// through the message hub).
pub type Dispatcher = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Builds a single aggregated message from a batch of collected items.
pub type MessageFactory<T> = Arc<dyn Fn(Vec<T>) -> Envelope + Send + Sync>;

/// A rate limiter for one message group.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Adds a request; must not block.
    fn add_request(&self, request: RateLimitRequest);

    /// Runs the task draining this limiter. The future completes only on
    /// cancellation.
    async fn run(&self, dispatcher: Dispatcher);
}

// ---------------------------------------------------------------------------
// Bundler
// ---------------------------------------------------------------------------

/// Write-many / read-one collector.
///
/// Producers add items at any time; the limiter's own task waits until the
/// bundle is non-empty and drains it in one operation.
pub struct Bundler<T> {
    items: Mutex<Vec<T>>,
    notify: Notify,
}

impl<T> Bundler<T> {
    /// Creates an empty bundler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    /// Adds a single item.
    pub fn add(&self, item: T) {
        self.items.lock().push(item);
        self.notify.notify_one();
    }

    /// Adds several items; an empty batch does not wake the consumer.
    pub fn add_many(&self, items: impl IntoIterator<Item = T>) {
        let mut guard = self.items.lock();
        let before = guard.len();
        guard.extend(items);
        let added = guard.len() > before;
        drop(guard);
        if added {
            self.notify.notify_one();
        }
    }

    /// Discards all collected items.
    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Waits until the bundle is non-empty, then drains and returns it.
    pub async fn next_batch(&self) -> Vec<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut items = self.items.lock();
                if !items.is_empty() {
                    return std::mem::take(&mut *items);
                }
            }
            notified.await;
        }
    }
}

impl<T> Default for Bundler<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Batching limiter
// ---------------------------------------------------------------------------

/// Items a [`BatchMessageRateLimiter`] can collect.
pub trait BatchItem: Sized + Send {
    /// Extracts the items of this type from a request; other request kinds
    /// yield nothing.
    fn from_request(request: RateLimitRequest) -> Vec<Self>;

    /// Coalesces a drained batch before it is handed to the factory.
    #[must_use]
    fn coalesce(items: Vec<Self>) -> Vec<Self> {
        items
    }
}

impl BatchItem for String {
    fn from_request(request: RateLimitRequest) -> Vec<Self> {
        match request {
            RateLimitRequest::Ids(ids) => ids,
            _ => Vec::new(),
        }
    }

    /// Object ids are de-duplicated and sorted.
    fn coalesce(items: Vec<Self>) -> Vec<Self> {
        items
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl BatchItem for LogMessage {
    fn from_request(request: RateLimitRequest) -> Vec<Self> {
        match request {
            RateLimitRequest::Log(entry) => vec![entry],
            _ => Vec::new(),
        }
    }
}

/// Rate limiter that collects items and releases them in one aggregated
/// message per delay window.
///
/// Used for `UAV-INF` (ids, de-duplicated) and `SYS-MSG` (log entries, in
/// arrival order). The first bundle is dispatched immediately; consecutive
/// dispatches are at least `delay` apart.
pub struct BatchMessageRateLimiter<T: BatchItem> {
    name: String,
    factory: MessageFactory<T>,
    delay: Duration,
    bundler: Bundler<T>,
}

impl<T: BatchItem> BatchMessageRateLimiter<T> {
    /// Creates a limiter for the given message group.
    #[must_use]
    pub fn new(name: &str, factory: MessageFactory<T>, delay: Duration) -> Self {
        Self {
            name: name.to_owned(),
            factory,
            delay,
            bundler: Bundler::new(),
        }
    }
}

#[async_trait]
impl<T: BatchItem + 'static> RateLimiter for BatchMessageRateLimiter<T> {
    fn add_request(&self, request: RateLimitRequest) {
        self.bundler.add_many(T::from_request(request));
    }

    async fn run(&self, dispatcher: Dispatcher) {
        self.bundler.clear();
        loop {
            let batch = T::coalesce(self.bundler.next_batch().await);
            let message = (self.factory)(batch);
            dispatcher(message).await;
            tokio::time::sleep(self.delay).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Connection status limiter
// ---------------------------------------------------------------------------

struct SettleSignal {
    settled: AtomicBool,
    notify: Notify,
}

impl SettleSignal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            settled: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    fn notify_settled(&self) {
        self.settled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_settled() {
                return;
            }
            notified.await;
        }
    }
}

struct PendingTransition {
    last_stable: ConnectionState,
    last_stable_at: Instant,
    settle: Arc<SettleSignal>,
}

/// Specialized rate limiter for `CONN-INF` messages.
///
/// Stable states (`Connected` / `Disconnected`) are reported immediately.
/// A transitioning state starts a per-connection watcher that waits up to
/// `settle_timeout` for the connection to settle; when it settles back to
/// the previous stable state while that state is still fresh, the message
/// is suppressed entirely.
pub struct ConnectionStatusRateLimiter {
    factory: MessageFactory<String>,
    settle_timeout: Duration,
    freshness: Duration,
    tx: mpsc::Sender<(String, ConnectionState, ConnectionState)>,
    rx: Mutex<Option<mpsc::Receiver<(String, ConnectionState, ConnectionState)>>>,
}

impl ConnectionStatusRateLimiter {
    /// Creates a limiter with the given settle window and stable-state
    /// freshness window.
    #[must_use]
    pub fn new(factory: MessageFactory<String>, settle_timeout: Duration, freshness: Duration) -> Self {
        let (tx, rx) = mpsc::channel(256);
        Self {
            factory,
            settle_timeout,
            freshness,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl RateLimiter for ConnectionStatusRateLimiter {
    fn add_request(&self, request: RateLimitRequest) {
        let RateLimitRequest::ConnectionTransition { id, old, new } = request else {
            debug!("connection status limiter ignores non-transition request");
            return;
        };
        // A full queue or a stopped limiter just drops the request.
        let _ = self.tx.try_send((id, old, new));
    }

    async fn run(&self, dispatcher: Dispatcher) {
        let Some(mut rx) = self.rx.lock().take() else {
            warn!("connection status limiter is already running");
            return;
        };

        let pending: Arc<Mutex<HashMap<String, PendingTransition>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (dispatch_tx, mut dispatch_rx) = mpsc::channel::<String>(64);

        // Single consumer that serializes the actual dispatches and removes
        // the pending entry of the connection being reported.
        let dispatch_pending = Arc::clone(&pending);
        let factory = Arc::clone(&self.factory);
        let mut tasks = JoinSet::new();
        tasks.spawn(async move {
            while let Some(connection_id) = dispatch_rx.recv().await {
                dispatch_pending.lock().remove(&connection_id);
                dispatcher(factory(vec![connection_id])).await;
            }
        });

        while let Some((connection_id, old, new)) = rx.recv().await {
            let mut send = false;

            if new.is_transitioning() {
                if old.is_transitioning() {
                    // Transition to transition: report right away.
                    send = true;
                } else {
                    let mut guard = pending.lock();
                    if !guard.contains_key(&connection_id) {
                        let settle = SettleSignal::new();
                        guard.insert(
                            connection_id.clone(),
                            PendingTransition {
                                last_stable: old,
                                last_stable_at: Instant::now(),
                                settle: Arc::clone(&settle),
                            },
                        );
                        drop(guard);

                        let settle_timeout = self.settle_timeout;
                        let dispatch_tx = dispatch_tx.clone();
                        let watched_id = connection_id.clone();
                        tasks.spawn(async move {
                            let _ =
                                tokio::time::timeout(settle_timeout, settle.wait()).await;
                            if !settle.is_settled() {
                                // The state did not settle in time: report
                                // the transitioning state.
                                let _ = dispatch_tx.send(watched_id).await;
                            }
                        });
                    }
                }
            } else {
                send = true;
                let mut guard = pending.lock();
                if let Some(entry) = guard.get_mut(&connection_id) {
                    entry.settle.notify_settled();
                    if entry.last_stable == new
                        && entry.last_stable_at.elapsed() < self.freshness
                    {
                        // The connection settled back to where it was, and
                        // quickly enough: drop the whole transient.
                        send = false;
                    } else {
                        entry.last_stable = new;
                        entry.last_stable_at = Instant::now();
                    }
                }
            }

            if send {
                let _ = dispatch_tx.send(connection_id).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registry of rate limiters, keyed by message group name.
pub struct RateLimiters {
    dispatcher: Dispatcher,
    limiters: Mutex<HashMap<String, Arc<dyn RateLimiter>>>,
    running: AtomicBool,
}

impl RateLimiters {
    /// Creates a registry whose limiters emit through the given dispatcher.
    #[must_use]
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            limiters: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Registers a rate limiter for the given message group.
    ///
    /// # Errors
    ///
    /// Fails with [`RateLimitError::AlreadyRunning`] once [`RateLimiters::run`]
    /// has started; the limiter set is fixed at that point.
    pub fn register(
        &self,
        name: &str,
        limiter: Arc<dyn RateLimiter>,
    ) -> Result<(), RateLimitError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RateLimitError::AlreadyRunning);
        }
        self.limiters.lock().insert(name.to_owned(), limiter);
        Ok(())
    }

    /// Forwards a request to the limiter registered for the given group.
    ///
    /// # Errors
    ///
    /// Fails with [`RateLimitError::UnknownGroup`] when no limiter is
    /// registered under this name.
    pub fn request_to_send(
        &self,
        name: &str,
        request: RateLimitRequest,
    ) -> Result<(), RateLimitError> {
        let limiter = self
            .limiters
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| RateLimitError::UnknownGroup(name.to_owned()))?;
        limiter.add_request(request);
        Ok(())
    }

    /// Runs every registered limiter. The future completes only on
    /// cancellation.
    ///
    /// # Errors
    ///
    /// Propagates panics of limiter tasks as errors.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let limiters: Vec<Arc<dyn RateLimiter>> = self.limiters.lock().values().cloned().collect();

        let mut tasks = JoinSet::new();
        for limiter in limiters {
            let dispatcher = Arc::clone(&self.dispatcher);
            tasks.spawn(async move { limiter.run(dispatcher).await });
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(join_error) = result {
                if join_error.is_panic() {
                    error!(%join_error, "rate limiter task panicked");
                    return Err(join_error.into());
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for RateLimiters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiters")
            .field("groups", &self.limiters.lock().len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}
