//! Connection supervision: keeps transport links alive.
//!
//! The supervisor runs one task per supervised connection. The task opens
//! the connection; when the open attempt fails, or when an established
//! connection drops back to `Disconnected` unexpectedly, it retries after
//! the backoff delay of its policy. Cancelling a supervision task is
//! immediate and terminal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::Connection;
use crate::registry::ConnectionRegistryEntry;

/// Reconnection policy of a supervised connection.
#[derive(Debug, Clone, Copy)]
pub struct SupervisionPolicy {
    /// Delay between consecutive reconnection attempts.
    pub retry_delay: Duration,
    /// Number of consecutive failed attempts after which the supervisor
    /// gives up; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for SupervisionPolicy {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            max_attempts: None,
        }
    }
}

/// Supervises connections, one task per entry.
pub struct ConnectionSupervisor {
    tasks: Mutex<HashMap<String, SupervisedTask>>,
}

struct SupervisedTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ConnectionSupervisor {
    /// Creates a supervisor with no supervised connections.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Starts supervising the connection of the given registry entry.
    ///
    /// A connection that is already supervised under the same id is
    /// re-supervised: the old task is cancelled first.
    pub fn supervise(&self, entry: &Arc<ConnectionRegistryEntry>, policy: SupervisionPolicy) {
        let id = entry.id().to_owned();
        let connection = Arc::clone(entry.connection());
        let token = CancellationToken::new();

        let task_token = token.clone();
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                () = task_token.cancelled() => {}
                () = supervise_connection(connection, task_id, policy) => {}
            }
        });

        let previous = self
            .tasks
            .lock()
            .insert(id, SupervisedTask { token, handle });
        if let Some(previous) = previous {
            previous.token.cancel();
            previous.handle.abort();
        }
    }

    /// Stops supervising the connection with the given id. Cancellation is
    /// immediate and terminal; the connection itself is left as-is.
    pub fn cancel(&self, id: &str) {
        if let Some(task) = self.tasks.lock().remove(id) {
            task.token.cancel();
        }
    }

    /// Stops every supervision task.
    pub fn cancel_all(&self) {
        for (_, task) in self.tasks.lock().drain() {
            task.token.cancel();
        }
    }

    /// Returns whether a connection with the given id is supervised.
    #[must_use]
    pub fn is_supervising(&self, id: &str) -> bool {
        self.tasks.lock().contains_key(id)
    }
}

impl Default for ConnectionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        for (_, task) in self.tasks.lock().drain() {
            task.token.cancel();
        }
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("supervised", &self.tasks.lock().len())
            .finish()
    }
}

/// The supervision loop of a single connection.
async fn supervise_connection(
    connection: Arc<dyn Connection>,
    id: String,
    policy: SupervisionPolicy,
) {
    let mut failed_attempts: u32 = 0;

    loop {
        match connection.open().await {
            Ok(()) => {
                failed_attempts = 0;
                info!(%id, "connection established");

                // Block until the connection drops, then fall through to the
                // retry path.
                wait_until_disconnected(connection.as_ref()).await;
                warn!(%id, "connection lost; scheduling reconnection");
            }
            Err(error) => {
                failed_attempts += 1;
                warn!(%id, attempt = failed_attempts, %error, "failed to open connection");
                if let Some(max_attempts) = policy.max_attempts {
                    if failed_attempts >= max_attempts {
                        warn!(%id, "giving up after {max_attempts} attempts");
                        return;
                    }
                }
            }
        }

        tokio::time::sleep(policy.retry_delay).await;
    }
}

/// Waits for the connection to report `Disconnected`, polling the change
/// signal through a oneshot-style notification.
async fn wait_until_disconnected(connection: &dyn Connection) {
    use fleetlink_core::ConnectionState;

    let notify = Arc::new(tokio::sync::Notify::new());
    let notify_hook = Arc::clone(&notify);
    let hook = connection.state_changed().connect(move |change| {
        if change.new == ConnectionState::Disconnected {
            notify_hook.notify_one();
        }
    });

    while connection.state() != ConnectionState::Disconnected {
        notify.notified().await;
    }
    hook.dispose();
}
