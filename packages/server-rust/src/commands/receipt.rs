//! Receipts and outcomes of asynchronous commands.
//!
//! A command handler produces a [`CommandOutcome`]: an immediate value, an
//! error, a deferred computation, or a stream of [`CommandEvent`]s carrying
//! progress reports, suspensions and the final result. The execution
//! manager tracks each outcome through a [`CommandExecutionStatus`] receipt
//! whose id travels back to the client, followed later by the terminal
//! `ASYNC-RESP` notification.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use fleetlink_core::{generate_id, Progress};

/// Events produced by a streaming command handler.
#[derive(Debug)]
pub enum CommandEvent {
    /// A progress report; forwarded to clients as `ASYNC-ST`.
    Progress(Progress),
    /// The handler suspended itself and waits for a value from the client
    /// (`ASYNC-RESUME`). An accompanying progress report is optional.
    Suspended(Option<Progress>),
    /// The final result or error of the command.
    Finished(Result<Value, String>),
}

/// Future resolving to the result of a deferred command.
pub type CommandFuture = BoxFuture<'static, Result<Value, String>>;

/// The outcome a command handler hands to the execution manager.
pub enum CommandOutcome {
    /// The command finished synchronously with a result.
    Success(Value),
    /// The command failed synchronously.
    Error(String),
    /// The command runs asynchronously and resolves to a single result.
    Deferred(CommandFuture),
    /// The command runs asynchronously and reports progress, suspensions
    /// and the final result as a stream of events.
    Stream(CommandEvents),
}

impl CommandOutcome {
    /// Convenience constructor for an error outcome.
    #[must_use]
    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error(reason.into())
    }
}

impl std::fmt::Debug for CommandOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success(value) => f.debug_tuple("Success").field(value).finish(),
            Self::Error(reason) => f.debug_tuple("Error").field(reason).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Value> for CommandOutcome {
    fn from(value: Value) -> Self {
        Self::Success(value)
    }
}

impl From<Result<Value, String>> for CommandOutcome {
    fn from(result: Result<Value, String>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(reason) => Self::Error(reason),
        }
    }
}

/// Manager-side half of a streaming command: the event receiver and the
/// sender used to deliver `ASYNC-RESUME` values into the handler.
pub struct CommandEvents {
    pub(crate) events: mpsc::Receiver<CommandEvent>,
    pub(crate) resume_tx: mpsc::Sender<Value>,
}

/// Handler-side half of a streaming command.
///
/// The driver task reports progress through this handle, may suspend until
/// the client resumes it, and finishes with a result. Dropping the reporter
/// without finishing makes the manager report an error result.
pub struct CommandReporter {
    events: mpsc::Sender<CommandEvent>,
    resume_rx: mpsc::Receiver<Value>,
}

impl CommandReporter {
    /// Reports progress to the clients watching this command.
    pub async fn progress(&self, progress: Progress) {
        let _ = self.events.send(CommandEvent::Progress(progress)).await;
    }

    /// Suspends the command until the client sends `ASYNC-RESUME`, and
    /// returns the value it carried. Returns `None` when the command was
    /// cancelled while suspended.
    pub async fn suspend(&mut self, progress: Option<Progress>) -> Option<Value> {
        let _ = self.events.send(CommandEvent::Suspended(progress)).await;
        self.resume_rx.recv().await
    }

    /// Finishes the command with the given result.
    pub async fn finish(self, result: Result<Value, String>) {
        let _ = self.events.send(CommandEvent::Finished(result)).await;
    }
}

/// Creates a connected reporter/events pair for a streaming command.
#[must_use]
pub fn command_channel() -> (CommandReporter, CommandEvents) {
    let (events_tx, events_rx) = mpsc::channel(8);
    let (resume_tx, resume_rx) = mpsc::channel(1);
    (
        CommandReporter {
            events: events_tx,
            resume_rx,
        },
        CommandEvents {
            events: events_rx,
            resume_tx,
        },
    )
}

#[derive(Debug, Default)]
struct StatusInner {
    sent: bool,
    client_notified: bool,
    finished: bool,
    cancelled: bool,
    cancelled_by_user: bool,
    finished_signal_claimed: bool,
    suspended: bool,
    progress: Option<Progress>,
    result: Option<Result<Value, String>>,
    clients_to_notify: BTreeSet<String>,
    resume_tx: Option<mpsc::Sender<Value>>,
}

/// Status of one asynchronous command execution; the receipt handed back to
/// clients.
pub struct CommandExecutionStatus {
    id: String,
    created_at: Instant,
    inner: Mutex<StatusInner>,
    cancel_token: CancellationToken,
}

impl CommandExecutionStatus {
    /// Creates a receipt with a fresh id.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: generate_id(),
            created_at: Instant::now(),
            inner: Mutex::new(StatusInner::default()),
            cancel_token: CancellationToken::new(),
        })
    }

    /// The receipt id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When the receipt was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// The cancellation token wired to the executing task.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Whether the command is neither finished nor cancelled yet.
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        let inner = self.inner.lock();
        !inner.finished && !inner.cancelled
    }

    /// Whether the command was cancelled on user request.
    #[must_use]
    pub fn was_cancelled_by_user(&self) -> bool {
        let inner = self.inner.lock();
        inner.cancelled && inner.cancelled_by_user
    }

    /// Whether the receipt has been delivered to the originating clients.
    #[must_use]
    pub fn is_client_notified(&self) -> bool {
        self.inner.lock().client_notified
    }

    /// Whether the command has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// Whether the command is suspended, waiting for `ASYNC-RESUME`.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.inner.lock().suspended
    }

    /// The most recent progress report, if any.
    #[must_use]
    pub fn progress(&self) -> Option<Progress> {
        self.inner.lock().progress.clone()
    }

    /// The final result or error, once finished.
    #[must_use]
    pub fn result(&self) -> Option<Result<Value, String>> {
        self.inner.lock().result.clone()
    }

    /// Adds a client to notify when the command finishes.
    pub fn add_client_to_notify(&self, client_id: &str) {
        self.inner
            .lock()
            .clients_to_notify
            .insert(client_id.to_owned());
    }

    /// The clients to notify when the command finishes.
    #[must_use]
    pub fn clients_to_notify(&self) -> Vec<String> {
        self.inner.lock().clients_to_notify.iter().cloned().collect()
    }

    /// Marks the command as sent to the vehicle that executes it.
    pub fn mark_as_sent(&self) {
        self.inner.lock().sent = true;
    }

    /// Marks that the receipt id was delivered to the originating clients.
    pub fn mark_as_clients_notified(&self) {
        self.inner.lock().client_notified = true;
    }

    /// Marks the command as finished with the given result; a no-op when it
    /// already finished or was cancelled. Returns whether the mark was set
    /// now.
    pub fn mark_as_finished(&self, result: Result<Value, String>) -> bool {
        let mut inner = self.inner.lock();
        if inner.finished || inner.cancelled {
            return false;
        }
        inner.result = Some(result);
        inner.finished = true;
        inner.suspended = false;
        true
    }

    /// Marks the command as cancelled and fires its cancellation token; a
    /// no-op when it already finished or was cancelled. Returns whether the
    /// mark was set now.
    pub fn mark_as_cancelled(&self, by_user: bool) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.finished || inner.cancelled {
                return false;
            }
            inner.cancelled = true;
            inner.cancelled_by_user = by_user;
        }
        self.cancel_token.cancel();
        true
    }

    /// Claims the right to emit the `finished` signal for this receipt.
    ///
    /// Returns `true` exactly once, as soon as the command has finished
    /// *and* the originating clients have received the receipt id. The
    /// claim gates the terminal `ASYNC-RESP` so it always trails the
    /// response carrying the receipt.
    pub fn claim_finished_notification(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.finished && inner.client_notified && !inner.finished_signal_claimed {
            inner.finished_signal_claimed = true;
            true
        } else {
            false
        }
    }

    /// Records a progress report.
    pub fn set_progress(&self, progress: Progress) {
        self.inner.lock().progress = Some(progress);
    }

    /// Records the suspension state of the command.
    pub fn set_suspended(&self, suspended: bool) {
        self.inner.lock().suspended = suspended;
    }

    /// Stores the resume channel of a streaming command.
    pub(crate) fn set_resume_channel(&self, tx: mpsc::Sender<Value>) {
        self.inner.lock().resume_tx = Some(tx);
    }

    /// Delivers an `ASYNC-RESUME` value into the suspended handler.
    ///
    /// Returns whether the value was delivered.
    pub(crate) fn deliver_resume_value(&self, value: Value) -> bool {
        let tx = {
            let mut inner = self.inner.lock();
            if !inner.suspended {
                return false;
            }
            inner.suspended = false;
            inner.resume_tx.clone()
        };
        match tx {
            Some(tx) => tx.try_send(value).is_ok(),
            None => false,
        }
    }
}

impl std::fmt::Debug for CommandExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CommandExecutionStatus")
            .field("id", &self.id)
            .field("finished", &inner.finished)
            .field("cancelled", &inner.cancelled)
            .field("suspended", &inner.suspended)
            .finish_non_exhaustive()
    }
}
