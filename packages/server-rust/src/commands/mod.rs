//! Asynchronous command execution with receipts, timeouts, cancellation
//! and suspend/resume.
//!
//! The manager registers every asynchronous command as a receipt, hands the
//! receipt id back to the caller (who puts it into the response to the
//! client), and runs the command under a deadline. The terminal `finished`
//! signal fires only once the command has finished *and* the response
//! carrying the receipt id has reached the clients, so the `ASYNC-RESP`
//! notification never overtakes the receipt.

pub mod receipt;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, warn};

use fleetlink_core::Signal;

pub use receipt::{
    command_channel, CommandEvent, CommandEvents, CommandExecutionStatus, CommandFuture,
    CommandOutcome, CommandReporter,
};

/// Errors raised by the command execution manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("no such receipt: {0}")]
    NoSuchReceipt(String),
    #[error("command is not suspended: {0}")]
    NotSuspended(String),
}

/// Tracks the asynchronous commands currently executing on remote UAVs.
pub struct CommandExecutionManager {
    entries: DashMap<String, Arc<CommandExecutionStatus>>,
    timeout: Duration,
    queue_tx: mpsc::Sender<(CommandOutcome, Arc<CommandExecutionStatus>)>,
    queue_rx: Mutex<Option<mpsc::Receiver<(CommandOutcome, Arc<CommandExecutionStatus>)>>>,
    finished: Signal<Arc<CommandExecutionStatus>>,
    expired: Signal<Vec<Arc<CommandExecutionStatus>>>,
    progress_updated: Signal<Arc<CommandExecutionStatus>>,
    cancelled: Signal<Arc<CommandExecutionStatus>>,
}

impl CommandExecutionManager {
    /// Creates a manager whose commands time out after the given duration.
    #[must_use]
    pub fn new(timeout: Duration) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(256);
        Arc::new(Self {
            entries: DashMap::new(),
            timeout,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            finished: Signal::new(),
            expired: Signal::new(),
            progress_updated: Signal::new(),
            cancelled: Signal::new(),
        })
    }

    /// Signal emitted when a command finished and its clients had been
    /// notified about the receipt (triggers the terminal `ASYNC-RESP`).
    #[must_use]
    pub fn finished(&self) -> &Signal<Arc<CommandExecutionStatus>> {
        &self.finished
    }

    /// Signal emitted when one or more commands timed out (triggers
    /// `ASYNC-TIMEOUT`).
    #[must_use]
    pub fn expired(&self) -> &Signal<Vec<Arc<CommandExecutionStatus>>> {
        &self.expired
    }

    /// Signal emitted when the progress or suspension state of a command
    /// changed (triggers `ASYNC-ST`).
    #[must_use]
    pub fn progress_updated(&self) -> &Signal<Arc<CommandExecutionStatus>> {
        &self.progress_updated
    }

    /// Signal emitted when a command was cancelled on user request.
    #[must_use]
    pub fn cancelled(&self) -> &Signal<Arc<CommandExecutionStatus>> {
        &self.cancelled
    }

    /// Registers a new asynchronous command and returns its receipt.
    ///
    /// The receipt is marked as sent immediately; the caller includes its
    /// id in the response and calls [`CommandExecutionManager::mark_clients_notified`]
    /// once the response went out.
    pub async fn new_receipt(
        &self,
        outcome: CommandOutcome,
        client_to_notify: Option<&str>,
    ) -> Arc<CommandExecutionStatus> {
        let receipt = CommandExecutionStatus::new();
        receipt.mark_as_sent();
        if let Some(client_id) = client_to_notify {
            receipt.add_client_to_notify(client_id);
        }
        self.entries
            .insert(receipt.id().to_owned(), Arc::clone(&receipt));
        if self
            .queue_tx
            .send((outcome, Arc::clone(&receipt)))
            .await
            .is_err()
        {
            error!(id = %receipt.id(), "command manager is shut down; receipt will expire");
        }
        receipt
    }

    /// Returns whether the given id belongs to an active receipt.
    #[must_use]
    pub fn is_valid_receipt_id(&self, receipt_id: &str) -> bool {
        self.entries.contains_key(receipt_id)
    }

    /// Returns the receipt with the given id.
    #[must_use]
    pub fn find_by_id(&self, receipt_id: &str) -> Option<Arc<CommandExecutionStatus>> {
        self.entries
            .get(receipt_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Cancels the command with the given receipt id on user request.
    ///
    /// Returns whether the command was actually cancelled now.
    pub fn cancel(&self, receipt_id: &str) -> bool {
        let Some(receipt) = self.find_by_id(receipt_id) else {
            warn!(id = %receipt_id, "cancellation requested for non-existent receipt");
            return false;
        };
        if receipt.mark_as_cancelled(true) {
            self.cancelled.emit(&receipt);
            true
        } else {
            false
        }
    }

    /// Marks that the response carrying the receipt id reached the
    /// originating clients; together with command completion this releases
    /// the `finished` signal.
    pub fn mark_clients_notified(&self, receipt_id: &str) {
        let Some(receipt) = self.find_by_id(receipt_id) else {
            warn!(id = %receipt_id, "expired receipt marked as dispatched");
            return;
        };
        receipt.mark_as_clients_notified();
        if receipt.claim_finished_notification() {
            self.finished.emit(&receipt);
        }
    }

    /// Delivers an `ASYNC-RESUME` value into a suspended command.
    ///
    /// # Errors
    ///
    /// Fails when the receipt does not exist or the command is not
    /// suspended.
    pub fn resume(&self, receipt_id: &str, value: serde_json::Value) -> Result<(), CommandError> {
        let receipt = self
            .find_by_id(receipt_id)
            .ok_or_else(|| CommandError::NoSuchReceipt(receipt_id.to_owned()))?;
        if receipt.deliver_resume_value(value) {
            Ok(())
        } else {
            Err(CommandError::NotSuspended(receipt_id.to_owned()))
        }
    }

    /// Runs the execution and cleanup loops. The future completes only on
    /// cancellation.
    ///
    /// # Errors
    ///
    /// Fails when the manager is already running.
    pub async fn run(self: Arc<Self>, cleanup_period: Duration) -> anyhow::Result<()> {
        let Some(mut queue_rx) = self.queue_rx.lock().take() else {
            anyhow::bail!("command execution manager is already running");
        };

        let mut cleanup_timer = tokio::time::interval(cleanup_period);
        cleanup_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cleanup_timer.tick() => self.cleanup(),
                next = queue_rx.recv() => {
                    let Some((outcome, receipt)) = next else {
                        return Ok(());
                    };
                    self.execute(outcome, receipt);
                }
            }
        }
    }

    fn execute(self: &Arc<Self>, outcome: CommandOutcome, receipt: Arc<CommandExecutionStatus>) {
        match outcome {
            CommandOutcome::Success(value) => self.finish(&receipt, Ok(value)),
            CommandOutcome::Error(reason) => self.finish(&receipt, Err(reason)),
            CommandOutcome::Deferred(future) => {
                let manager = Arc::clone(self);
                tokio::spawn(async move {
                    manager.execute_deferred(receipt, future).await;
                });
            }
            CommandOutcome::Stream(events) => {
                receipt.set_resume_channel(events.resume_tx.clone());
                let manager = Arc::clone(self);
                tokio::spawn(async move {
                    manager.execute_stream(receipt, events).await;
                });
            }
        }
    }

    async fn execute_deferred(&self, receipt: Arc<CommandExecutionStatus>, future: CommandFuture) {
        let deadline = Instant::now() + self.timeout;
        let token = receipt.cancel_token().clone();

        tokio::select! {
            () = token.cancelled() => self.cancelled_by_user(&receipt),
            () = tokio::time::sleep_until(deadline) => self.timeout_receipt(&receipt),
            result = future => self.finish(&receipt, result),
        }
    }

    async fn execute_stream(&self, receipt: Arc<CommandExecutionStatus>, events: CommandEvents) {
        let deadline = Instant::now() + self.timeout;
        let token = receipt.cancel_token().clone();
        let mut events = events.events;

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    self.cancelled_by_user(&receipt);
                    return;
                }
                () = tokio::time::sleep_until(deadline) => {
                    self.timeout_receipt(&receipt);
                    return;
                }
                event = events.recv() => match event {
                    Some(CommandEvent::Progress(progress)) => {
                        receipt.set_progress(progress);
                        self.progress_updated.emit(&receipt);
                    }
                    Some(CommandEvent::Suspended(progress)) => {
                        if let Some(progress) = progress {
                            receipt.set_progress(progress);
                        }
                        receipt.set_suspended(true);
                        self.progress_updated.emit(&receipt);
                    }
                    Some(CommandEvent::Finished(result)) => {
                        self.finish(&receipt, result);
                        return;
                    }
                    None => {
                        self.finish(
                            &receipt,
                            Err("command ended without reporting a result".to_owned()),
                        );
                        return;
                    }
                },
            }
        }
    }

    fn finish(&self, receipt: &Arc<CommandExecutionStatus>, result: Result<serde_json::Value, String>) {
        // A receipt that was already purged (expired or cancelled) must not
        // produce a late ASYNC-RESP.
        if !self.entries.contains_key(receipt.id()) {
            warn!(id = %receipt.id(), "received result for an expired receipt");
            return;
        }
        if !receipt.mark_as_finished(result) {
            warn!(id = %receipt.id(), "received result for a receipt that is no longer in progress");
            return;
        }
        if receipt.claim_finished_notification() {
            self.finished.emit(receipt);
        }
    }

    /// A user cancellation removes the receipt silently; the `cancelled`
    /// signal already fired when the cancellation was requested.
    fn cancelled_by_user(&self, receipt: &Arc<CommandExecutionStatus>) {
        self.entries.remove(receipt.id());
    }

    fn timeout_receipt(&self, receipt: &Arc<CommandExecutionStatus>) {
        if self.entries.remove(receipt.id()).is_some() {
            self.expired.emit(&vec![Arc::clone(receipt)]);
        }
    }

    /// Purges receipts that finished, were cancelled, or aged out without
    /// ever finishing. The aged-out ones fire the `expired` signal
    /// collectively.
    fn cleanup(&self) {
        let now = Instant::now();
        let stale: Vec<Arc<CommandExecutionStatus>> = self
            .entries
            .iter()
            .filter(|entry| {
                let receipt = entry.value();
                !receipt.is_in_progress() || now.duration_since(receipt.created_at()) > self.timeout
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut timed_out = Vec::new();
        for receipt in stale {
            if self.entries.remove(receipt.id()).is_some() && receipt.is_in_progress() {
                timed_out.push(receipt);
            }
        }
        if !timed_out.is_empty() {
            self.expired.emit(&timed_out);
        }
    }
}

impl std::fmt::Debug for CommandExecutionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutionManager")
            .field("entries", &self.entries.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}
