//! Links between the server and external data sources (radios, serial
//! ports, simulators).
//!
//! Concrete transports implement [`Connection`]; the core supervises them
//! (see [`crate::supervisor`]) and reports their state to clients through
//! `CONN-INF` messages. [`ConnectionStateCell`] is the building block
//! implementations use to hold their state: it enforces the legal state
//! machine and fires the `state_changed` signal.

use async_trait::async_trait;
use parking_lot::Mutex;

use fleetlink_core::{ConnectionState, Signal};

/// Payload of the `state_changed` signal of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateChange {
    pub old: ConnectionState,
    pub new: ConnectionState,
}

/// Errors raised by connection state handling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("illegal connection state transition: {old:?} -> {new:?}")]
    IllegalTransition {
        old: ConnectionState,
        new: ConnectionState,
    },
}

/// A supervised link to an external data source.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens the connection, driving the state through `Connecting` to
    /// `Connected` (or back to `Disconnected` on failure).
    ///
    /// # Errors
    ///
    /// Returns a transport-specific error when the link cannot be
    /// established.
    async fn open(&self) -> anyhow::Result<()>;

    /// Closes the connection, driving the state through `Disconnecting` to
    /// `Disconnected`.
    ///
    /// # Errors
    ///
    /// Returns a transport-specific error when teardown fails.
    async fn close(&self) -> anyhow::Result<()>;

    /// The current state of the connection.
    fn state(&self) -> ConnectionState;

    /// Signal fired on every state change.
    fn state_changed(&self) -> &Signal<ConnectionStateChange>;
}

/// Holds the state of a connection and enforces the legal state machine:
/// `Disconnected -> Connecting -> Connected -> Disconnecting ->
/// Disconnected`, with transitioning states allowed to fall back to the
/// stable state they came from.
#[derive(Debug)]
pub struct ConnectionStateCell {
    state: Mutex<ConnectionState>,
    changed: Signal<ConnectionStateChange>,
    connected: tokio::sync::watch::Sender<bool>,
}

impl ConnectionStateCell {
    /// Creates a cell in the `Disconnected` state.
    #[must_use]
    pub fn new() -> Self {
        let (connected, _) = tokio::sync::watch::channel(false);
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            changed: Signal::new(),
            connected,
        }
    }

    /// The current state.
    #[must_use]
    pub fn get(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Transitions to a new state, firing the change signal.
    ///
    /// # Errors
    ///
    /// Fails with [`ConnectionError::IllegalTransition`] when the state
    /// machine forbids the step. A transition to the current state is a
    /// no-op.
    pub fn set(&self, new: ConnectionState) -> Result<(), ConnectionError> {
        let old = {
            let mut state = self.state.lock();
            let old = *state;
            if old == new {
                return Ok(());
            }
            if !old.can_transition_to(new) {
                return Err(ConnectionError::IllegalTransition { old, new });
            }
            *state = new;
            old
        };
        let _ = self.connected.send(new == ConnectionState::Connected);
        self.changed.emit(&ConnectionStateChange { old, new });
        Ok(())
    }

    /// The change signal of this cell.
    #[must_use]
    pub fn changed(&self) -> &Signal<ConnectionStateChange> {
        &self.changed
    }

    /// Waits until the state becomes (or already is) `Disconnected`.
    pub async fn wait_until_disconnected(&self) {
        let mut rx = self.connected.subscribe();
        loop {
            if self.get() == ConnectionState::Disconnected {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for ConnectionStateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fleetlink_core::ConnectionState::{Connected, Connecting, Disconnected, Disconnecting};

    use super::*;

    #[test]
    fn starts_disconnected() {
        let cell = ConnectionStateCell::new();
        assert_eq!(cell.get(), Disconnected);
    }

    #[test]
    fn full_cycle_is_accepted() {
        let cell = ConnectionStateCell::new();
        for state in [Connecting, Connected, Disconnecting, Disconnected] {
            cell.set(state).unwrap();
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn skipping_forward_is_rejected() {
        let cell = ConnectionStateCell::new();
        assert_eq!(
            cell.set(Connected),
            Err(ConnectionError::IllegalTransition {
                old: Disconnected,
                new: Connected,
            })
        );
        assert_eq!(cell.get(), Disconnected);
    }

    #[test]
    fn same_state_is_a_silent_no_op() {
        let cell = ConnectionStateCell::new();
        let changes = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let changes_clone = Arc::clone(&changes);
        cell.changed()
            .connect(move |change| changes_clone.lock().push(*change))
            .detach();

        cell.set(Disconnected).unwrap();
        assert!(changes.lock().is_empty());
    }

    #[test]
    fn change_signal_carries_old_and_new_state() {
        let cell = ConnectionStateCell::new();
        let changes = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let changes_clone = Arc::clone(&changes);
        cell.changed()
            .connect(move |change| changes_clone.lock().push(*change))
            .detach();

        cell.set(Connecting).unwrap();
        cell.set(Connected).unwrap();

        let recorded = changes.lock().clone();
        assert_eq!(
            recorded,
            vec![
                ConnectionStateChange {
                    old: Disconnected,
                    new: Connecting,
                },
                ConnectionStateChange {
                    old: Connecting,
                    new: Connected,
                },
            ]
        );
    }

    #[tokio::test]
    async fn wait_until_disconnected_returns_on_transition() {
        let cell = Arc::new(ConnectionStateCell::new());
        cell.set(Connecting).unwrap();
        cell.set(Connected).unwrap();

        let waiter = {
            let cell = Arc::clone(&cell);
            tokio::spawn(async move { cell.wait_until_disconnected().await })
        };

        cell.set(Disconnecting).unwrap();
        cell.set(Disconnected).unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn wait_until_disconnected_returns_immediately_when_down() {
        let cell = ConnectionStateCell::new();
        cell.wait_until_disconnected().await;
    }
}
