//! A single operator client connected to the server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

use crate::channel::CommunicationChannel;

/// Errors related to client state changes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("client is already authenticated")]
    AlreadyAuthenticated,
}

/// A connected client: a unique id, the channel it is bound to, and an
/// optional authenticated user.
///
/// The channel is bound at construction time and never rebinds; once a user
/// is authenticated it cannot be replaced.
pub struct Client {
    id: String,
    channel: Arc<dyn CommunicationChannel>,
    user: Mutex<Option<String>>,
    connected_at: Instant,
}

impl Client {
    /// Creates a client bound to the given channel.
    #[must_use]
    pub fn new(id: &str, channel: Arc<dyn CommunicationChannel>) -> Self {
        Self {
            id: id.to_owned(),
            channel,
            user: Mutex::new(None),
            connected_at: Instant::now(),
        }
    }

    /// The unique identifier of the client, assigned at construction time.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The communication channel bound to this client.
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn CommunicationChannel> {
        &self.channel
    }

    /// The authenticated user, if any.
    #[must_use]
    pub fn user(&self) -> Option<String> {
        self.user.lock().clone()
    }

    /// Records the authenticated user of this client.
    ///
    /// Re-authenticating with the same user is a no-op.
    ///
    /// # Errors
    ///
    /// Fails with [`ClientError::AlreadyAuthenticated`] when a different
    /// user is already authenticated.
    pub fn authenticate(&self, user: &str) -> Result<(), ClientError> {
        let mut slot = self.user.lock();
        match slot.as_deref() {
            Some(existing) if existing == user => Ok(()),
            Some(_) => Err(ClientError::AlreadyAuthenticated),
            None => {
                *slot = Some(user.to_owned());
                info!(id = %self.id, %user, "client authenticated");
                Ok(())
            }
        }
    }

    /// Time elapsed since the client connected.
    #[must_use]
    pub fn connection_age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("user", &self.user.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::channel::QueueChannel;

    use super::*;

    fn make_client(id: &str) -> Client {
        let (channel, _rx) = QueueChannel::new(4);
        Client::new(id, channel)
    }

    #[test]
    fn new_client_is_unauthenticated() {
        let client = make_client("client-1");
        assert_eq!(client.id(), "client-1");
        assert!(client.user().is_none());
    }

    #[test]
    fn authenticate_sets_user_once() {
        let client = make_client("client-1");
        client.authenticate("alice").unwrap();
        assert_eq!(client.user().as_deref(), Some("alice"));

        // Same user again: no-op.
        client.authenticate("alice").unwrap();

        // Different user: rejected.
        assert_eq!(
            client.authenticate("bob"),
            Err(ClientError::AlreadyAuthenticated)
        );
        assert_eq!(client.user().as_deref(), Some("alice"));
    }

    #[test]
    fn connection_age_is_monotonic() {
        let client = make_client("client-1");
        assert!(client.connection_age() <= Duration::from_secs(1));
    }
}
