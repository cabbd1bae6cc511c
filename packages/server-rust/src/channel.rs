//! Communication channel abstraction between the server and one client.
//!
//! Concrete transports (TCP, WebSocket, Unix socket, ...) live outside the
//! core; they plug in by implementing [`CommunicationChannel`] and
//! registering a factory in the channel-type registry. The core ships
//! [`QueueChannel`], an in-process implementation backed by a bounded mpsc
//! channel, which transports with a dedicated write loop can reuse directly
//! and which the test suite uses as its client endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use fleetlink_core::Envelope;

/// Errors raised when talking to a client channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The peer is gone; the message cannot be delivered. Senders treat this
    /// as a non-fatal condition.
    #[error("client is gone")]
    ClientGone,
    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// One bidirectional message channel bound to a single client.
///
/// Implementations must serialize concurrent `send` calls so that frames
/// are emitted atomically per client.
#[async_trait]
pub trait CommunicationChannel: Send + Sync + std::fmt::Debug {
    /// Sends a single message to the client.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ClientGone`] when the peer has disconnected.
    async fn send(&self, message: &Envelope) -> Result<(), ChannelError>;

    /// Closes the channel. Further sends fail with
    /// [`ChannelError::ClientGone`].
    ///
    /// # Errors
    ///
    /// Returns a transport error if the close handshake fails.
    async fn close(&self) -> Result<(), ChannelError>;
}

/// In-process channel backed by a bounded mpsc queue.
///
/// The receiver half belongs to the transport's write loop (or to a test),
/// which drains outbound envelopes and forwards them over the wire. The
/// single consumer guarantees per-client frame atomicity.
pub struct QueueChannel {
    tx: Mutex<Option<mpsc::Sender<Envelope>>>,
}

impl QueueChannel {
    /// Creates a channel with the given outbound capacity, returning the
    /// channel and the receiver for the write loop.
    #[must_use]
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }
}

#[async_trait]
impl CommunicationChannel for QueueChannel {
    async fn send(&self, message: &Envelope) -> Result<(), ChannelError> {
        let tx = self.tx.lock().clone().ok_or(ChannelError::ClientGone)?;
        tx.send(message.clone())
            .await
            .map_err(|_| ChannelError::ClientGone)
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.tx.lock().take();
        Ok(())
    }
}

impl std::fmt::Debug for QueueChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueChannel")
            .field("open", &self.tx.lock().is_some())
            .finish()
    }
}
