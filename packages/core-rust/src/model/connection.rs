//! Connection state model shared by the connection registry, the supervisor
//! and the `CONN-INF` messages.

use serde::{Deserialize, Serialize};

/// State of a link to an external data source (radio, serial port, ...).
///
/// The lifecycle is a strict cycle: `Disconnected -> Connecting -> Connected
/// -> Disconnecting -> Disconnected`. A transitioning state may fall back to
/// the stable state it came from (an aborted open or close), but skipping a
/// step forward is forbidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    /// Returns whether the state is transient (`Connecting` or
    /// `Disconnecting`).
    #[must_use]
    pub fn is_transitioning(self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }

    /// Returns whether the state is stable (`Connected` or `Disconnected`).
    #[must_use]
    pub fn is_stable(self) -> bool {
        !self.is_transitioning()
    }

    /// Returns whether a direct transition to `next` is legal.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return false;
        }
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting)
                | (Self::Connecting, Self::Connected | Self::Disconnected)
                | (Self::Connected, Self::Disconnecting)
                | (Self::Disconnecting, Self::Disconnected | Self::Connected)
        )
    }
}

/// Why a connection exists; included in `CONN-INF` so clients can group the
/// links they display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionPurpose {
    UavRadioLink,
    Time,
    Dgps,
    #[default]
    Other,
}

/// Status information about a single registered connection, as reported in
/// `CONN-INF` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub purpose: ConnectionPurpose,
    pub status: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
    /// Milliseconds since the UNIX epoch of the last status change.
    pub timestamp: u64,
}
