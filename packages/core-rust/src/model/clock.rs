//! Clock model for `CLK-INF` messages.
//!
//! Concrete clocks (system clock, MIDI timecode, show clocks) live in
//! extensions; the core only defines the wire model and the event payload
//! their signals carry.

use serde::{Deserialize, Serialize};

/// Status snapshot of a single clock known to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockInfo {
    pub id: String,
    /// Reference epoch in milliseconds since the UNIX epoch, when the clock
    /// is anchored to wall-clock time.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub epoch: Option<u64>,
    pub running: bool,
    /// Current tick count of the clock.
    pub ticks: f64,
    pub ticks_per_second: u32,
}

/// Lifecycle events emitted by a clock.
#[derive(Debug, Clone, PartialEq)]
pub enum ClockEvent {
    Started(ClockInfo),
    Stopped(ClockInfo),
    /// The clock was adjusted (epoch or tick rate changed).
    Changed(ClockInfo),
}

impl ClockEvent {
    /// Returns the clock snapshot carried by the event.
    #[must_use]
    pub fn info(&self) -> &ClockInfo {
        match self {
            Self::Started(info) | Self::Stopped(info) | Self::Changed(info) => info,
        }
    }
}
