//! Fleetlink Core -- protocol envelopes, fleet model types and the device tree.
//!
//! This crate provides the passive foundation layer of the Fleetlink
//! ground-control server:
//!
//! - **Envelope** ([`envelope`]): the JSON message envelope, the message
//!   builder and the partial-success response body helpers
//! - **Model** ([`model`]): UAV status, connection, log, progress and clock
//!   wire types
//! - **Device tree** ([`tree`]): the per-object hierarchical channel model
//!   with subscription counting and transactional mutation
//! - **Signals** ([`signal`]): typed observer lists used for change
//!   notification throughout the server

pub mod envelope;
pub mod model;
pub mod signal;
pub mod tree;

// Envelope
pub use envelope::{
    generate_id, reject_body, Envelope, EnvelopeError, MessageBuilder, ResponseBody,
    PROTOCOL_VERSION,
};

// Model
pub use model::{
    BatteryInfo, ClockEvent, ClockInfo, ConnectionInfo, ConnectionPurpose, ConnectionState,
    GpsCoordinate, GpsFix, GpsFixType, LogMessage, Progress, Severity, UavStatusInfo, VelocityNed,
};

// Signals
pub use signal::{connect_weak, Disposer, Signal};

// Device tree
pub use tree::{
    ChannelKind, ChannelOperation, DeviceClass, DeviceTree, NodeId, TreeError, TreeMutator,
    TreePath,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }

    /// Verify all re-exports are accessible from the crate root.
    #[test]
    fn reexports_accessible() {
        let _builder = MessageBuilder::new();
        let _body = ResponseBody::new();
        let _tree = DeviceTree::new();
        let _signal: Signal<u32> = Signal::new();
        let _status = UavStatusInfo::new("x");
        let _state = ConnectionState::Disconnected;
        let _ = PROTOCOL_VERSION;
    }
}
