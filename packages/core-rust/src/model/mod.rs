//! Wire-facing model types for the entities tracked by the server.
//!
//! These structs serialize with camelCase field names to match the JSON
//! protocol; optional fields are omitted rather than sent as `null`.

pub mod clock;
pub mod connection;
pub mod log;
pub mod progress;
pub mod uav;

pub use clock::{ClockEvent, ClockInfo};
pub use connection::{ConnectionInfo, ConnectionPurpose, ConnectionState};
pub use log::{LogMessage, Severity};
pub use progress::Progress;
pub use uav::{BatteryInfo, GpsCoordinate, GpsFix, GpsFixType, UavStatusInfo, VelocityNed};
