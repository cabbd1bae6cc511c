//! Status model for a single UAV.
//!
//! The wire format follows the conventions of the protocol: heading and
//! battery voltage are scaled by ten to avoid fractional values, the light
//! color is packed RGB565, and the debug blob travels base64-encoded.

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// Geodetic position with optional altitudes above mean sea level and above
/// ground level, both in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsCoordinate {
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub amsl: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub agl: Option<f64>,
}

/// Velocity in the local North-East-Down frame, in m/s.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VelocityNed {
    pub north: f64,
    pub east: f64,
    pub down: f64,
}

/// GPS fix quality reported by the positioning subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum GpsFixType {
    #[default]
    NoGps = 0,
    NoFix = 1,
    Fix2D = 2,
    Fix3D = 3,
    Dgps = 4,
    RtkFloat = 5,
    RtkFixed = 6,
    Static = 7,
}

/// GPS fix details: fix type, satellite count and horizontal/vertical
/// accuracy in millimeters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsFix {
    #[serde(rename = "type")]
    pub kind: GpsFixType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub num_satellites: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub horizontal_accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub vertical_accuracy: Option<f64>,
}

/// Battery state: voltage in tenths of volts, optional charge percentage and
/// charging flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryInfo {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub voltage: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub percentage: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub charging: Option<bool>,
}

mod base64_blob {
    //! Serializes a byte blob as a base64 string on the wire.

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(&text).map_err(serde::de::Error::custom)
    }
}

/// Full status snapshot of a single UAV, as sent in `UAV-INF` notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UavStatusInfo {
    /// Identifier of the UAV this snapshot belongs to.
    pub id: String,

    /// Milliseconds since the UNIX epoch when the snapshot was taken.
    pub timestamp: u64,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub position: Option<GpsCoordinate>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub velocity: Option<VelocityNed>,

    /// Heading in tenths of degrees, clockwise from North.
    pub heading: i16,

    /// Flight mode string reported by the autopilot.
    pub mode: String,

    pub gps: GpsFix,

    pub battery: BatteryInfo,

    /// Color of the primary light of the UAV, packed RGB565.
    pub light: u16,

    /// Active error codes, kept sorted and unique.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<i32>,

    /// Driver-specific debug blob; base64 on the wire.
    #[serde(
        with = "base64_blob",
        skip_serializing_if = "Vec::is_empty",
        default,
        rename = "debug"
    )]
    pub debug_blob: Vec<u8>,
}

impl UavStatusInfo {
    /// Creates an empty status snapshot for the given UAV id.
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            timestamp: 0,
            position: None,
            velocity: None,
            heading: 0,
            mode: String::new(),
            gps: GpsFix::default(),
            battery: BatteryInfo::default(),
            light: 0,
            errors: Vec::new(),
            debug_blob: Vec::new(),
        }
    }

    /// Updates the snapshot timestamp.
    pub fn touch(&mut self, timestamp_ms: u64) {
        self.timestamp = timestamp_ms;
    }

    /// Sets the position, including both altitude references.
    pub fn update_position(&mut self, lat: f64, lon: f64, amsl: Option<f64>, agl: Option<f64>) {
        self.position = Some(GpsCoordinate {
            lat,
            lon,
            amsl,
            agl,
        });
    }

    /// Ensures that the given error code is present in (or absent from) the
    /// error list, keeping the list sorted.
    pub fn ensure_error(&mut self, code: i32, present: bool) {
        match self.errors.binary_search(&code) {
            Ok(index) if !present => {
                self.errors.remove(index);
            }
            Err(index) if present => {
                self.errors.insert(index, code);
            }
            _ => {}
        }
    }

    /// Clears all error codes.
    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn new_status_is_empty() {
        let status = UavStatusInfo::new("DRN-01");
        assert_eq!(status.id, "DRN-01");
        assert_eq!(status.heading, 0);
        assert!(status.position.is_none());
        assert!(status.errors.is_empty());
    }

    #[test]
    fn ensure_error_keeps_list_sorted_and_unique() {
        let mut status = UavStatusInfo::new("x");
        status.ensure_error(3, true);
        status.ensure_error(1, true);
        status.ensure_error(2, true);
        status.ensure_error(2, true);
        assert_eq!(status.errors, vec![1, 2, 3]);

        status.ensure_error(2, false);
        assert_eq!(status.errors, vec![1, 3]);

        // Removing an absent code is a no-op.
        status.ensure_error(42, false);
        assert_eq!(status.errors, vec![1, 3]);
    }

    #[test]
    fn update_position_sets_all_fields() {
        let mut status = UavStatusInfo::new("x");
        status.update_position(47.5, 19.0, Some(50.0), Some(5.0));
        let position = status.position.unwrap();
        assert!((position.lat - 47.5).abs() < f64::EPSILON);
        assert!((position.lon - 19.0).abs() < f64::EPSILON);
        assert_eq!(position.amsl, Some(50.0));
        assert_eq!(position.agl, Some(5.0));
    }

    #[test]
    fn serializes_camel_case_and_omits_empty_fields() {
        let mut status = UavStatusInfo::new("DRN-01");
        status.touch(1_700_000_000_000);
        status.gps.num_satellites = Some(12);

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["id"], "DRN-01");
        assert_eq!(value["gps"]["numSatellites"], 12);
        assert!(value.get("position").is_none());
        assert!(value.get("errors").is_none());
        assert!(value.get("debug").is_none());
    }

    #[test]
    fn gps_fix_type_serializes_as_integer() {
        let value = serde_json::to_value(GpsFixType::Fix3D).unwrap();
        assert_eq!(value, json!(3));

        let decoded: GpsFixType = serde_json::from_value(json!(6)).unwrap();
        assert_eq!(decoded, GpsFixType::RtkFixed);
    }

    #[test]
    fn debug_blob_roundtrips_as_base64() {
        let mut status = UavStatusInfo::new("x");
        status.debug_blob = vec![0xDE, 0xAD, 0xBE, 0xEF];

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["debug"], "3q2+7w==");

        let decoded: UavStatusInfo = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.debug_blob, status.debug_blob);
    }

    #[test]
    fn full_status_roundtrip() {
        let mut status = UavStatusInfo::new("DRN-01");
        status.touch(1_700_000_000_000);
        status.update_position(47.5, 19.0, Some(50.0), Some(5.0));
        status.velocity = Some(VelocityNed {
            north: 1.0,
            east: -0.5,
            down: 0.0,
        });
        status.heading = 1800;
        status.mode = "auto".to_owned();
        status.gps = GpsFix {
            kind: GpsFixType::RtkFixed,
            num_satellites: Some(17),
            horizontal_accuracy: Some(12.0),
            vertical_accuracy: Some(20.0),
        };
        status.battery = BatteryInfo {
            voltage: Some(124),
            percentage: Some(87),
            charging: Some(false),
        };
        status.light = 0xF800;
        status.ensure_error(42, true);

        let value = serde_json::to_value(&status).unwrap();
        let decoded: UavStatusInfo = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, status);
    }
}
