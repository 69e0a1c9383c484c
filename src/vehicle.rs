use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Global position with altitude relative to the home point.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
    pub relative_altitude: f64,
}

impl Coordinate {
    pub const fn new(latitude: f64, longitude: f64, relative_altitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            relative_altitude,
        }
    }

    pub fn with_altitude(self, relative_altitude: f64) -> Self {
        Self {
            relative_altitude,
            ..self
        }
    }
}

/// ArduCopter flight modes addressable by name.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    AsRefStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlightMode {
    Stabilize,
    Acro,
    AltHold,
    Auto,
    Guided,
    Loiter,
    Rtl,
    Circle,
    Land,
    Drift,
    Sport,
    PosHold,
    Brake,
    SmartRtl,
}

impl FlightMode {
    pub fn custom_mode(self) -> u32 {
        match self {
            FlightMode::Stabilize => 0,
            FlightMode::Acro => 1,
            FlightMode::AltHold => 2,
            FlightMode::Auto => 3,
            FlightMode::Guided => 4,
            FlightMode::Loiter => 5,
            FlightMode::Rtl => 6,
            FlightMode::Circle => 7,
            FlightMode::Land => 9,
            FlightMode::Drift => 11,
            FlightMode::Sport => 13,
            FlightMode::PosHold => 16,
            FlightMode::Brake => 17,
            FlightMode::SmartRtl => 21,
        }
    }

    pub fn from_custom_mode(mode: u32) -> Option<Self> {
        Some(match mode {
            0 => FlightMode::Stabilize,
            1 => FlightMode::Acro,
            2 => FlightMode::AltHold,
            3 => FlightMode::Auto,
            4 => FlightMode::Guided,
            5 => FlightMode::Loiter,
            6 => FlightMode::Rtl,
            7 => FlightMode::Circle,
            9 => FlightMode::Land,
            11 => FlightMode::Drift,
            13 => FlightMode::Sport,
            16 => FlightMode::PosHold,
            17 => FlightMode::Brake,
            21 => FlightMode::SmartRtl,
            _ => return None,
        })
    }

    /// Display name for a raw custom mode, including ones outside the table.
    pub fn name_of(mode: u32) -> String {
        Self::from_custom_mode(mode)
            .map(|m| m.to_string())
            .unwrap_or_else(|| format!("MODE({})", mode))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Attitude {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Battery {
    pub voltage: f64,
    pub current: Option<f64>,
    pub level: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GpsInfo {
    pub fix_type: u8,
    pub satellites_visible: u8,
}

/// One complete reading of the vehicle. Never partially updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub position: Coordinate,
    pub groundspeed: f64,
    pub airspeed: f64,
    // degrees
    pub attitude: Attitude,
    pub heading: f64,
    pub battery: Battery,
    pub armed: bool,
    pub mode: String,
    pub system_status: String,
    pub gps: GpsInfo,
}

impl Default for VehicleState {
    fn default() -> Self {
        Self {
            position: Coordinate::default(),
            groundspeed: 0.0,
            airspeed: 0.0,
            attitude: Attitude::default(),
            heading: 0.0,
            battery: Battery::default(),
            armed: false,
            mode: FlightMode::Stabilize.to_string(),
            system_status: "STANDBY".to_string(),
            gps: GpsInfo::default(),
        }
    }
}

impl VehicleState {
    pub fn altitude(&self) -> f64 {
        self.position.relative_altitude
    }

    pub fn is_mode(&self, mode: FlightMode) -> bool {
        self.mode.eq_ignore_ascii_case(mode.as_ref())
    }

    pub fn is_guided(&self) -> bool {
        self.is_mode(FlightMode::Guided)
    }

    /// Autopilot finished booting and has at least a 2D fix.
    pub fn is_armable(&self) -> bool {
        !matches!(self.system_status.as_str(), "UNINIT" | "BOOT" | "CALIBRATING")
            && self.gps.fix_type > 1
    }
}

/// Latest telemetry snapshot shared between the telemetry loop and readers.
///
/// The loop is the only writer and always replaces the whole value.
#[derive(Debug, Clone, Default)]
pub struct VehicleStateHandle {
    state: Arc<RwLock<Option<VehicleState>>>,
}

impl VehicleStateHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, snapshot: VehicleState) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = Some(snapshot);
    }

    pub fn snapshot(&self) -> Option<VehicleState> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
