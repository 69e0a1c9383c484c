//! Vehicle link facade.
//!
//! Everything above this module talks to the vehicle through [`VehicleLink`];
//! the MAVLink transport is one implementation of it.

pub mod mav;
#[cfg(test)]
pub mod mock;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FlightResult;
use crate::vehicle::{Coordinate, FlightMode, VehicleState};

pub use self::mav::MavlinkConnector;

/// Yaw direction for relative turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnDirection {
    /// Counter-clockwise.
    Left,
    /// Clockwise.
    Right,
}

impl TurnDirection {
    /// MAVLink CONDITION_YAW direction parameter.
    pub fn sign(self) -> f64 {
        match self {
            TurnDirection::Left => -1.0,
            TurnDirection::Right => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VelocityFrame {
    LocalNed,
    BodyNed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Arm,
    Disarm,
    Takeoff {
        altitude: f64,
    },
    Goto {
        target: Coordinate,
        groundspeed: Option<f64>,
    },
    /// Yaw by `angle` degrees. A `rate` of zero leaves the speed to the autopilot.
    RelativeYaw {
        angle: f64,
        rate: f64,
        direction: TurnDirection,
    },
    /// Velocity setpoint in m/s. Positive `down` descends.
    Velocity {
        north: f64,
        east: f64,
        down: f64,
        frame: VelocityFrame,
    },
}

impl Command {
    pub fn stop() -> Self {
        Command::Velocity {
            north: 0.0,
            east: 0.0,
            down: 0.0,
            frame: VelocityFrame::LocalNed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkTimeouts {
    /// Bound on the whole connect-and-wait-ready sequence.
    pub connect: Duration,
    /// Maximum silence from the autopilot before the link is considered dead.
    pub heartbeat: Duration,
}

impl Default for LinkTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(60),
            heartbeat: Duration::from_secs(30),
        }
    }
}

#[async_trait]
pub trait VehicleLink: Send + Sync {
    /// Current full state, or an error if any part of it is unavailable.
    async fn read_state(&self) -> FlightResult<VehicleState>;

    async fn send_command(&self, command: Command) -> FlightResult<()>;

    async fn set_mode(&self, mode: FlightMode) -> FlightResult<()>;

    async fn close(&self);
}

#[async_trait]
pub trait LinkConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        timeouts: &LinkTimeouts,
    ) -> FlightResult<Arc<dyn VehicleLink>>;
}
