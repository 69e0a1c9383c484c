//! Declarative mission plans and their per-step results.

pub mod sequencer;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::link::TurnDirection;
use crate::vehicle::FlightMode;

pub use sequencer::{MissionSequencer, SequencerSettings, SequencerState, TurnCompletion};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum MissionStep {
    SetMode {
        mode: FlightMode,
    },
    Takeoff {
        altitude: f64,
    },
    /// Straight leg along the current heading, holding `altitude`.
    FlyLeg {
        distance: f64,
        altitude: f64,
    },
    TurnRelative {
        angle: f64,
        direction: TurnDirection,
    },
    /// Straight leg along the current heading that must also arrive at
    /// `target_altitude`.
    FlyLegWithAltitude {
        distance: f64,
        target_altitude: f64,
    },
    Land,
    ReturnToLaunch,
}

impl fmt::Display for MissionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissionStep::SetMode { mode } => write!(f, "set mode {}", mode),
            MissionStep::Takeoff { altitude } => write!(f, "takeoff to {}m", altitude),
            MissionStep::FlyLeg { distance, altitude } => {
                write!(f, "fly {}m at {}m", distance, altitude)
            }
            MissionStep::TurnRelative { angle, direction } => {
                write!(f, "turn {:?} {} degrees", direction, angle)
            }
            MissionStep::FlyLegWithAltitude {
                distance,
                target_altitude,
            } => write!(f, "fly {}m to {}m altitude", distance, target_altitude),
            MissionStep::Land => write!(f, "land"),
            MissionStep::ReturnToLaunch => write!(f, "return to launch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionPlan {
    pub steps: Vec<MissionStep>,
}

impl MissionPlan {
    pub fn new(steps: Vec<MissionStep>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Default for MissionPlan {
    /// Climb to 10 m, fly 30 m, turn left 30°, fly 20 m while climbing to 15 m.
    fn default() -> Self {
        Self::new(vec![
            MissionStep::SetMode {
                mode: FlightMode::Guided,
            },
            MissionStep::Takeoff { altitude: 10.0 },
            MissionStep::FlyLeg {
                distance: 30.0,
                altitude: 10.0,
            },
            MissionStep::TurnRelative {
                angle: 30.0,
                direction: TurnDirection::Left,
            },
            MissionStep::FlyLegWithAltitude {
                distance: 20.0,
                target_altitude: 15.0,
            },
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum AbortReason {
    PreconditionFailed(String),
    ModeSwitchFailed { requested: String, observed: String },
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::PreconditionFailed(detail) => write!(f, "precondition failed: {}", detail),
            AbortReason::ModeSwitchFailed { requested, observed } => {
                write!(f, "mode switch to {} failed (vehicle reports {})", requested, observed)
            }
            AbortReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    TimedOut { what: String, waited: Duration },
    LinkError { detail: String },
    Aborted { reason: AbortReason },
}

impl StepStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, StepStatus::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub step_index: usize,
    pub status: StepStatus,
}

/// True when every step of a plan of `plan_len` steps succeeded.
pub fn mission_completed(outcomes: &[StepOutcome], plan_len: usize) -> bool {
    outcomes.len() == plan_len && outcomes.iter().all(|o| o.status.is_success())
}
