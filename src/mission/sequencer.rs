//! Mission sequencer.
//!
//! Drives the vehicle through a [`MissionPlan`] one step at a time. Each step
//! issues its command once, then polls the vehicle until the commanded motion
//! has physically converged or the step's bound expires. The first step that
//! does not succeed ends the run.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{error, info, warn};

use super::{AbortReason, MissionPlan, MissionStep, StepOutcome, StepStatus};
use crate::commander::{CommandSession, Commander};
use crate::connection::ConnectivityState;
use crate::error::{FlightError, FlightResult};
use crate::flight::{poll_until, switch_mode_or_abort, AbortSignal};
use crate::geo::{heading_error, heading_offset, normalize_heading, offset_to_coordinate, planar_distance};
use crate::link::{Command, TurnDirection};
use crate::vehicle::{FlightMode, VehicleState};

/// How a relative turn is judged complete.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TurnCompletion {
    /// Poll heading until within `tolerance` degrees of the expected heading.
    Heading { tolerance: f64, timeout: Duration },
    /// Wait a fixed time and assume the turn finished.
    Settle(Duration),
}

#[derive(Debug, Clone)]
pub struct SequencerSettings {
    pub poll_interval: Duration,
    pub mode_switch_timeout: Duration,
    pub climb_timeout: Duration,
    pub leg_timeout: Duration,
    pub land_timeout: Duration,
    pub groundspeed: Option<f64>,
    pub turn: TurnCompletion,
    /// Fraction of the takeoff altitude that counts as reached.
    pub climb_fraction: f64,
    pub position_tolerance: f64,
    pub altitude_tolerance: f64,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            mode_switch_timeout: Duration::from_secs(5),
            climb_timeout: Duration::from_secs(60),
            leg_timeout: Duration::from_secs(120),
            land_timeout: Duration::from_secs(120),
            groundspeed: Some(5.0),
            turn: TurnCompletion::Heading {
                tolerance: 5.0,
                timeout: Duration::from_secs(15),
            },
            climb_fraction: 0.95,
            position_tolerance: 2.0,
            altitude_tolerance: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum SequencerState {
    Idle,
    ModeSwitch,
    Climbing,
    Cruising { leg: usize },
    Turning,
    Landing,
    Complete,
    Aborted(String),
}

pub struct MissionSequencer {
    commander: Arc<Commander>,
    connectivity: watch::Receiver<ConnectivityState>,
    settings: SequencerSettings,
    state_tx: watch::Sender<SequencerState>,
    abort: AbortSignal,
    running: Mutex<()>,
}

impl MissionSequencer {
    pub fn new(
        commander: Arc<Commander>,
        connectivity: watch::Receiver<ConnectivityState>,
        settings: SequencerSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(SequencerState::Idle);
        Self {
            commander,
            connectivity,
            settings,
            state_tx,
            abort: AbortSignal::new(),
            running: Mutex::new(()),
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SequencerState> {
        self.state_tx.subscribe()
    }

    /// Stops the running mission at its next polling boundary.
    ///
    /// Commands already sent are not reverted.
    pub fn abort(&self) {
        warn!("[MISSION] Abort requested");
        self.abort.abort();
    }

    /// Aborts the running mission, if any, once `shutdown` fires.
    pub async fn abort_on_shutdown(&self, mut shutdown: broadcast::Receiver<()>) {
        let _ = shutdown.recv().await;
        if self.running.try_lock().is_err() {
            info!("[MISSION] Shutting down, stopping the running mission");
            self.abort();
        }
    }

    fn set_state(&self, state: SequencerState) {
        self.state_tx.send_replace(state);
    }

    /// Runs `plan` to completion or to the first failing step.
    ///
    /// Returns one outcome per attempted step, in order. A run attempted while
    /// disconnected, disarmed or while another run is in progress yields a
    /// single `PreconditionFailed` outcome and sends nothing.
    pub async fn run_mission(&self, plan: &MissionPlan) -> Vec<StepOutcome> {
        let Ok(_running) = self.running.try_lock() else {
            warn!("[MISSION] Rejected mission with {} steps, one is already running", plan.len());
            return vec![StepOutcome {
                step_index: 0,
                status: StepStatus::Aborted {
                    reason: AbortReason::PreconditionFailed("mission already running".to_string()),
                },
            }];
        };
        self.abort.reset();
        info!("[MISSION] Received mission with {} steps", plan.len());

        if let Err(e) = self.check_ready().await {
            let outcome = StepOutcome {
                step_index: 0,
                status: status_for(e),
            };
            self.finish_aborted(&outcome);
            return vec![outcome];
        }

        let mut outcomes = Vec::with_capacity(plan.len());
        let mut legs = 0;

        for (index, step) in plan.steps.iter().enumerate() {
            info!("[MISSION] Step {}: {}", index, step);
            let session = self.commander.session().await;
            let result = match self.abort.check() {
                Ok(()) => self.execute(step, &session, &mut legs).await,
                Err(e) => Err(e),
            };
            drop(session);

            let outcome = StepOutcome {
                step_index: index,
                status: match result {
                    Ok(()) => StepStatus::Success,
                    Err(e) => status_for(e),
                },
            };

            if !outcome.status.is_success() {
                error!("[MISSION] Step {} failed: {:?}", index, outcome.status);
                self.finish_aborted(&outcome);
                outcomes.push(outcome);
                return outcomes;
            }
            outcomes.push(outcome);
        }

        info!("[MISSION] Mission completed successfully");
        self.set_state(SequencerState::Complete);
        outcomes
    }

    async fn check_ready(&self) -> FlightResult<()> {
        let connectivity = *self.connectivity.borrow();
        if connectivity != ConnectivityState::Connected {
            return Err(FlightError::precondition(format!(
                "vehicle {}",
                connectivity.to_string().to_lowercase()
            )));
        }
        let state = self.commander.read_state().await?;
        if !state.armed {
            return Err(FlightError::precondition("vehicle not armed"));
        }
        Ok(())
    }

    fn finish_aborted(&self, outcome: &StepOutcome) {
        let reason = match &outcome.status {
            StepStatus::Aborted { reason } => reason.to_string(),
            StepStatus::TimedOut { what, .. } => format!("timed out waiting for {}", what),
            StepStatus::LinkError { detail } => format!("link error: {}", detail),
            StepStatus::Success => return,
        };
        self.set_state(SequencerState::Aborted(reason));
    }

    async fn execute(
        &self,
        step: &MissionStep,
        session: &CommandSession<'_>,
        legs: &mut usize,
    ) -> FlightResult<()> {
        match step {
            MissionStep::SetMode { mode } => {
                self.set_state(SequencerState::ModeSwitch);
                self.set_mode(session, *mode).await
            }
            MissionStep::Takeoff { altitude } => {
                self.require_guided_and_armed().await?;
                self.set_state(SequencerState::Climbing);
                self.climb(session, *altitude).await
            }
            MissionStep::FlyLeg { distance, altitude } => {
                let state = self.require_guided_and_armed().await?;
                self.set_state(SequencerState::Cruising { leg: *legs });
                *legs += 1;
                self.fly_leg(session, &state, *distance, *altitude, false)
                    .await
            }
            MissionStep::FlyLegWithAltitude {
                distance,
                target_altitude,
            } => {
                let state = self.require_guided_and_armed().await?;
                self.set_state(SequencerState::Cruising { leg: *legs });
                *legs += 1;
                self.fly_leg(session, &state, *distance, *target_altitude, true)
                    .await
            }
            MissionStep::TurnRelative { angle, direction } => {
                let state = self.require_guided_and_armed().await?;
                self.set_state(SequencerState::Turning);
                self.turn(session, &state, *angle, *direction).await
            }
            MissionStep::Land => {
                self.require_armed().await?;
                self.set_state(SequencerState::Landing);
                self.land(session).await
            }
            MissionStep::ReturnToLaunch => {
                self.require_armed().await?;
                self.set_state(SequencerState::Landing);
                self.set_mode(session, FlightMode::Rtl).await
            }
        }
    }

    async fn require_armed(&self) -> FlightResult<VehicleState> {
        let state = self.commander.read_state().await?;
        if !state.armed {
            return Err(FlightError::precondition("vehicle not armed"));
        }
        Ok(state)
    }

    async fn require_guided_and_armed(&self) -> FlightResult<VehicleState> {
        let state = self.require_armed().await?;
        if !state.is_guided() {
            return Err(FlightError::precondition(format!(
                "vehicle in {} mode, GUIDED required",
                state.mode
            )));
        }
        Ok(state)
    }

    async fn poll<F>(&self, what: &str, limit: Duration, done: F) -> FlightResult<VehicleState>
    where
        F: FnMut(&VehicleState) -> bool,
    {
        poll_until(
            &self.commander,
            what,
            self.settings.poll_interval,
            limit,
            Some(&self.abort),
            done,
        )
        .await
    }

    async fn set_mode(&self, session: &CommandSession<'_>, mode: FlightMode) -> FlightResult<()> {
        let state = self.commander.read_state().await?;
        if state.is_mode(mode) {
            info!("[MISSION] Already in {} mode", mode);
            return Ok(());
        }
        info!("[MISSION] Setting mode to {}...", mode);
        switch_mode_or_abort(
            &self.commander,
            session,
            mode,
            self.settings.poll_interval,
            self.settings.mode_switch_timeout,
            Some(&self.abort),
        )
        .await?;
        info!("[MISSION] Mode set to {}", mode);
        Ok(())
    }

    async fn climb(&self, session: &CommandSession<'_>, altitude: f64) -> FlightResult<()> {
        info!("[MISSION] Taking off to {}m...", altitude);
        session.send(Command::Takeoff { altitude }).await?;

        let threshold = altitude * self.settings.climb_fraction;
        self.poll("takeoff altitude", self.settings.climb_timeout, |s| {
            info!("[MISSION]   Altitude: {:.2}m", s.altitude());
            s.altitude() >= threshold
        })
        .await?;
        info!("[MISSION] Reached target takeoff altitude");
        Ok(())
    }

    async fn fly_leg(
        &self,
        session: &CommandSession<'_>,
        start: &VehicleState,
        distance: f64,
        altitude: f64,
        converge_altitude: bool,
    ) -> FlightResult<()> {
        let (north, east) = heading_offset(start.heading, distance);
        let target = offset_to_coordinate(start.position, north, east).with_altitude(altitude);
        info!(
            "[MISSION] Flying {}m on heading {:.0} to lat={:.7} lon={:.7} alt={:.1}",
            distance, start.heading, target.latitude, target.longitude, target.relative_altitude
        );
        session
            .send(Command::Goto {
                target,
                groundspeed: self.settings.groundspeed,
            })
            .await?;

        let position_tolerance = self.settings.position_tolerance;
        let altitude_tolerance = self.settings.altitude_tolerance;
        self.poll("leg target", self.settings.leg_timeout, |s| {
            let remaining = planar_distance(s.position, target);
            let altitude_error = (s.altitude() - altitude).abs();
            info!(
                "[MISSION]   Distance to target: {:.2}m, altitude difference: {:.2}m",
                remaining, altitude_error
            );
            remaining <= position_tolerance
                && (!converge_altitude || altitude_error <= altitude_tolerance)
        })
        .await?;
        info!("[MISSION] Reached leg target");
        Ok(())
    }

    async fn turn(
        &self,
        session: &CommandSession<'_>,
        start: &VehicleState,
        angle: f64,
        direction: TurnDirection,
    ) -> FlightResult<()> {
        let expected = normalize_heading(start.heading + angle * direction.sign());
        info!(
            "[MISSION] Turning {:?} by {} degrees (heading {:.0} -> {:.0})",
            direction, angle, start.heading, expected
        );
        session
            .send(Command::RelativeYaw {
                angle,
                rate: 0.0,
                direction,
            })
            .await?;

        match self.settings.turn {
            TurnCompletion::Heading { tolerance, timeout } => {
                self.poll("heading", timeout, |s| {
                    heading_error(s.heading, expected) <= tolerance
                })
                .await?;
            }
            TurnCompletion::Settle(duration) => {
                self.abort.sleep(duration).await?;
            }
        }
        if let Ok(state) = self.commander.read_state().await {
            info!("[MISSION]   New heading: {:.2} degrees", state.heading);
        }
        Ok(())
    }

    async fn land(&self, session: &CommandSession<'_>) -> FlightResult<()> {
        info!("[MISSION] Landing...");
        session.set_mode(FlightMode::Land).await?;
        self.poll("landing", self.settings.land_timeout, |s| !s.armed)
            .await?;
        info!("[MISSION] Landed and disarmed");
        Ok(())
    }
}

fn status_for(error: FlightError) -> StepStatus {
    match error {
        FlightError::Timeout { what, waited } => StepStatus::TimedOut { what, waited },
        FlightError::LinkUnavailable => StepStatus::LinkError {
            detail: FlightError::LinkUnavailable.to_string(),
        },
        FlightError::Link(detail) => StepStatus::LinkError { detail },
        FlightError::PreconditionFailed(detail) => StepStatus::Aborted {
            reason: AbortReason::PreconditionFailed(detail),
        },
        FlightError::ModeSwitchFailed {
            requested,
            observed,
        } => StepStatus::Aborted {
            reason: AbortReason::ModeSwitchFailed {
                requested,
                observed,
            },
        },
        FlightError::Cancelled => StepStatus::Aborted {
            reason: AbortReason::Cancelled,
        },
    }
}
