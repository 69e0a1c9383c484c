//! Manual control loop.
//!
//! Operator inputs arrive through [`ManualHandle::submit_input`] and are
//! processed one at a time. Velocity inputs become bursts of setpoints that
//! are re-sent every second for the move duration and always end with a zero
//! velocity setpoint, since the autopilot lets velocity setpoints expire.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use strum_macros::Display;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::commander::{CommandSession, Commander};
use crate::error::{FlightError, FlightResult};
use crate::flight::{self, switch_mode, ActionLimits};
use crate::link::{Command, TurnDirection, VelocityFrame};
use crate::vehicle::FlightMode;

const SETPOINT_INTERVAL: Duration = Duration::from_secs(1);
const INPUT_QUEUE: usize = 32;
const REPORT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InputEvent {
    Takeoff,
    Land,
    Guided,
    Rtl,
    Forward,
    Backward,
    Left,
    Right,
    Up,
    Down,
    YawLeft,
    YawRight,
    Quit,
}

/// Inputs of the same class share a debounce window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionClass {
    Command,
    Movement,
    Yaw,
}

impl InputEvent {
    /// Maps a console key or web key name to an input.
    pub fn from_key(key: &str) -> Option<Self> {
        let event = match key.trim().to_ascii_lowercase().as_str() {
            "t" | "takeoff" => InputEvent::Takeoff,
            "l" | "land" => InputEvent::Land,
            "g" | "guided" => InputEvent::Guided,
            "r" | "rtl" => InputEvent::Rtl,
            "w" | "forward" => InputEvent::Forward,
            "s" | "backward" => InputEvent::Backward,
            "a" | "left" => InputEvent::Left,
            "d" | "right" => InputEvent::Right,
            "u" | "up" => InputEvent::Up,
            "j" | "down" => InputEvent::Down,
            "[" | "yaw_left" => InputEvent::YawLeft,
            "]" | "yaw_right" => InputEvent::YawRight,
            "q" | "quit" => InputEvent::Quit,
            _ => return None,
        };
        Some(event)
    }

    pub fn class(self) -> ActionClass {
        match self {
            InputEvent::Forward
            | InputEvent::Backward
            | InputEvent::Left
            | InputEvent::Right
            | InputEvent::Up
            | InputEvent::Down => ActionClass::Movement,
            InputEvent::YawLeft | InputEvent::YawRight => ActionClass::Yaw,
            InputEvent::Takeoff
            | InputEvent::Land
            | InputEvent::Guided
            | InputEvent::Rtl
            | InputEvent::Quit => ActionClass::Command,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ManualReport {
    Accepted { input: InputEvent },
    Debounced { input: InputEvent },
    Rejected { input: InputEvent, reason: String },
    Failed { input: InputEvent, error: String },
}

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum SubmitError {
    #[error("input queue full, dropped {0}")]
    Full(InputEvent),
    #[error("manual control stopped, dropped {0}")]
    Closed(InputEvent),
}

#[derive(Debug, Clone)]
pub struct ManualSettings {
    pub takeoff_altitude: f64,
    /// Horizontal speed in m/s.
    pub default_speed: f64,
    /// Vertical speed in m/s.
    pub altitude_change_speed: f64,
    pub yaw_rate_deg_s: f64,
    /// Partial seconds round up to a whole setpoint.
    pub move_duration: Duration,
    pub command_debounce: Duration,
    pub movement_debounce: Duration,
    pub yaw_debounce: Duration,
    pub limits: ActionLimits,
}

impl Default for ManualSettings {
    fn default() -> Self {
        Self {
            takeoff_altitude: 15.0,
            default_speed: 2.0,
            altitude_change_speed: 0.5,
            yaw_rate_deg_s: 30.0,
            move_duration: Duration::from_secs(1),
            command_debounce: Duration::from_millis(500),
            movement_debounce: Duration::from_millis(100),
            yaw_debounce: Duration::from_millis(200),
            limits: ActionLimits::default(),
        }
    }
}

impl ManualSettings {
    fn debounce(&self, class: ActionClass) -> Duration {
        match class {
            ActionClass::Command => self.command_debounce,
            ActionClass::Movement => self.movement_debounce,
            ActionClass::Yaw => self.yaw_debounce,
        }
    }

    /// Setpoints sent per burst, never fewer than one.
    pub fn burst_setpoints(&self) -> u64 {
        let setpoints = self.move_duration.as_secs_f64() / SETPOINT_INTERVAL.as_secs_f64();
        setpoints.ceil().max(1.0) as u64
    }
}

/// Cloneable entry point for input sources.
#[derive(Clone)]
pub struct ManualHandle {
    tx: mpsc::Sender<InputEvent>,
    reports: broadcast::Sender<ManualReport>,
}

impl ManualHandle {
    /// Queues `input` for the next tick without waiting.
    pub fn submit_input(&self, input: InputEvent) -> Result<(), SubmitError> {
        self.tx.try_send(input).map_err(|e| match e {
            mpsc::error::TrySendError::Full(input) => SubmitError::Full(input),
            mpsc::error::TrySendError::Closed(input) => SubmitError::Closed(input),
        })
    }

    pub fn reports(&self) -> broadcast::Receiver<ManualReport> {
        self.reports.subscribe()
    }
}

pub struct ManualControl {
    commander: Arc<Commander>,
    settings: ManualSettings,
    handle: ManualHandle,
    rx: mpsc::Receiver<InputEvent>,
    quit: Option<broadcast::Sender<()>>,
    last_done: HashMap<ActionClass, Instant>,
}

impl ManualControl {
    pub fn new(commander: Arc<Commander>, settings: ManualSettings) -> Self {
        let (tx, rx) = mpsc::channel(INPUT_QUEUE);
        let (reports, _) = broadcast::channel(REPORT_BUFFER);
        Self {
            commander,
            settings,
            handle: ManualHandle { tx, reports },
            rx,
            quit: None,
            last_done: HashMap::new(),
        }
    }

    /// A quit input will signal `shutdown`.
    pub fn with_quit(mut self, shutdown: broadcast::Sender<()>) -> Self {
        self.quit = Some(shutdown);
        self
    }

    pub fn handle(&self) -> ManualHandle {
        self.handle.clone()
    }

    #[cfg(test)]
    pub(crate) fn try_next_input(&mut self) -> Result<InputEvent, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }

    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("[MANUAL] Manual control enabled");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                input = self.rx.recv() => match input {
                    Some(input) => match self.process(input, &mut shutdown).await {
                        ControlFlow::Continue(report) => self.publish(report),
                        ControlFlow::Break(report) => {
                            self.publish(report);
                            break;
                        }
                    },
                    None => break,
                },
            }
        }
        info!("[MANUAL] Manual control stopped");
    }

    fn publish(&self, report: ManualReport) {
        match &report {
            ManualReport::Accepted { input } => info!("[MANUAL] {} done", input),
            ManualReport::Debounced { input } => info!("[MANUAL] {} ignored (debounce)", input),
            ManualReport::Rejected { input, reason } => {
                warn!("[MANUAL] {} rejected: {}", input, reason)
            }
            ManualReport::Failed { input, error } => warn!("[MANUAL] {} failed: {}", input, error),
        }
        let _ = self.handle.reports.send(report);
    }

    /// Breaks when shutdown arrived while the input was in progress.
    ///
    /// Commands are cancelled outright. Bursts and yaws are cancelled only
    /// while waiting for the command session; once they hold it they finish,
    /// so a started burst still ends with its stop setpoint.
    async fn process(
        &mut self,
        input: InputEvent,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> ControlFlow<ManualReport, ManualReport> {
        let class = input.class();
        if let Some(done) = self.last_done.get(&class) {
            if done.elapsed() < self.settings.debounce(class) {
                return ControlFlow::Continue(ManualReport::Debounced { input });
            }
        }

        info!("[MANUAL] {} key pressed", input);
        let result = match class {
            ActionClass::Command => tokio::select! {
                result = self.execute(input) => result,
                _ = shutdown.recv() => Err(FlightError::Cancelled),
            },
            ActionClass::Movement | ActionClass::Yaw => {
                let session = tokio::select! {
                    session = self.commander.session() => Some(session),
                    _ = shutdown.recv() => None,
                };
                match session {
                    Some(session) => self.steer(input, &session).await,
                    None => Err(FlightError::Cancelled),
                }
            }
        };
        self.last_done.insert(class, Instant::now());

        let cancelled = matches!(result, Err(FlightError::Cancelled));
        let report = Self::report(input, result);
        if cancelled {
            ControlFlow::Break(report)
        } else {
            ControlFlow::Continue(report)
        }
    }

    fn report(input: InputEvent, result: FlightResult<()>) -> ManualReport {
        match result {
            Ok(()) => ManualReport::Accepted { input },
            Err(FlightError::PreconditionFailed(reason)) => ManualReport::Rejected { input, reason },
            Err(e) => ManualReport::Failed {
                input,
                error: e.to_string(),
            },
        }
    }

    async fn execute(&self, input: InputEvent) -> FlightResult<()> {
        let s = &self.settings;
        match input {
            InputEvent::Takeoff => {
                flight::arm_and_takeoff(&self.commander, s.takeoff_altitude, &s.limits)
                    .await
                    .map(|_| ())
            }
            InputEvent::Land => flight::land(&self.commander, &s.limits).await,
            InputEvent::Rtl => flight::return_to_launch(&self.commander).await,
            InputEvent::Guided => self.guided().await,
            InputEvent::Quit => {
                info!("[MANUAL] Quit requested");
                if let Some(quit) = &self.quit {
                    let _ = quit.send(());
                }
                Ok(())
            }
            steering => Err(FlightError::precondition(format!(
                "{} is not a command input",
                steering
            ))),
        }
    }

    /// Movement and yaw inputs, run inside an already held session.
    async fn steer(&self, input: InputEvent, session: &CommandSession<'_>) -> FlightResult<()> {
        let s = &self.settings;
        match input {
            InputEvent::Forward => self.burst(session, s.default_speed, 0.0, 0.0).await,
            InputEvent::Backward => self.burst(session, -s.default_speed, 0.0, 0.0).await,
            InputEvent::Left => self.burst(session, 0.0, -s.default_speed, 0.0).await,
            InputEvent::Right => self.burst(session, 0.0, s.default_speed, 0.0).await,
            InputEvent::Up => self.burst(session, 0.0, 0.0, -s.altitude_change_speed).await,
            InputEvent::Down => self.burst(session, 0.0, 0.0, s.altitude_change_speed).await,
            InputEvent::YawLeft => self.yaw(session, TurnDirection::Left).await,
            InputEvent::YawRight => self.yaw(session, TurnDirection::Right).await,
            other => Err(FlightError::precondition(format!("{} is not a steering input", other))),
        }
    }

    async fn guided(&self) -> FlightResult<()> {
        let state = self.commander.read_state().await?;
        if state.is_guided() {
            info!("[MANUAL] Already in GUIDED mode");
            return Ok(());
        }
        let session = self.commander.session().await;
        switch_mode(
            &self.commander,
            &session,
            FlightMode::Guided,
            self.settings.limits.poll_interval,
            self.settings.limits.mode_switch,
        )
        .await
    }

    async fn require_guided(session: &CommandSession<'_>) -> FlightResult<()> {
        let state = session.read_state().await?;
        if !state.is_guided() {
            return Err(FlightError::precondition(format!(
                "vehicle in {} mode, GUIDED required for movement",
                state.mode
            )));
        }
        Ok(())
    }

    /// Sends the setpoint once per second for the move duration, then stops.
    async fn burst(
        &self,
        session: &CommandSession<'_>,
        north: f64,
        east: f64,
        down: f64,
    ) -> FlightResult<()> {
        Self::require_guided(session).await?;

        let setpoint = Command::Velocity {
            north,
            east,
            down,
            frame: VelocityFrame::LocalNed,
        };
        let repeats = self.settings.burst_setpoints();
        let mut result = Ok(());
        for _ in 0..repeats {
            if let Err(e) = session.send(setpoint.clone()).await {
                result = Err(e);
                break;
            }
            sleep(SETPOINT_INTERVAL).await;
        }
        // stop even after a failed setpoint so the vehicle does not drift
        let stopped = session.send(Command::stop()).await;
        result?;
        stopped?;
        info!(
            "[MANUAL] Sent velocity N:{:.1}, E:{:.1}, D:{:.1} for {}s, then stopped",
            north, east, down, repeats
        );
        Ok(())
    }

    async fn yaw(&self, session: &CommandSession<'_>, direction: TurnDirection) -> FlightResult<()> {
        Self::require_guided(session).await?;
        let angle = self.settings.yaw_rate_deg_s * self.settings.move_duration.as_secs_f64();
        session
            .send(Command::RelativeYaw {
                angle,
                rate: 0.0,
                direction,
            })
            .await
    }
}
