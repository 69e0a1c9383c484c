//! Scripted in-memory vehicle for exercising the control loops.
//!
//! Every read advances the simulated vehicle one step toward whatever it was
//! last commanded to do, so convergence loops terminate after a predictable
//! number of polls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Command, LinkConnector, LinkTimeouts, VehicleLink};
use crate::error::{FlightError, FlightResult};
use crate::geo::{heading_error, normalize_heading, planar_distance};
use crate::vehicle::{Coordinate, FlightMode, GpsInfo, VehicleState};

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Command(Command),
    Mode(FlightMode),
}

#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Horizontal metres covered per read.
    pub speed: f64,
    /// Vertical metres covered per read.
    pub climb: f64,
    /// Degrees turned per read.
    pub yaw_rate: f64,
    pub accept_modes: bool,
    /// Heading reported as this fixed value regardless of turns.
    pub stuck_heading: Option<f64>,
    pub freeze_position: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            speed: 5.0,
            climb: 2.0,
            yaw_rate: 10.0,
            accept_modes: true,
            stuck_heading: None,
            freeze_position: false,
        }
    }
}

#[derive(Debug, Default)]
struct Sim {
    state: VehicleState,
    goal: Option<Coordinate>,
    climb_to: Option<f64>,
    heading_goal: Option<f64>,
}

pub struct MockLink {
    sim: Mutex<Sim>,
    sent: Mutex<Vec<Sent>>,
    behavior: MockBehavior,
    reads: AtomicUsize,
    failing_reads: AtomicUsize,
    failing_sends: AtomicUsize,
}

impl MockLink {
    pub fn new(state: VehicleState, behavior: MockBehavior) -> Self {
        Self {
            sim: Mutex::new(Sim {
                state,
                ..Sim::default()
            }),
            sent: Mutex::new(Vec::new()),
            behavior,
            reads: AtomicUsize::new(0),
            failing_reads: AtomicUsize::new(0),
            failing_sends: AtomicUsize::new(0),
        }
    }

    /// On the ground, disarmed, in STABILIZE with a 3D fix.
    pub fn on_ground() -> Self {
        Self::new(
            VehicleState {
                mode: FlightMode::Stabilize.to_string(),
                gps: GpsInfo {
                    fix_type: 3,
                    satellites_visible: 12,
                },
                ..VehicleState::default()
            },
            MockBehavior::default(),
        )
    }

    /// Armed, GUIDED, hovering at 10 m over the origin facing north.
    pub fn hovering() -> Self {
        Self::hovering_with(MockBehavior::default())
    }

    pub fn hovering_with(behavior: MockBehavior) -> Self {
        Self::new(
            VehicleState {
                position: Coordinate::new(0.0, 0.0, 10.0),
                armed: true,
                mode: FlightMode::Guided.to_string(),
                system_status: "ACTIVE".to_string(),
                gps: GpsInfo {
                    fix_type: 3,
                    satellites_visible: 12,
                },
                ..VehicleState::default()
            },
            behavior,
        )
    }

    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Command(c) => Some(c),
                Sent::Mode(_) => None,
            })
            .collect()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> VehicleState {
        self.sim.lock().unwrap().state.clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut VehicleState)) {
        f(&mut self.sim.lock().unwrap().state);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn step(&self, sim: &mut Sim) {
        let b = &self.behavior;

        if let Some(alt) = sim.climb_to {
            let current = sim.state.position.relative_altitude;
            let delta = (alt - current).clamp(-b.climb, b.climb);
            sim.state.position.relative_altitude = current + delta;
            if (alt - sim.state.position.relative_altitude).abs() < f64::EPSILON {
                sim.climb_to = None;
            }
        }

        if let Some(goal) = sim.goal {
            if !b.freeze_position {
                let here = sim.state.position;
                let remaining = planar_distance(here, goal);
                let next = if remaining <= b.speed {
                    Coordinate::new(goal.latitude, goal.longitude, here.relative_altitude)
                } else {
                    let f = b.speed / remaining;
                    Coordinate::new(
                        here.latitude + (goal.latitude - here.latitude) * f,
                        here.longitude + (goal.longitude - here.longitude) * f,
                        here.relative_altitude,
                    )
                };
                let dz = (goal.relative_altitude - next.relative_altitude).clamp(-b.climb, b.climb);
                sim.state.position = next.with_altitude(next.relative_altitude + dz);
            }
        }

        if let Some(goal) = sim.heading_goal {
            let error = heading_error(sim.state.heading, goal);
            if error <= b.yaw_rate {
                sim.state.heading = goal;
                sim.heading_goal = None;
            } else {
                let cw = normalize_heading(goal - sim.state.heading) <= 180.0;
                let delta = if cw { b.yaw_rate } else { -b.yaw_rate };
                sim.state.heading = normalize_heading(sim.state.heading + delta);
            }
        }

        if sim.state.is_mode(FlightMode::Land) && sim.state.armed {
            let alt = (sim.state.position.relative_altitude - b.climb).max(0.0);
            sim.state.position.relative_altitude = alt;
            if alt <= 0.0 {
                sim.state.armed = false;
            }
        }
    }
}

#[async_trait]
impl VehicleLink for MockLink {
    async fn read_state(&self) -> FlightResult<VehicleState> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_reads) {
            return Err(FlightError::link("attribute unavailable"));
        }
        let mut sim = self.sim.lock().unwrap();
        self.step(&mut sim);
        let mut state = sim.state.clone();
        if let Some(heading) = self.behavior.stuck_heading {
            state.heading = heading;
        }
        Ok(state)
    }

    async fn send_command(&self, command: Command) -> FlightResult<()> {
        if Self::take_failure(&self.failing_sends) {
            return Err(FlightError::link("write failed"));
        }
        self.sent.lock().unwrap().push(Sent::Command(command.clone()));

        let mut sim = self.sim.lock().unwrap();
        match command {
            Command::Arm => {
                if sim.state.is_armable() {
                    sim.state.armed = true;
                }
            }
            Command::Disarm => sim.state.armed = false,
            Command::Takeoff { altitude } => sim.climb_to = Some(altitude),
            Command::Goto { target, .. } => sim.goal = Some(target),
            Command::RelativeYaw {
                angle, direction, ..
            } => {
                sim.heading_goal =
                    Some(normalize_heading(sim.state.heading + angle * direction.sign()));
            }
            Command::Velocity { .. } => {}
        }
        Ok(())
    }

    async fn set_mode(&self, mode: FlightMode) -> FlightResult<()> {
        if Self::take_failure(&self.failing_sends) {
            return Err(FlightError::link("write failed"));
        }
        self.sent.lock().unwrap().push(Sent::Mode(mode));
        if self.behavior.accept_modes {
            self.sim.lock().unwrap().state.mode = mode.to_string();
        }
        Ok(())
    }

    async fn close(&self) {}
}

/// Fails a fixed number of connection attempts before handing out `link`.
pub struct MockConnector {
    link: Arc<MockLink>,
    failures: AtomicUsize,
    attempts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockConnector {
    pub fn new(link: Arc<MockLink>, failures: usize) -> Self {
        Self {
            link,
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinkConnector for MockConnector {
    async fn connect(
        &self,
        _endpoint: &str,
        _timeouts: &LinkTimeouts,
    ) -> FlightResult<Arc<dyn VehicleLink>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let fail = MockLink::take_failure(&self.failures);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if fail {
            Err(FlightError::link("connection refused"))
        } else {
            let link: Arc<dyn VehicleLink> = self.link.clone();
            Ok(link)
        }
    }
}
