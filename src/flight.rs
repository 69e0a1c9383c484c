//! Bounded convergence waits and composite flight actions shared by the
//! mission sequencer, the manual control loop and the web layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::commander::{CommandSession, Commander};
use crate::error::{FlightError, FlightResult};
use crate::link::Command;
use crate::vehicle::{FlightMode, VehicleState};

/// Stops a long-running action at its next polling boundary.
///
/// Aborting only prevents further progress; commands already sent stay in
/// effect.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn check(&self) -> FlightResult<()> {
        if self.is_aborted() {
            Err(FlightError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration`, returning early with `Cancelled` if aborted.
    pub async fn sleep(&self, duration: Duration) -> FlightResult<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            sleep((deadline - now).min(ABORT_CHECK)).await;
        }
    }
}

const ABORT_CHECK: Duration = Duration::from_millis(100);

/// Polls the vehicle every `interval` until `done` holds or `limit` passes.
///
/// Read errors end the wait immediately. Returns the state that satisfied
/// `done`.
pub async fn wait_until<F>(
    commander: &Commander,
    what: &str,
    interval: Duration,
    limit: Duration,
    done: F,
) -> FlightResult<VehicleState>
where
    F: FnMut(&VehicleState) -> bool,
{
    poll_until(commander, what, interval, limit, None, done).await
}

/// [`wait_until`] that also gives up when `abort` is raised.
pub async fn poll_until<F>(
    commander: &Commander,
    what: &str,
    interval: Duration,
    limit: Duration,
    abort: Option<&AbortSignal>,
    mut done: F,
) -> FlightResult<VehicleState>
where
    F: FnMut(&VehicleState) -> bool,
{
    let started = Instant::now();
    loop {
        if let Some(abort) = abort {
            abort.check()?;
        }
        let state = commander.read_state().await?;
        if done(&state) {
            return Ok(state);
        }
        let waited = started.elapsed();
        if waited >= limit {
            return Err(FlightError::Timeout {
                what: what.to_string(),
                waited,
            });
        }
        match abort {
            Some(abort) => abort.sleep(interval).await?,
            None => sleep(interval).await,
        }
    }
}

/// Requests `mode` and waits for the vehicle to report it.
pub async fn switch_mode(
    commander: &Commander,
    session: &CommandSession<'_>,
    mode: FlightMode,
    interval: Duration,
    limit: Duration,
) -> FlightResult<()> {
    switch_mode_or_abort(commander, session, mode, interval, limit, None).await
}

pub async fn switch_mode_or_abort(
    commander: &Commander,
    session: &CommandSession<'_>,
    mode: FlightMode,
    interval: Duration,
    limit: Duration,
    abort: Option<&AbortSignal>,
) -> FlightResult<()> {
    session.set_mode(mode).await?;
    let confirmed = poll_until(commander, "mode change", interval, limit, abort, |s| {
        s.is_mode(mode)
    })
    .await;
    match confirmed {
        Ok(_) => Ok(()),
        Err(FlightError::Timeout { .. }) => {
            let observed = commander
                .read_state()
                .await
                .map(|s| s.mode)
                .unwrap_or_else(|_| "unknown".to_string());
            Err(FlightError::ModeSwitchFailed {
                requested: mode.to_string(),
                observed,
            })
        }
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone)]
pub struct ActionLimits {
    pub poll_interval: Duration,
    pub mode_switch: Duration,
    pub armable: Duration,
    pub arm: Duration,
    pub climb: Duration,
    pub land: Duration,
}

impl Default for ActionLimits {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            mode_switch: Duration::from_secs(5),
            armable: Duration::from_secs(30),
            arm: Duration::from_secs(5),
            climb: Duration::from_secs(60),
            land: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    Armed,
    AlreadyArmed,
}

/// Switches to GUIDED and arms, waiting for the armed flag.
pub async fn arm(commander: &Commander, limits: &ActionLimits) -> FlightResult<ArmOutcome> {
    let state = commander.read_state().await?;
    if state.armed {
        info!("Arm requested, but vehicle already armed");
        return Ok(ArmOutcome::AlreadyArmed);
    }
    if !state.is_armable() {
        return Err(FlightError::precondition(
            "vehicle not armable (check pre-arm checks)",
        ));
    }

    let session = commander.session().await;
    switch_mode(
        commander,
        &session,
        FlightMode::Guided,
        limits.poll_interval,
        limits.mode_switch,
    )
    .await?;
    session.send(Command::Arm).await?;
    wait_until(
        commander,
        "arming",
        Duration::from_millis(200).min(limits.poll_interval),
        limits.arm,
        |s| s.armed,
    )
    .await?;
    info!("Vehicle armed");
    Ok(ArmOutcome::Armed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeoffOutcome {
    Reached,
    AlreadyFlying,
}

/// Arms and climbs to `altitude`, considered reached at 90 % of the target.
pub async fn arm_and_takeoff(
    commander: &Commander,
    altitude: f64,
    limits: &ActionLimits,
) -> FlightResult<TakeoffOutcome> {
    let state = commander.read_state().await?;
    if state.armed && state.altitude() > 1.0 {
        info!("Vehicle appears to be flying already");
        return Ok(TakeoffOutcome::AlreadyFlying);
    }

    info!("Basic pre-arm checks");
    wait_until(
        commander,
        "vehicle armable",
        limits.poll_interval,
        limits.armable,
        VehicleState::is_armable,
    )
    .await?;

    let session = commander.session().await;
    info!("Arming motors");
    switch_mode(
        commander,
        &session,
        FlightMode::Guided,
        limits.poll_interval,
        limits.mode_switch,
    )
    .await?;
    if !state.armed {
        session.send(Command::Arm).await?;
        wait_until(commander, "arming", limits.poll_interval, limits.arm, |s| {
            s.armed
        })
        .await?;
    }

    info!("Taking off to {}m!", altitude);
    session.send(Command::Takeoff { altitude }).await?;
    wait_until(
        commander,
        "takeoff altitude",
        limits.poll_interval,
        limits.climb,
        |s| {
            debug!(" Altitude: {:.2}m", s.altitude());
            s.altitude() >= altitude * 0.90
        },
    )
    .await?;
    info!("Reached target altitude");
    Ok(TakeoffOutcome::Reached)
}

/// Switches to LAND and waits for the vehicle to disarm on the ground.
pub async fn land(commander: &Commander, limits: &ActionLimits) -> FlightResult<()> {
    let session = commander.session().await;
    info!("Setting LAND mode...");
    session.set_mode(FlightMode::Land).await?;
    drop(session);

    wait_until(commander, "landing", limits.poll_interval, limits.land, |s| {
        if s.altitude() < 0.3 {
            debug!("Landed (or close to ground), waiting for disarm...");
        } else {
            debug!(" Landing... Altitude: {:.2}m", s.altitude());
        }
        !s.armed
    })
    .await?;
    info!("Vehicle landed and disarmed");
    Ok(())
}

/// Hands control to the autopilot's return-to-launch mode.
pub async fn return_to_launch(commander: &Commander) -> FlightResult<()> {
    info!("Initiating RTL");
    commander.session().await.set_mode(FlightMode::Rtl).await
}
