use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mavlink::ardupilotmega::{
    GpsFixType, MavAutopilot, MavCmd, MavFrame, MavMessage, MavModeFlag, MavState, MavType,
    PositionTargetTypemask, COMMAND_LONG_DATA, HEARTBEAT_DATA, REQUEST_DATA_STREAM_DATA,
    SET_POSITION_TARGET_GLOBAL_INT_DATA, SET_POSITION_TARGET_LOCAL_NED_DATA,
};
use mavlink::error::MessageReadError;
use mavlink::{MavConnection, MavHeader, MavlinkVersion};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::{Command, LinkConnector, LinkTimeouts, VehicleLink, VelocityFrame};
use crate::error::{FlightError, FlightResult};
use crate::vehicle::{Attitude, Battery, Coordinate, FlightMode, GpsInfo, VehicleState};

type MavConn = Box<dyn MavConnection<MavMessage> + Send + Sync>;

const GCS_SYSTEM_ID: u8 = 255;
const GCS_COMPONENT_ID: u8 = 190;
const STREAM_RATE_HZ: u16 = 4;
const READY_POLL: Duration = Duration::from_millis(100);

// Only velocity fields enabled.
const VELOCITY_TYPE_MASK: u16 = 0b0000_1111_1100_0111;
// Only position fields enabled.
const POSITION_TYPE_MASK: u16 = 0b0000_1111_1111_1000;

/// Accepts dronekit style `tcp:host:port` as well as native mavlink addresses.
pub fn normalize_endpoint(endpoint: &str) -> String {
    match endpoint.split_once(':') {
        Some(("tcp", rest)) => format!("tcpout:{}", rest),
        Some(("udp", rest)) => format!("udpin:{}", rest),
        Some(_) => endpoint.to_string(),
        None => format!("serial:{}:57600", endpoint),
    }
}

#[derive(Debug, Clone)]
struct Heartbeat {
    received_at: Instant,
    custom_mode: u32,
    armed: bool,
    system_status: String,
}

#[derive(Debug, Clone, Copy)]
struct Hud {
    airspeed: f64,
    groundspeed: f64,
    heading: f64,
}

/// Latest value of every message that makes up a [`VehicleState`].
#[derive(Debug, Default)]
struct Telemetry {
    target: Option<(u8, u8)>,
    heartbeat: Option<Heartbeat>,
    position: Option<Coordinate>,
    attitude: Option<Attitude>,
    hud: Option<Hud>,
    battery: Option<Battery>,
    gps: Option<GpsInfo>,
}

impl Telemetry {
    fn apply(&mut self, header: &MavHeader, message: &MavMessage) {
        match message {
            MavMessage::HEARTBEAT(hb) => {
                if hb.autopilot == MavAutopilot::MAV_AUTOPILOT_INVALID {
                    // another ground station
                    return;
                }
                if self.target.is_none() {
                    debug!(
                        "[LINK] Autopilot found at system {} component {}",
                        header.system_id, header.component_id
                    );
                }
                self.target = Some((header.system_id, header.component_id));
                self.heartbeat = Some(Heartbeat {
                    received_at: Instant::now(),
                    custom_mode: hb.custom_mode,
                    armed: hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED),
                    system_status: system_status_name(&hb.system_status),
                });
            }
            MavMessage::GLOBAL_POSITION_INT(pos) => {
                self.position = Some(Coordinate {
                    latitude: pos.lat as f64 / 1e7,
                    longitude: pos.lon as f64 / 1e7,
                    relative_altitude: pos.relative_alt as f64 / 1000.0,
                });
            }
            MavMessage::ATTITUDE(att) => {
                self.attitude = Some(Attitude {
                    roll: (att.roll as f64).to_degrees(),
                    pitch: (att.pitch as f64).to_degrees(),
                    yaw: (att.yaw as f64).to_degrees(),
                });
            }
            MavMessage::VFR_HUD(hud) => {
                self.hud = Some(Hud {
                    airspeed: hud.airspeed as f64,
                    groundspeed: hud.groundspeed as f64,
                    heading: hud.heading as f64,
                });
            }
            MavMessage::SYS_STATUS(sys) => {
                self.battery = Some(Battery {
                    voltage: sys.voltage_battery as f64 / 1000.0,
                    current: (sys.current_battery >= 0).then(|| sys.current_battery as f64 / 100.0),
                    level: (sys.battery_remaining >= 0).then(|| sys.battery_remaining as u8),
                });
            }
            MavMessage::GPS_RAW_INT(gps) => {
                self.gps = Some(GpsInfo {
                    fix_type: gps_fix_number(gps.fix_type),
                    satellites_visible: gps.satellites_visible,
                });
            }
            _ => {}
        }
    }

    fn snapshot(&self, heartbeat_timeout: Duration) -> Result<VehicleState, String> {
        let heartbeat = self.heartbeat.as_ref().ok_or("no heartbeat received")?;
        let silence = heartbeat.received_at.elapsed();
        if silence > heartbeat_timeout {
            return Err(format!("no heartbeat for {:?}", silence));
        }
        let position = self.position.ok_or("position unavailable")?;
        let attitude = self.attitude.ok_or("attitude unavailable")?;
        let hud = self.hud.ok_or("heading/speed unavailable")?;
        let battery = self.battery.ok_or("battery unavailable")?;
        let gps = self.gps.ok_or("gps unavailable")?;

        Ok(VehicleState {
            position,
            groundspeed: hud.groundspeed,
            airspeed: hud.airspeed,
            attitude,
            heading: hud.heading,
            battery,
            armed: heartbeat.armed,
            mode: FlightMode::name_of(heartbeat.custom_mode),
            system_status: heartbeat.system_status.clone(),
            gps,
        })
    }
}

fn system_status_name(state: &MavState) -> String {
    let name = format!("{:?}", state);
    name.trim_start_matches("MAV_STATE_").to_string()
}

fn gps_fix_number(fix: GpsFixType) -> u8 {
    fix as u8
}

fn command_long(target: (u8, u8), command: MavCmd, params: [f32; 7]) -> MavMessage {
    MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
        param1: params[0],
        param2: params[1],
        param3: params[2],
        param4: params[3],
        param5: params[4],
        param6: params[5],
        param7: params[6],
        command,
        target_system: target.0,
        target_component: target.1,
        confirmation: 0,
    })
}

/// MAVLink messages that carry out `command`, in send order.
fn encode_command(target: (u8, u8), command: &Command) -> Vec<MavMessage> {
    match command {
        Command::Arm | Command::Disarm => {
            let arm = if matches!(command, Command::Arm) { 1.0 } else { 0.0 };
            vec![command_long(
                target,
                MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
                [arm, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            )]
        }
        Command::Takeoff { altitude } => vec![command_long(
            target,
            MavCmd::MAV_CMD_NAV_TAKEOFF,
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, *altitude as f32],
        )],
        Command::Goto {
            target: coordinate,
            groundspeed,
        } => {
            let mut messages = Vec::with_capacity(2);
            if let Some(speed) = groundspeed {
                messages.push(command_long(
                    target,
                    MavCmd::MAV_CMD_DO_CHANGE_SPEED,
                    [1.0, *speed as f32, -1.0, 0.0, 0.0, 0.0, 0.0],
                ));
            }
            messages.push(MavMessage::SET_POSITION_TARGET_GLOBAL_INT(
                SET_POSITION_TARGET_GLOBAL_INT_DATA {
                    time_boot_ms: 0,
                    lat_int: (coordinate.latitude * 1e7).round() as i32,
                    lon_int: (coordinate.longitude * 1e7).round() as i32,
                    alt: coordinate.relative_altitude as f32,
                    vx: 0.0,
                    vy: 0.0,
                    vz: 0.0,
                    afx: 0.0,
                    afy: 0.0,
                    afz: 0.0,
                    yaw: 0.0,
                    yaw_rate: 0.0,
                    type_mask: PositionTargetTypemask::from_bits_truncate(POSITION_TYPE_MASK),
                    target_system: target.0,
                    target_component: target.1,
                    coordinate_frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
                },
            ));
            messages
        }
        Command::RelativeYaw {
            angle,
            rate,
            direction,
        } => vec![command_long(
            target,
            MavCmd::MAV_CMD_CONDITION_YAW,
            [
                *angle as f32,
                *rate as f32,
                direction.sign() as f32,
                1.0,
                0.0,
                0.0,
                0.0,
            ],
        )],
        Command::Velocity {
            north,
            east,
            down,
            frame,
        } => vec![MavMessage::SET_POSITION_TARGET_LOCAL_NED(
            SET_POSITION_TARGET_LOCAL_NED_DATA {
                time_boot_ms: 0,
                x: 0.0,
                y: 0.0,
                z: 0.0,
                vx: *north as f32,
                vy: *east as f32,
                vz: *down as f32,
                afx: 0.0,
                afy: 0.0,
                afz: 0.0,
                yaw: 0.0,
                yaw_rate: 0.0,
                type_mask: PositionTargetTypemask::from_bits_truncate(VELOCITY_TYPE_MASK),
                target_system: target.0,
                target_component: target.1,
                coordinate_frame: match frame {
                    VelocityFrame::LocalNed => MavFrame::MAV_FRAME_LOCAL_NED,
                    VelocityFrame::BodyNed => MavFrame::MAV_FRAME_BODY_NED,
                },
            },
        )],
    }
}

fn gcs_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_GCS,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::empty(),
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

pub struct MavlinkLink {
    conn: Arc<MavConn>,
    telemetry: Arc<RwLock<Telemetry>>,
    closed: Arc<AtomicBool>,
    heartbeat_timeout: Duration,
}

impl MavlinkLink {
    fn start(conn: MavConn, heartbeat_timeout: Duration) -> Self {
        let link = Self {
            conn: Arc::new(conn),
            telemetry: Arc::new(RwLock::new(Telemetry::default())),
            closed: Arc::new(AtomicBool::new(false)),
            heartbeat_timeout,
        };
        link.spawn_reader();
        link.spawn_heartbeat();
        link
    }

    fn spawn_reader(&self) {
        let conn = self.conn.clone();
        let telemetry = self.telemetry.clone();
        let closed = self.closed.clone();
        std::thread::Builder::new()
            .name("mavlink-reader".to_string())
            .spawn(move || {
                while !closed.load(Ordering::SeqCst) {
                    match conn.recv() {
                        Ok((header, message)) => {
                            let mut telemetry = telemetry.write().unwrap_or_else(|e| e.into_inner());
                            telemetry.apply(&header, &message);
                        }
                        Err(MessageReadError::Io(e))
                            if e.kind() == std::io::ErrorKind::WouldBlock =>
                        {
                            std::thread::sleep(Duration::from_millis(10));
                        }
                        Err(MessageReadError::Io(e)) => {
                            error!("[LINK] Read failed, stopping reader: {}", e);
                            closed.store(true, Ordering::SeqCst);
                        }
                        Err(e) => debug!("[LINK] Dropping unparsable message: {:?}", e),
                    }
                }
                debug!("[LINK] Reader thread stopped");
            })
            .map_err(|e| error!("[LINK] Failed to spawn reader thread: {}", e))
            .ok();
    }

    fn spawn_heartbeat(&self) {
        let conn = self.conn.clone();
        let closed = self.closed.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            while !closed.load(Ordering::SeqCst) {
                interval.tick().await;
                let conn = conn.clone();
                let sent =
                    tokio::task::spawn_blocking(move || conn.send(&gcs_header(), &gcs_heartbeat()))
                        .await;
                if let Ok(Err(e)) = sent {
                    warn!("[LINK] Failed to send GCS heartbeat: {}", e);
                }
            }
        });
    }

    fn target(&self) -> FlightResult<(u8, u8)> {
        self.telemetry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .target
            .ok_or(FlightError::LinkUnavailable)
    }

    async fn send_message(&self, message: MavMessage) -> FlightResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FlightError::LinkUnavailable);
        }
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || conn.send(&gcs_header(), &message))
            .await
            .map_err(FlightError::link)?
            .map_err(FlightError::link)?;
        Ok(())
    }

    async fn wait_for_heartbeat(&self) {
        while self.target().is_err() {
            sleep(READY_POLL).await;
        }
    }

    async fn wait_ready(&self) {
        loop {
            let ready = self
                .telemetry
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .snapshot(self.heartbeat_timeout);
            match ready {
                Ok(_) => return,
                Err(missing) => debug!("[LINK] Waiting for vehicle: {}", missing),
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    async fn request_streams(&self) -> FlightResult<()> {
        let (system, component) = self.target()?;
        self.send_message(MavMessage::REQUEST_DATA_STREAM(REQUEST_DATA_STREAM_DATA {
            req_message_rate: STREAM_RATE_HZ,
            target_system: system,
            target_component: component,
            // MAV_DATA_STREAM_ALL
            req_stream_id: 0,
            start_stop: 1,
        }))
        .await
    }
}

fn gcs_header() -> MavHeader {
    MavHeader {
        system_id: GCS_SYSTEM_ID,
        component_id: GCS_COMPONENT_ID,
        sequence: 0,
    }
}

#[async_trait]
impl VehicleLink for MavlinkLink {
    async fn read_state(&self) -> FlightResult<VehicleState> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FlightError::LinkUnavailable);
        }
        self.telemetry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot(self.heartbeat_timeout)
            .map_err(FlightError::Link)
    }

    async fn send_command(&self, command: Command) -> FlightResult<()> {
        let target = self.target()?;
        for message in encode_command(target, &command) {
            self.send_message(message).await?;
        }
        Ok(())
    }

    async fn set_mode(&self, mode: FlightMode) -> FlightResult<()> {
        let target = self.target()?;
        // MAV_MODE_FLAG_CUSTOM_MODE_ENABLED
        let message = command_long(
            target,
            MavCmd::MAV_CMD_DO_SET_MODE,
            [1.0, mode.custom_mode() as f32, 0.0, 0.0, 0.0, 0.0, 0.0],
        );
        self.send_message(message).await
    }

    async fn close(&self) {
        info!("[LINK] Closing vehicle connection");
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Opens MAVLink connections and waits for the vehicle to become ready.
#[derive(Debug, Default, Clone)]
pub struct MavlinkConnector;

#[async_trait]
impl LinkConnector for MavlinkConnector {
    async fn connect(
        &self,
        endpoint: &str,
        timeouts: &LinkTimeouts,
    ) -> FlightResult<Arc<dyn VehicleLink>> {
        let address = normalize_endpoint(endpoint);
        info!("[LINK] Connecting to vehicle on {}", address);

        let mut conn = tokio::task::spawn_blocking(move || mavlink::connect::<MavMessage>(&address))
            .await
            .map_err(FlightError::link)?
            .map_err(FlightError::link)?;
        conn.set_protocol_version(MavlinkVersion::V2);

        let link = MavlinkLink::start(conn, timeouts.heartbeat);

        if timeout(timeouts.heartbeat, link.wait_for_heartbeat())
            .await
            .is_err()
        {
            link.close().await;
            return Err(FlightError::Timeout {
                what: "autopilot heartbeat".to_string(),
                waited: timeouts.heartbeat,
            });
        }

        if let Err(e) = link.request_streams().await {
            link.close().await;
            return Err(e);
        }

        if timeout(timeouts.connect, link.wait_ready()).await.is_err() {
            link.close().await;
            return Err(FlightError::Timeout {
                what: "vehicle ready".to_string(),
                waited: timeouts.connect,
            });
        }

        info!("[LINK] Vehicle connected and ready");
        Ok(Arc::new(link))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::TurnDirection;

    const TARGET: (u8, u8) = (1, 1);

    fn filled_telemetry() -> Telemetry {
        Telemetry {
            target: Some(TARGET),
            heartbeat: Some(Heartbeat {
                received_at: Instant::now(),
                custom_mode: 4,
                armed: true,
                system_status: "ACTIVE".to_string(),
            }),
            position: Some(Coordinate::new(-35.36, 149.16, 10.0)),
            attitude: Some(Attitude::default()),
            hud: Some(Hud {
                airspeed: 0.0,
                groundspeed: 1.5,
                heading: 270.0,
            }),
            battery: Some(Battery {
                voltage: 12.6,
                current: None,
                level: Some(80),
            }),
            gps: Some(GpsInfo {
                fix_type: 3,
                satellites_visible: 10,
            }),
        }
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("tcp:127.0.0.1:5762"), "tcpout:127.0.0.1:5762");
        assert_eq!(normalize_endpoint("udpin:0.0.0.0:14550"), "udpin:0.0.0.0:14550");
        assert_eq!(normalize_endpoint("/dev/ttyACM0"), "serial:/dev/ttyACM0:57600");
    }

    #[test]
    fn test_snapshot_requires_every_part() {
        let mut telemetry = filled_telemetry();
        let state = telemetry.snapshot(Duration::from_secs(30)).unwrap();
        assert_eq!(state.mode, "GUIDED");
        assert!(state.armed);
        assert_eq!(state.heading, 270.0);

        telemetry.gps = None;
        let err = telemetry.snapshot(Duration::from_secs(30)).unwrap_err();
        assert!(err.contains("gps"));
    }

    #[test]
    fn test_snapshot_rejects_stale_heartbeat() {
        let mut telemetry = filled_telemetry();
        if let Some(heartbeat) = telemetry.heartbeat.as_mut() {
            heartbeat.received_at = Instant::now() - Duration::from_secs(60);
        }
        let err = telemetry.snapshot(Duration::from_secs(30)).unwrap_err();
        assert!(err.contains("no heartbeat"));
    }

    #[test]
    fn test_velocity_encoding_uses_velocity_mask() {
        let messages = encode_command(
            TARGET,
            &Command::Velocity {
                north: 2.0,
                east: 0.0,
                down: -0.5,
                frame: VelocityFrame::LocalNed,
            },
        );
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            MavMessage::SET_POSITION_TARGET_LOCAL_NED(data) => {
                assert_eq!(data.vx, 2.0);
                assert_eq!(data.vz, -0.5);
                assert_eq!(data.type_mask.bits(), VELOCITY_TYPE_MASK);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_relative_yaw_encoding() {
        let messages = encode_command(
            TARGET,
            &Command::RelativeYaw {
                angle: 30.0,
                rate: 0.0,
                direction: TurnDirection::Left,
            },
        );
        match &messages[0] {
            MavMessage::COMMAND_LONG(data) => {
                assert_eq!(data.command, MavCmd::MAV_CMD_CONDITION_YAW);
                assert_eq!(data.param1, 30.0);
                assert_eq!(data.param3, -1.0);
                assert_eq!(data.param4, 1.0);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_goto_with_groundspeed_sets_speed_first() {
        let messages = encode_command(
            TARGET,
            &Command::Goto {
                target: Coordinate::new(1.0, 2.0, 15.0),
                groundspeed: Some(5.0),
            },
        );
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], MavMessage::COMMAND_LONG(_)));
        match &messages[1] {
            MavMessage::SET_POSITION_TARGET_GLOBAL_INT(data) => {
                assert_eq!(data.lat_int, 10_000_000);
                assert_eq!(data.lon_int, 20_000_000);
                assert_eq!(data.alt, 15.0);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}
