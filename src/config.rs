use std::time::Duration;

use anyhow::Result;
use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::connection::ConnectionSettings;
use crate::flight::ActionLimits;
use crate::link::LinkTimeouts;
use crate::manual::ManualSettings;
use crate::mission::{MissionPlan, SequencerSettings, TurnCompletion};

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub mavlink: MavlinkConfig,
    pub telemetry: TelemetryConfig,
    pub mission: MissionConfig,
    pub manual: ManualConfig,
    pub web: WebConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Timeouts and intervals are in seconds.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MavlinkConfig {
    pub connection_string: String,
    pub connect_timeout: u64,
    pub heartbeat_timeout: u64,
    pub retry_interval: u64,
}

impl Default for MavlinkConfig {
    fn default() -> Self {
        Self {
            connection_string: "tcp:127.0.0.1:5762".to_string(),
            connect_timeout: 60,
            heartbeat_timeout: 30,
            retry_interval: 5,
        }
    }
}

impl MavlinkConfig {
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            endpoint: self.connection_string.clone(),
            timeouts: LinkTimeouts {
                connect: Duration::from_secs(self.connect_timeout),
                heartbeat: Duration::from_secs(self.heartbeat_timeout),
            },
            retry_interval: Duration::from_secs(self.retry_interval),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Milliseconds between polls.
    pub update_interval: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            update_interval: 1000,
        }
    }
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.update_interval)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnPolicy {
    Heading,
    Settle,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MissionConfig {
    pub poll_interval: u64,
    pub mode_switch_timeout: u64,
    pub climb_timeout: u64,
    pub leg_timeout: u64,
    pub land_timeout: u64,
    pub groundspeed: Option<f64>,
    pub turn_policy: TurnPolicy,
    /// Degrees.
    pub turn_tolerance: f64,
    pub turn_timeout: u64,
    pub turn_settle: u64,
    pub plan: Option<MissionPlan>,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            poll_interval: 1,
            mode_switch_timeout: 5,
            climb_timeout: 60,
            leg_timeout: 120,
            land_timeout: 120,
            groundspeed: Some(5.0),
            turn_policy: TurnPolicy::Heading,
            turn_tolerance: 5.0,
            turn_timeout: 15,
            turn_settle: 5,
            plan: None,
        }
    }
}

impl MissionConfig {
    pub fn sequencer_settings(&self) -> SequencerSettings {
        let turn = match self.turn_policy {
            TurnPolicy::Heading => TurnCompletion::Heading {
                tolerance: self.turn_tolerance,
                timeout: Duration::from_secs(self.turn_timeout),
            },
            TurnPolicy::Settle => TurnCompletion::Settle(Duration::from_secs(self.turn_settle)),
        };
        SequencerSettings {
            poll_interval: Duration::from_secs(self.poll_interval),
            mode_switch_timeout: Duration::from_secs(self.mode_switch_timeout),
            climb_timeout: Duration::from_secs(self.climb_timeout),
            leg_timeout: Duration::from_secs(self.leg_timeout),
            land_timeout: Duration::from_secs(self.land_timeout),
            groundspeed: self.groundspeed,
            turn,
            ..SequencerSettings::default()
        }
    }

    pub fn plan(&self) -> MissionPlan {
        self.plan.clone().unwrap_or_default()
    }
}

/// Debounce windows are in milliseconds, other durations in seconds.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ManualConfig {
    pub takeoff_altitude: f64,
    pub default_speed: f64,
    pub altitude_change_speed: f64,
    pub yaw_rate_deg_s: f64,
    pub move_duration: u64,
    pub command_debounce: u64,
    pub movement_debounce: u64,
    pub yaw_debounce: u64,
    pub arm_timeout: u64,
    pub climb_timeout: u64,
    pub land_timeout: u64,
}

impl Default for ManualConfig {
    fn default() -> Self {
        Self {
            takeoff_altitude: 15.0,
            default_speed: 2.0,
            altitude_change_speed: 0.5,
            yaw_rate_deg_s: 30.0,
            move_duration: 1,
            command_debounce: 500,
            movement_debounce: 100,
            yaw_debounce: 200,
            arm_timeout: 5,
            climb_timeout: 60,
            land_timeout: 120,
        }
    }
}

impl ManualConfig {
    pub fn manual_settings(&self) -> ManualSettings {
        ManualSettings {
            takeoff_altitude: self.takeoff_altitude,
            default_speed: self.default_speed,
            altitude_change_speed: self.altitude_change_speed,
            yaw_rate_deg_s: self.yaw_rate_deg_s,
            move_duration: Duration::from_secs(self.move_duration),
            command_debounce: Duration::from_millis(self.command_debounce),
            movement_debounce: Duration::from_millis(self.movement_debounce),
            yaw_debounce: Duration::from_millis(self.yaw_debounce),
            limits: self.action_limits(),
        }
    }

    pub fn action_limits(&self) -> ActionLimits {
        ActionLimits {
            arm: Duration::from_secs(self.arm_timeout),
            climb: Duration::from_secs(self.climb_timeout),
            land: Duration::from_secs(self.land_timeout),
            ..ActionLimits::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let env = std::env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
        let config_path = format!("config/{}.toml", env);
        let fallback_path = format!("/etc/sortie/{}.toml", env);

        let config_builder = config::Config::builder();
        let config_builder = if std::path::Path::new(&config_path).exists() {
            config_builder.add_source(config::File::with_name(&config_path))
        } else {
            config_builder.add_source(config::File::with_name(&fallback_path).required(false))
        };
        let config_builder = config_builder.add_source(
            config::Environment::with_prefix("SORTIE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings = config_builder.build()?;
        let config = settings.try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mission::MissionStep;

    fn parse(toml: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = parse("");
        assert_eq!(config.mavlink.connection_string, "tcp:127.0.0.1:5762");
        assert_eq!(config.telemetry.interval(), Duration::from_secs(1));
        assert_eq!(config.manual.takeoff_altitude, 15.0);
        assert_eq!(config.mission.plan(), MissionPlan::default());

        let settings = config.mission.sequencer_settings();
        assert_eq!(
            settings.turn,
            TurnCompletion::Heading {
                tolerance: 5.0,
                timeout: Duration::from_secs(15)
            }
        );
        assert_eq!(settings.climb_fraction, 0.95);
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = parse(
            r#"
            [mavlink]
            connection_string = "udp:0.0.0.0:14550"
            retry_interval = 2

            [mission]
            turn_policy = "settle"
            turn_settle = 3

            [[mission.plan.steps]]
            step = "takeoff"
            altitude = 12.0

            [[mission.plan.steps]]
            step = "return_to_launch"

            [manual]
            movement_debounce = 50
            "#,
        );

        let connection = config.mavlink.connection_settings();
        assert_eq!(connection.endpoint, "udp:0.0.0.0:14550");
        assert_eq!(connection.retry_interval, Duration::from_secs(2));
        assert_eq!(connection.timeouts.connect, Duration::from_secs(60));

        assert_eq!(
            config.mission.sequencer_settings().turn,
            TurnCompletion::Settle(Duration::from_secs(3))
        );
        assert_eq!(
            config.mission.plan().steps,
            vec![
                MissionStep::Takeoff { altitude: 12.0 },
                MissionStep::ReturnToLaunch
            ]
        );
        assert_eq!(
            config.manual.manual_settings().movement_debounce,
            Duration::from_millis(50)
        );
    }
}
