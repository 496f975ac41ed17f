// Timeouts, topics, motor and robot configuration
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::camera::CameraConfig;
use crate::error::{Error, Result};
use crate::messages::Joint;
use crate::robot::MaxRelativeTarget;

// Runtime loop frequency
pub const LOOP_HZ: u64 = 30;

// Command timeout for watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// Zenoh topics
pub const TOPIC_CMD_ACTION: &str = "so100/cmd/action"; // commands from the policy
pub const TOPIC_RT_ACTION: &str = "so100/rt/action"; // action actually applied
pub const TOPIC_OBSERVATION: &str = "so100/state/observation"; // joint state
pub const TOPIC_HEALTH: &str = "so100/state/health"; // health status

// Default serial ports for the two arms
pub const LEFT_PORT: &str = "/dev/ttyACM0";
pub const RIGHT_PORT: &str = "/dev/ttyACM1";

// Position-loop gains written during configuration.
// P is below the factory default of 32 to reduce shakiness.
pub const P_COEFFICIENT: i32 = 16;
pub const I_COEFFICIENT: i32 = 0;
pub const D_COEFFICIENT: i32 = 32;

// Continuous-rotation joint, calibrated to the full encoder span
pub const FULL_TURN_JOINT: Joint = Joint::WristRoll;

// Frame timeout for camera reads
pub const CAMERA_TIMEOUT: Duration = Duration::from_millis(200);

// Default calibration file
pub const CALIBRATION_PATH: &str = "calibration/bimanual_follower.json";

fn default_true() -> bool {
    true
}

/// Two-arm follower configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BimanualFollowerConfig {
    pub left_port: String,
    pub right_port: String,

    #[serde(default = "default_true")]
    pub disable_torque_on_disconnect: bool,

    /// Per-step bound on commanded motion: one value, or one per motor
    /// (left joints then right joints)
    #[serde(default)]
    pub max_relative_target: Option<MaxRelativeTarget>,

    #[serde(default)]
    pub cameras: BTreeMap<String, CameraConfig>,

    /// Degrees for body joints instead of [-100, 100]
    #[serde(default)]
    pub use_degrees: bool,

    #[serde(default)]
    pub calibration_path: Option<PathBuf>,
}

impl BimanualFollowerConfig {
    pub fn new(left_port: impl Into<String>, right_port: impl Into<String>) -> Self {
        Self {
            left_port: left_port.into(),
            right_port: right_port.into(),
            disable_torque_on_disconnect: true,
            max_relative_target: None,
            cameras: BTreeMap::new(),
            use_degrees: false,
            calibration_path: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_ports(&self.left_port, &self.right_port)?;
        if let Some(bound) = &self.max_relative_target {
            bound.validate(2 * Joint::ALL.len())?;
        }
        Ok(())
    }
}

/// Single-arm follower configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct So100FollowerConfig {
    pub port: String,

    #[serde(default = "default_true")]
    pub disable_torque_on_disconnect: bool,

    #[serde(default)]
    pub max_relative_target: Option<MaxRelativeTarget>,

    #[serde(default)]
    pub cameras: BTreeMap<String, CameraConfig>,

    #[serde(default)]
    pub use_degrees: bool,

    #[serde(default)]
    pub calibration_path: Option<PathBuf>,
}

impl So100FollowerConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            disable_torque_on_disconnect: true,
            max_relative_target: None,
            cameras: BTreeMap::new(),
            use_degrees: false,
            calibration_path: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(bound) = &self.max_relative_target {
            bound.validate(Joint::ALL.len())?;
        }
        Ok(())
    }
}

/// Two leader arms used as a teleoperation source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BimanualLeaderConfig {
    pub left_port: String,
    pub right_port: String,

    #[serde(default)]
    pub calibration_path: Option<PathBuf>,
}

impl BimanualLeaderConfig {
    pub fn validate(&self) -> Result<()> {
        validate_ports(&self.left_port, &self.right_port)
    }
}

fn validate_ports(left: &str, right: &str) -> Result<()> {
    if left == right {
        return Err(Error::InvalidConfiguration(format!(
            "left and right arms must use different ports (both are {left})"
        )));
    }
    Ok(())
}

/// Robot selection, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RobotConfig {
    BimanualFollower(BimanualFollowerConfig),
    So100Follower(So100FollowerConfig),
}

impl RobotConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            RobotConfig::BimanualFollower(c) => c.validate(),
            RobotConfig::So100Follower(c) => c.validate(),
        }
    }
}

/// Teleoperator selection, tagged by `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TeleopConfig {
    BimanualLeader(BimanualLeaderConfig),
}

/// Top-level file consumed by the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub robot: RobotConfig,
    #[serde(default)]
    pub teleop: Option<TeleopConfig>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.robot.validate()?;
        if let Some(TeleopConfig::BimanualLeader(leader)) = &config.teleop {
            leader.validate()?;
        }
        Ok(config)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            robot: RobotConfig::BimanualFollower(BimanualFollowerConfig::new(LEFT_PORT, RIGHT_PORT)),
            teleop: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_port_rejected() {
        let config = BimanualFollowerConfig::new("/dev/ttyUSB0", "/dev/ttyUSB0");
        assert!(matches!(config.validate(), Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn test_parse_tagged_config() {
        let json = r#"{
            "robot": {
                "type": "bimanual_follower",
                "left_port": "/dev/ttyUSB0",
                "right_port": "/dev/ttyUSB1",
                "max_relative_target": [10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10],
                "cameras": {"top": {"width": 640, "height": 480, "fps": 30}}
            },
            "teleop": {
                "type": "bimanual_leader",
                "left_port": "/dev/ttyUSB2",
                "right_port": "/dev/ttyUSB3"
            }
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        config.robot.validate().unwrap();
        match config.robot {
            RobotConfig::BimanualFollower(c) => {
                assert!(c.disable_torque_on_disconnect);
                assert!(!c.use_degrees);
                assert_eq!(c.cameras["top"].width, 640);
                assert!(matches!(c.max_relative_target, Some(MaxRelativeTarget::PerMotor(ref v)) if v.len() == 12));
            }
            other => panic!("unexpected robot config: {other:?}"),
        }
    }

    #[test]
    fn test_short_bound_list_rejected() {
        let json = r#"{
            "type": "bimanual_follower",
            "left_port": "a",
            "right_port": "b",
            "max_relative_target": [10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10]
        }"#;
        let config: RobotConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(config.validate(), Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn test_scalar_bound_parses() {
        let json = r#"{"type": "so100_follower", "port": "/dev/ttyACM0", "max_relative_target": 10}"#;
        let config: RobotConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        match config {
            RobotConfig::So100Follower(c) => {
                assert_eq!(c.max_relative_target, Some(MaxRelativeTarget::Uniform(10.0)));
            }
            other => panic!("unexpected robot config: {other:?}"),
        }
    }
}
