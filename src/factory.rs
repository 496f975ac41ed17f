// Construction of robots and teleoperators from configuration
//
// The set of devices is closed: each config variant maps to exactly one
// constructor here, chosen at startup.

use tracing::info;

use crate::calibration::Operator;
use crate::config::{RobotConfig, TeleopConfig};
use crate::error::Result;
use crate::robot::{BimanualFollower, Robot, So100Follower};
use crate::teleop::{BimanualLeader, Teleoperator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotKind {
    BimanualFollower,
    So100Follower,
}

impl RobotKind {
    pub const ALL: [RobotKind; 2] = [RobotKind::BimanualFollower, RobotKind::So100Follower];

    pub fn of(config: &RobotConfig) -> Self {
        match config {
            RobotConfig::BimanualFollower(_) => RobotKind::BimanualFollower,
            RobotConfig::So100Follower(_) => RobotKind::So100Follower,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RobotKind::BimanualFollower => "bimanual_follower",
            RobotKind::So100Follower => "so100_follower",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeleopKind {
    BimanualLeader,
}

impl TeleopKind {
    pub fn of(config: &TeleopConfig) -> Self {
        match config {
            TeleopConfig::BimanualLeader(_) => TeleopKind::BimanualLeader,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TeleopKind::BimanualLeader => "bimanual_leader",
        }
    }
}

/// Build the robot described by `config`
///
/// With `mock` the robot runs on in-memory buses that start calibrated.
pub fn make_robot(config: &RobotConfig, operator: Box<dyn Operator>, mock: bool) -> Result<Box<dyn Robot>> {
    info!("Creating {} robot{}", RobotKind::of(config).name(), if mock { " (mock)" } else { "" });
    if mock {
        return mock::make_robot(config, operator);
    }
    Ok(match config {
        RobotConfig::BimanualFollower(c) => Box::new(BimanualFollower::from_config(c.clone(), operator)?),
        RobotConfig::So100Follower(c) => Box::new(So100Follower::from_config(c.clone(), operator)?),
    })
}

/// Build the teleoperator described by `config`
pub fn make_teleoperator(
    config: &TeleopConfig,
    operator: Box<dyn Operator>,
    mock: bool,
) -> Result<Box<dyn Teleoperator>> {
    info!("Creating {} teleoperator{}", TeleopKind::of(config).name(), if mock { " (mock)" } else { "" });
    if mock {
        return mock::make_teleoperator(config, operator);
    }
    Ok(match config {
        TeleopConfig::BimanualLeader(c) => Box::new(BimanualLeader::from_config(c.clone(), operator)?),
    })
}

#[cfg(feature = "mock")]
mod mock {
    use super::*;
    use crate::calibration::MemoryCalibrationStore;
    use crate::camera::make_cameras_from_configs;
    use crate::messages::Side;
    use crate::motor::mock::{MockMotorBus, full_range_calibration};
    use crate::motor::so100_motors;

    fn bus(port: &str, id_base: u8, use_degrees: bool) -> MockMotorBus {
        let motors = so100_motors(id_base, use_degrees);
        let calibration = full_range_calibration(&motors);
        MockMotorBus::new(port, motors).with_calibration(calibration)
    }

    pub(super) fn make_robot(config: &RobotConfig, operator: Box<dyn Operator>) -> Result<Box<dyn Robot>> {
        Ok(match config {
            RobotConfig::BimanualFollower(c) => Box::new(BimanualFollower::new(
                c.clone(),
                bus(&c.left_port, Side::Left.id_base(), c.use_degrees),
                bus(&c.right_port, Side::Right.id_base(), c.use_degrees),
                make_cameras_from_configs(&c.cameras),
                Box::new(MemoryCalibrationStore::default()),
                operator,
            )?),
            RobotConfig::So100Follower(c) => Box::new(So100Follower::new(
                c.clone(),
                bus(&c.port, 1, c.use_degrees),
                make_cameras_from_configs(&c.cameras),
                Box::new(MemoryCalibrationStore::default()),
                operator,
            )?),
        })
    }

    pub(super) fn make_teleoperator(
        config: &TeleopConfig,
        operator: Box<dyn Operator>,
    ) -> Result<Box<dyn Teleoperator>> {
        Ok(match config {
            TeleopConfig::BimanualLeader(c) => {
                c.validate()?;
                Box::new(BimanualLeader::new(
                    bus(&c.left_port, Side::Left.id_base(), false),
                    bus(&c.right_port, Side::Right.id_base(), false),
                    Box::new(MemoryCalibrationStore::default()),
                    operator,
                )?)
            }
        })
    }
}

#[cfg(not(feature = "mock"))]
mod mock {
    use super::*;
    use crate::error::Error;

    pub(super) fn make_robot(_config: &RobotConfig, _operator: Box<dyn Operator>) -> Result<Box<dyn Robot>> {
        Err(Error::Unsupported("mock hardware (built without the `mock` feature)"))
    }

    pub(super) fn make_teleoperator(
        _config: &TeleopConfig,
        _operator: Box<dyn Operator>,
    ) -> Result<Box<dyn Teleoperator>> {
        Err(Error::Unsupported("mock hardware (built without the `mock` feature)"))
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::calibration::NoOperator;
    use crate::config::{BimanualFollowerConfig, BimanualLeaderConfig};

    #[test]
    fn test_kind_follows_config_variant() {
        let config = RobotConfig::BimanualFollower(BimanualFollowerConfig::new("a", "b"));
        assert_eq!(RobotKind::of(&config), RobotKind::BimanualFollower);
        assert_eq!(RobotKind::ALL.len(), 2);
    }

    #[test]
    fn test_mock_robot_is_usable_end_to_end() {
        let config = RobotConfig::BimanualFollower(BimanualFollowerConfig::new("/dev/a", "/dev/b"));
        let mut robot = make_robot(&config, Box::new(NoOperator), true).unwrap();
        assert_eq!(robot.name(), "bimanual_follower");
        robot.connect(true).unwrap();
        assert_eq!(robot.get_observation().unwrap().joints.len(), 12);
        robot.disconnect().unwrap();
    }

    #[test]
    fn test_mock_teleop_rejects_shared_port() {
        let config = TeleopConfig::BimanualLeader(BimanualLeaderConfig {
            left_port: "/dev/a".into(),
            right_port: "/dev/a".into(),
            calibration_path: None,
        });
        assert!(make_teleoperator(&config, Box::new(NoOperator), true).is_err());
    }
}
