// One SO-100 follower arm with unprefixed keys

use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

use super::arm::{ArmController, ArmRole, ArmState};
use super::safety::SafetyBounds;
use super::{
    Features, Robot, Teardown, check_cameras, connect_cameras, disconnect_cameras, drive_arm,
    features, join, read_cameras,
};
use crate::calibration::{
    CalibrationStore, JsonCalibrationStore, Operator, load_or_empty, merge_calibration,
    split_calibration,
};
use crate::camera::{CameraSet, make_cameras_from_configs};
use crate::config::So100FollowerConfig;
use crate::error::{Error, Result};
use crate::messages::{Action, JointKey, Observation, format_action, parse_action};
use crate::motor::{CalibrationMap, FeetechMotorsBus, MotorBus, so100_motors};

const NAME: &str = "so100_follower";

pub struct So100Follower<B: MotorBus = FeetechMotorsBus> {
    config: So100FollowerConfig,
    arm: ArmController<B>,
    cameras: CameraSet,
    bounds: Option<SafetyBounds>,
    store: Box<dyn CalibrationStore>,
    operator: Box<dyn Operator>,
    observation_features: Features,
    action_features: Features,
}

impl So100Follower<FeetechMotorsBus> {
    pub fn from_config(config: So100FollowerConfig, operator: Box<dyn Operator>) -> Result<Self> {
        config.validate()?;
        let bus = FeetechMotorsBus::new(
            config.port.clone(),
            so100_motors(1, config.use_degrees),
            CalibrationMap::new(),
        );
        let path = config
            .calibration_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("calibration/{NAME}.json")));
        let cameras = make_cameras_from_configs(&config.cameras);
        Self::new(config, bus, cameras, Box::new(JsonCalibrationStore::new(path)), operator)
    }
}

impl<B: MotorBus> So100Follower<B> {
    pub fn new(
        config: So100FollowerConfig,
        mut bus: B,
        cameras: CameraSet,
        store: Box<dyn CalibrationStore>,
        operator: Box<dyn Operator>,
    ) -> Result<Self> {
        config.validate()?;
        check_cameras(&cameras, &config.cameras)?;

        let calibration = split_calibration(&load_or_empty(store.as_ref())?, None);
        if !calibration.is_empty() {
            bus.set_calibration(calibration);
        }

        let arm = ArmController::new(None, ArmRole::Follower, bus)
            .with_disable_torque_on_disconnect(config.disable_torque_on_disconnect);
        let keys = arm.keys();
        let bounds = config
            .max_relative_target
            .as_ref()
            .map(|bound| bound.resolve(&keys))
            .transpose()?;
        let (observation_features, action_features) = features(&keys, &config.cameras);

        Ok(Self {
            config,
            arm,
            cameras,
            bounds,
            store,
            operator,
            observation_features,
            action_features,
        })
    }

    pub fn config(&self) -> &So100FollowerConfig {
        &self.config
    }

    pub fn arm(&self) -> &ArmController<B> {
        &self.arm
    }
}

impl<B: MotorBus> Robot for So100Follower<B> {
    fn name(&self) -> &'static str {
        NAME
    }

    fn observation_features(&self) -> &Features {
        &self.observation_features
    }

    fn action_features(&self) -> &Features {
        &self.action_features
    }

    fn is_connected(&self) -> bool {
        self.arm.is_connected() && self.cameras.values().all(|c| c.is_connected())
    }

    fn is_calibrated(&self) -> bool {
        self.arm.is_calibrated()
    }

    fn connect(&mut self, calibrate: bool) -> Result<()> {
        if self.arm.is_connected() || self.cameras.values().any(|c| c.is_connected()) {
            return Err(Error::AlreadyConnected(NAME.to_string()));
        }
        self.arm.connect_bus()?;
        if !self.is_calibrated() && calibrate {
            self.calibrate()?;
        }
        connect_cameras(&mut self.cameras)?;
        self.configure()?;
        info!("{} connected", NAME);
        Ok(())
    }

    fn calibrate(&mut self) -> Result<()> {
        let reconfigure = self.arm.state() == ArmState::Configured;
        let calibration = self.arm.calibrate(self.operator.as_mut())?;
        self.store.save(&merge_calibration(&[(None, &calibration)]))?;
        if reconfigure {
            self.arm.configure()?;
        }
        Ok(())
    }

    fn configure(&mut self) -> Result<()> {
        self.arm.configure()
    }

    fn setup_motors(&mut self) -> Result<()> {
        self.arm.setup_motors(self.operator.as_mut())
    }

    fn get_observation(&mut self) -> Result<Observation> {
        if !self.is_connected() {
            return Err(Error::NotConnected(NAME.to_string()));
        }
        let Self { arm, cameras, .. } = self;
        let (positions, images) = join(move || arm.read_positions(), move || read_cameras(cameras));
        let joints = positions?
            .into_iter()
            .map(|(joint, v)| (JointKey::bare(joint), v))
            .collect();
        Ok(Observation {
            joints,
            images: images?,
        })
    }

    fn send_action(&mut self, action: &Action) -> Result<Action> {
        if !self.is_connected() {
            return Err(Error::NotConnected(NAME.to_string()));
        }
        let goals: BTreeMap<_, _> = parse_action(action, false)?
            .into_iter()
            .map(|(key, goal)| (key.joint, goal))
            .collect();
        let sent = drive_arm(&mut self.arm, &goals, self.bounds.as_ref())?;
        Ok(format_action(&sent))
    }

    fn disconnect(&mut self) -> Result<()> {
        if !self.arm.is_connected() && !self.cameras.values().any(|c| c.is_connected()) {
            return Err(Error::NotConnected(NAME.to_string()));
        }
        let mut teardown = Teardown::default();
        if self.arm.is_connected() {
            teardown.attempt("arm", self.arm.disconnect());
        }
        disconnect_cameras(&mut self.cameras, &mut teardown);
        info!("{} disconnected", NAME);
        teardown.finish()
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::calibration::{MemoryCalibrationStore, NoOperator};
    use crate::motor::mock::{MockMotorBus, full_range_calibration};

    fn follower(config: So100FollowerConfig) -> So100Follower<MockMotorBus> {
        let motors = so100_motors(1, false);
        let store = MemoryCalibrationStore::with(merge_calibration(&[(None, &full_range_calibration(&motors))]));
        let bus = MockMotorBus::new(config.port.clone(), motors);
        So100Follower::new(config, bus, CameraSet::new(), Box::new(store), Box::new(NoOperator)).unwrap()
    }

    #[test]
    fn test_keys_are_unprefixed() {
        let robot = follower(So100FollowerConfig::new("/dev/ttyACM0"));
        let keys: Vec<&str> = robot.action_features().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            [
                "shoulder_pan.pos",
                "shoulder_lift.pos",
                "elbow_flex.pos",
                "wrist_flex.pos",
                "wrist_roll.pos",
                "gripper.pos"
            ]
        );
    }

    #[test]
    fn test_stored_calibration_is_loaded() {
        let mut robot = follower(So100FollowerConfig::new("/dev/ttyACM0"));
        assert!(robot.is_calibrated());
        robot.connect(true).unwrap();
        let obs = robot.get_observation().unwrap();
        assert_eq!(obs.keys().len(), 6);
        assert!(obs.joints.keys().all(|k| k.side.is_none()));
    }

    #[test]
    fn test_prefixed_keys_are_ignored() {
        let mut config = So100FollowerConfig::new("/dev/ttyACM0");
        config.max_relative_target = Some(crate::robot::MaxRelativeTarget::Uniform(5.0));
        let mut robot = follower(config);
        robot.connect(false).unwrap();

        let mut action = Action::new();
        action.insert("left_gripper.pos".into(), 90.0);
        action.insert("gripper.pos".into(), 90.0);
        let sent = robot.send_action(&action).unwrap();
        assert_eq!(sent.len(), 1);
        // Gripper starts at mid-range (50) and may move 5 per step
        let applied = sent["gripper.pos"];
        assert!((applied - 55.0).abs() < 0.1, "applied {applied}");
    }
}
