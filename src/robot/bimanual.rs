// Two follower arms and their cameras as one device
//
// Keys are prefixed `left_` / `right_` on the wire; internally every joint is
// a `JointKey` with a side tag. Left and right bus traffic is issued in
// parallel since the arms sit on independent serial links.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info};

use super::arm::{ArmController, ArmRole, ArmState};
use super::safety::SafetyBounds;
use super::{
    Features, Robot, Teardown, check_cameras, connect_cameras, disconnect_cameras, drive_arm,
    features, join, read_cameras,
};
use crate::calibration::{
    CalibrationFile, CalibrationStore, JsonCalibrationStore, Operator, load_or_empty, merge_calibration,
    split_calibration,
};
use crate::camera::{CameraSet, make_cameras_from_configs};
use crate::config::{BimanualFollowerConfig, CALIBRATION_PATH};
use crate::error::{Error, Result};
use crate::messages::{Action, Joint, JointKey, Observation, Side, format_action, parse_action};
use crate::motor::{CalibrationMap, FeetechMotorsBus, MotorBus, so100_motors};

const NAME: &str = "bimanual_follower";

pub struct BimanualFollower<B: MotorBus = FeetechMotorsBus> {
    config: BimanualFollowerConfig,
    left: ArmController<B>,
    right: ArmController<B>,
    cameras: CameraSet,
    bounds: Option<SafetyBounds>,
    store: Box<dyn CalibrationStore>,
    operator: Box<dyn Operator>,
    observation_features: Features,
    action_features: Features,
}

impl BimanualFollower<FeetechMotorsBus> {
    /// Build the Feetech-backed follower described by `config`
    pub fn from_config(config: BimanualFollowerConfig, operator: Box<dyn Operator>) -> Result<Self> {
        config.validate()?;
        let bus = |port: &str, side: Side| {
            FeetechMotorsBus::new(
                port,
                so100_motors(side.id_base(), config.use_degrees),
                CalibrationMap::new(),
            )
        };
        let left = bus(&config.left_port, Side::Left);
        let right = bus(&config.right_port, Side::Right);
        let path = config
            .calibration_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(CALIBRATION_PATH));
        let cameras = make_cameras_from_configs(&config.cameras);
        Self::new(config, left, right, cameras, Box::new(JsonCalibrationStore::new(path)), operator)
    }
}

impl<B: MotorBus> BimanualFollower<B> {
    /// Assemble the device from its parts
    ///
    /// Validates the configuration before anything else, then loads the
    /// stored calibration into both buses. No hardware I/O happens here.
    pub fn new(
        config: BimanualFollowerConfig,
        mut left_bus: B,
        mut right_bus: B,
        cameras: CameraSet,
        store: Box<dyn CalibrationStore>,
        operator: Box<dyn Operator>,
    ) -> Result<Self> {
        config.validate()?;
        if left_bus.port() == right_bus.port() {
            return Err(Error::InvalidConfiguration(format!(
                "left and right buses share port {}",
                left_bus.port()
            )));
        }
        let left_ids: Vec<u8> = left_bus.motors().values().map(|m| m.id).collect();
        if let Some(id) = right_bus.motors().values().map(|m| m.id).find(|id| left_ids.contains(id)) {
            return Err(Error::InvalidConfiguration(format!(
                "motor id {id} is used by both arms"
            )));
        }
        check_cameras(&cameras, &config.cameras)?;

        let stored = load_or_empty(store.as_ref())?;
        for (side, bus) in [(Side::Left, &mut left_bus), (Side::Right, &mut right_bus)] {
            let calibration = split_calibration(&stored, Some(side));
            if !calibration.is_empty() {
                bus.set_calibration(calibration);
            }
        }

        let torque_off = config.disable_torque_on_disconnect;
        let left = ArmController::new(Some(Side::Left), ArmRole::Follower, left_bus)
            .with_disable_torque_on_disconnect(torque_off);
        let right = ArmController::new(Some(Side::Right), ArmRole::Follower, right_bus)
            .with_disable_torque_on_disconnect(torque_off);

        let keys: Vec<JointKey> = left.keys().into_iter().chain(right.keys()).collect();
        let bounds = config
            .max_relative_target
            .as_ref()
            .map(|bound| bound.resolve(&keys))
            .transpose()?;
        let (observation_features, action_features) = features(&keys, &config.cameras);

        Ok(Self {
            config,
            left,
            right,
            cameras,
            bounds,
            store,
            operator,
            observation_features,
            action_features,
        })
    }

    pub fn config(&self) -> &BimanualFollowerConfig {
        &self.config
    }

    pub fn left(&self) -> &ArmController<B> {
        &self.left
    }

    pub fn right(&self) -> &ArmController<B> {
        &self.right
    }

    /// Combined calibration in the persisted layout
    pub fn calibration(&self) -> CalibrationFile {
        merge_calibration(&[
            (Some(Side::Left), self.left.calibration()),
            (Some(Side::Right), self.right.calibration()),
        ])
    }

    fn require_connected(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected(NAME.to_string()));
        }
        Ok(())
    }
}

impl<B: MotorBus> Robot for BimanualFollower<B> {
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
        self.left.is_connected()
            && self.right.is_connected()
            && self.cameras.values().all(|c| c.is_connected())
    }

    fn is_calibrated(&self) -> bool {
        self.left.is_calibrated() && self.right.is_calibrated()
    }

    fn connect(&mut self, calibrate: bool) -> Result<()> {
        if self.left.is_connected()
            || self.right.is_connected()
            || self.cameras.values().any(|c| c.is_connected())
        {
            return Err(Error::AlreadyConnected(NAME.to_string()));
        }

        self.left.connect_bus()?;
        self.right.connect_bus()?;
        if !self.is_calibrated() && calibrate {
            info!("Mismatch between calibration values and the arms, running calibration");
            self.calibrate()?;
        }
        connect_cameras(&mut self.cameras)?;
        self.configure()?;
        info!("{} connected", NAME);
        Ok(())
    }

    fn calibrate(&mut self) -> Result<()> {
        if !self.left.is_connected() || !self.right.is_connected() {
            return Err(Error::NotConnected(NAME.to_string()));
        }
        let reconfigure = self.left.state() == ArmState::Configured
            && self.right.state() == ArmState::Configured;

        // One arm at a time: each needs the operator's full attention
        let operator = self.operator.as_mut();
        let left = self.left.measure_calibration(operator)?;
        let right = self.right.measure_calibration(operator)?;

        self.left.apply_calibration(left.clone())?;
        self.right.apply_calibration(right.clone())?;
        let combined = merge_calibration(&[(Some(Side::Left), &left), (Some(Side::Right), &right)]);
        self.store.save(&combined)?;
        info!("{} calibrated ({} motors)", NAME, combined.len());

        if reconfigure {
            self.configure()?;
        }
        Ok(())
    }

    fn configure(&mut self) -> Result<()> {
        self.left.configure()?;
        self.right.configure()
    }

    fn setup_motors(&mut self) -> Result<()> {
        let operator = self.operator.as_mut();
        self.left.setup_motors(operator)?;
        self.right.setup_motors(operator)
    }

    fn get_observation(&mut self) -> Result<Observation> {
        self.require_connected()?;
        let start = Instant::now();

        let Self {
            left,
            right,
            cameras,
            ..
        } = self;
        let ((left_pos, right_pos), images) = join(
            move || join(move || left.read_positions(), move || right.read_positions()),
            move || read_cameras(cameras),
        );

        let mut joints = BTreeMap::new();
        for (side, positions) in [(Side::Left, left_pos?), (Side::Right, right_pos?)] {
            joints.extend(positions.into_iter().map(|(joint, v)| (JointKey::sided(side, joint), v)));
        }
        let observation = Observation {
            joints,
            images: images?,
        };
        debug!("{} observation: {:.1}ms", NAME, start.elapsed().as_secs_f64() * 1e3);
        Ok(observation)
    }

    fn send_action(&mut self, action: &Action) -> Result<Action> {
        self.require_connected()?;

        let mut left_goals: BTreeMap<Joint, f32> = BTreeMap::new();
        let mut right_goals: BTreeMap<Joint, f32> = BTreeMap::new();
        for (key, goal) in parse_action(action, true)? {
            match key.side {
                Some(Side::Left) => left_goals.insert(key.joint, goal),
                Some(Side::Right) => right_goals.insert(key.joint, goal),
                None => None,
            };
        }

        let Self {
            left,
            right,
            bounds,
            ..
        } = self;
        let bounds = bounds.as_ref();
        let (left_sent, right_sent) = join(
            move || drive_arm(left, &left_goals, bounds),
            move || drive_arm(right, &right_goals, bounds),
        );

        let mut sent = left_sent?;
        sent.extend(right_sent?);
        Ok(format_action(&sent))
    }

    fn disconnect(&mut self) -> Result<()> {
        let anything_connected = self.left.is_connected()
            || self.right.is_connected()
            || self.cameras.values().any(|c| c.is_connected());
        if !anything_connected {
            return Err(Error::NotConnected(NAME.to_string()));
        }

        let mut teardown = Teardown::default();
        for arm in [&mut self.left, &mut self.right] {
            if arm.is_connected() {
                let label = arm.label().to_string();
                teardown.attempt(&label, arm.disconnect());
            }
        }
        disconnect_cameras(&mut self.cameras, &mut teardown);
        info!("{} disconnected", NAME);
        teardown.finish()
    }
}
