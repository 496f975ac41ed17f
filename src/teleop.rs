// Leader arms as an action source
//
// The operator back-drives two SO-100 arms with torque off; their positions
// are read every tick and forwarded to a follower as a prefixed action map.

use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

use crate::calibration::{
    CalibrationStore, JsonCalibrationStore, Operator, load_or_empty, merge_calibration,
    split_calibration,
};
use crate::config::BimanualLeaderConfig;
use crate::error::{Error, Result};
use crate::messages::{Action, FeatureType, JointKey, Side, format_action};
use crate::motor::{CalibrationMap, FeetechMotorsBus, MotorBus, so100_motors};
use crate::robot::{ArmController, ArmRole, Features, Teardown, join};

const NAME: &str = "bimanual_leader";

/// A device that produces actions for a robot
pub trait Teleoperator: Send {
    fn name(&self) -> &'static str;

    fn action_features(&self) -> &Features;

    fn is_connected(&self) -> bool;

    fn is_calibrated(&self) -> bool;

    fn connect(&mut self, calibrate: bool) -> Result<()>;

    fn calibrate(&mut self) -> Result<()>;

    fn configure(&mut self) -> Result<()>;

    fn setup_motors(&mut self) -> Result<()>;

    fn get_action(&mut self) -> Result<Action>;

    /// Push robot state back to the operator (force feedback, haptics)
    fn send_feedback(&mut self, feedback: &Action) -> Result<()>;

    fn disconnect(&mut self) -> Result<()>;
}

pub struct BimanualLeader<B: MotorBus = FeetechMotorsBus> {
    left: ArmController<B>,
    right: ArmController<B>,
    store: Box<dyn CalibrationStore>,
    operator: Box<dyn Operator>,
    action_features: Features,
}

impl BimanualLeader<FeetechMotorsBus> {
    pub fn from_config(config: BimanualLeaderConfig, operator: Box<dyn Operator>) -> Result<Self> {
        config.validate()?;
        let left = FeetechMotorsBus::new(
            config.left_port.clone(),
            so100_motors(Side::Left.id_base(), false),
            CalibrationMap::new(),
        );
        let right = FeetechMotorsBus::new(
            config.right_port.clone(),
            so100_motors(Side::Right.id_base(), false),
            CalibrationMap::new(),
        );
        let path = config
            .calibration_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("calibration/{NAME}.json")));
        Self::new(left, right, Box::new(JsonCalibrationStore::new(path)), operator)
    }
}

impl<B: MotorBus> BimanualLeader<B> {
    pub fn new(
        mut left_bus: B,
        mut right_bus: B,
        store: Box<dyn CalibrationStore>,
        operator: Box<dyn Operator>,
    ) -> Result<Self> {
        if left_bus.port() == right_bus.port() {
            return Err(Error::InvalidConfiguration(format!(
                "left and right leader arms share port {}",
                left_bus.port()
            )));
        }
        let stored = load_or_empty(store.as_ref())?;
        for (side, bus) in [(Side::Left, &mut left_bus), (Side::Right, &mut right_bus)] {
            let calibration = split_calibration(&stored, Some(side));
            if !calibration.is_empty() {
                bus.set_calibration(calibration);
            }
        }

        let left = ArmController::new(Some(Side::Left), ArmRole::Leader, left_bus);
        let right = ArmController::new(Some(Side::Right), ArmRole::Leader, right_bus);
        let action_features = left
            .keys()
            .into_iter()
            .chain(right.keys())
            .map(|k| (k.wire_key(), FeatureType::Scalar))
            .collect();

        Ok(Self {
            left,
            right,
            store,
            operator,
            action_features,
        })
    }

    pub fn left(&self) -> &ArmController<B> {
        &self.left
    }

    pub fn right(&self) -> &ArmController<B> {
        &self.right
    }
}

impl<B: MotorBus> Teleoperator for BimanualLeader<B> {
    fn name(&self) -> &'static str {
        NAME
    }

    fn action_features(&self) -> &Features {
        &self.action_features
    }

    fn is_connected(&self) -> bool {
        self.left.is_connected() && self.right.is_connected()
    }

    fn is_calibrated(&self) -> bool {
        self.left.is_calibrated() && self.right.is_calibrated()
    }

    fn connect(&mut self, calibrate: bool) -> Result<()> {
        if self.left.is_connected() || self.right.is_connected() {
            return Err(Error::AlreadyConnected(NAME.to_string()));
        }
        self.left.connect_bus()?;
        self.right.connect_bus()?;
        if !self.is_calibrated() && calibrate {
            self.calibrate()?;
        }
        self.configure()?;
        info!("{} connected", NAME);
        Ok(())
    }

    fn calibrate(&mut self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected(NAME.to_string()));
        }
        let operator = self.operator.as_mut();
        let left = self.left.measure_calibration(operator)?;
        let right = self.right.measure_calibration(operator)?;
        self.left.apply_calibration(left.clone())?;
        self.right.apply_calibration(right.clone())?;
        self.store
            .save(&merge_calibration(&[(Some(Side::Left), &left), (Some(Side::Right), &right)]))?;
        // Leaders never hold torque, so the arms are ready as soon as they are configured
        self.configure()
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

    fn get_action(&mut self) -> Result<Action> {
        if !self.is_connected() {
            return Err(Error::NotConnected(NAME.to_string()));
        }
        let Self { left, right, .. } = self;
        let (left_pos, right_pos) = join(move || left.read_positions(), move || right.read_positions());

        let mut targets = BTreeMap::new();
        for (side, positions) in [(Side::Left, left_pos?), (Side::Right, right_pos?)] {
            targets.extend(positions.into_iter().map(|(joint, v)| (JointKey::sided(side, joint), v)));
        }
        Ok(format_action(&targets))
    }

    fn send_feedback(&mut self, _feedback: &Action) -> Result<()> {
        Err(Error::Unsupported("feedback on SO-100 leader arms"))
    }

    fn disconnect(&mut self) -> Result<()> {
        if !self.left.is_connected() && !self.right.is_connected() {
            return Err(Error::NotConnected(NAME.to_string()));
        }
        let mut teardown = Teardown::default();
        for arm in [&mut self.left, &mut self.right] {
            if arm.is_connected() {
                let label = arm.label().to_string();
                teardown.attempt(&label, arm.disconnect());
            }
        }
        info!("{} disconnected", NAME);
        teardown.finish()
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::calibration::{MemoryCalibrationStore, NoOperator};
    use crate::motor::mock::{MockMotorBus, full_range_calibration};
    use crate::motor::Register;
    use crate::messages::Joint;

    fn leader() -> BimanualLeader<MockMotorBus> {
        let left_motors = so100_motors(1, false);
        let right_motors = so100_motors(7, false);
        let store = MemoryCalibrationStore::with(merge_calibration(&[
            (Some(Side::Left), &full_range_calibration(&left_motors)),
            (Some(Side::Right), &full_range_calibration(&right_motors)),
        ]));
        BimanualLeader::new(
            MockMotorBus::new("/dev/leader_left", left_motors),
            MockMotorBus::new("/dev/leader_right", right_motors),
            Box::new(store),
            Box::new(NoOperator),
        )
        .unwrap()
    }

    #[test]
    fn test_get_action_reads_both_arms_with_torque_off() {
        let mut leader = leader();
        leader.connect(true).unwrap();
        let left = leader.left().bus().handle();
        left.set_positions(&[(Joint::Gripper, 4095)].into_iter().collect());

        let action = leader.get_action().unwrap();
        assert_eq!(action.len(), 12);
        assert_eq!(action["left_gripper.pos"], 100.0);
        assert!(action.contains_key("right_shoulder_pan.pos"));
        assert_eq!(left.register(Joint::Gripper, Register::TorqueEnable), Some(0));
    }

    #[test]
    fn test_feedback_is_unsupported() {
        let mut leader = leader();
        assert!(matches!(leader.send_feedback(&Action::new()), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_get_action_requires_connection() {
        let mut leader = leader();
        assert!(matches!(leader.get_action(), Err(Error::NotConnected(_))));
    }
}
