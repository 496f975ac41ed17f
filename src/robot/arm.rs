// Single-arm controller
//
// Owns one motor bus and walks it through
//   Unconnected -> Connected -> Configured
// Reads and writes of positions are only valid once configured; calibration
// drops the arm back to Connected because it changes torque and mode.

use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::calibration::{Operator, run_calibration};
use crate::config::{D_COEFFICIENT, I_COEFFICIENT, P_COEFFICIENT};
use crate::error::{Error, Result};
use crate::messages::{Joint, JointKey, Side};
use crate::motor::{
    CalibrationMap, MotorBus, MotorCalibration, MotorNormMode, OperatingMode, RawValues, Register,
};

/// Lifecycle of one arm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmState {
    Unconnected,
    Connected,
    Configured,
}

/// How the arm is used once configured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmRole {
    /// Holds commanded goals with torque on
    Follower,
    /// Back-driven by hand with torque off
    Leader,
}

/// What `connect` did about calibration
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectOutcome {
    AlreadyCalibrated,
    Calibrated(CalibrationMap),
    /// No usable calibration and none was requested
    Uncalibrated,
}

pub struct ArmController<B: MotorBus> {
    label: String,
    side: Option<Side>,
    role: ArmRole,
    bus: B,
    state: ArmState,
    disable_torque_on_disconnect: bool,
}

impl<B: MotorBus> ArmController<B> {
    pub fn new(side: Option<Side>, role: ArmRole, bus: B) -> Self {
        let label = match side {
            Some(side) => format!("{side} arm"),
            None => "arm".to_string(),
        };
        Self {
            label,
            side,
            role,
            bus,
            state: ArmState::Unconnected,
            disable_torque_on_disconnect: true,
        }
    }

    pub fn with_disable_torque_on_disconnect(mut self, disable: bool) -> Self {
        self.disable_torque_on_disconnect = disable;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn side(&self) -> Option<Side> {
        self.side
    }

    pub fn state(&self) -> ArmState {
        self.state
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn is_connected(&self) -> bool {
        self.bus.is_connected()
    }

    pub fn is_calibrated(&self) -> bool {
        self.bus.is_calibrated()
    }

    pub fn calibration(&self) -> &CalibrationMap {
        self.bus.calibration()
    }

    /// Typed keys of this arm, in joint order
    pub fn keys(&self) -> Vec<JointKey> {
        self.bus
            .motors()
            .keys()
            .map(|&joint| JointKey {
                side: self.side,
                joint,
            })
            .collect()
    }

    /// Open the bus only
    pub fn connect_bus(&mut self) -> Result<()> {
        if self.bus.is_connected() {
            return Err(Error::AlreadyConnected(self.label.clone()));
        }
        self.bus.connect()?;
        self.state = ArmState::Connected;
        info!("{} connected on {}", self.label, self.bus.port());
        Ok(())
    }

    /// Open the bus, calibrate if needed and allowed, then configure
    pub fn connect(&mut self, calibrate: bool, operator: &mut dyn Operator) -> Result<ConnectOutcome> {
        self.connect_bus()?;
        let outcome = if self.is_calibrated() {
            ConnectOutcome::AlreadyCalibrated
        } else if calibrate {
            info!("No calibration found for {}, running calibration", self.label);
            ConnectOutcome::Calibrated(self.calibrate(operator)?)
        } else {
            warn!("{} has no usable calibration; positions cannot be normalized", self.label);
            ConnectOutcome::Uncalibrated
        };
        self.configure()?;
        Ok(outcome)
    }

    fn require(&self, needed: ArmState) -> Result<()> {
        match (self.state, needed) {
            (ArmState::Unconnected, _) => Err(Error::NotConnected(self.label.clone())),
            (ArmState::Connected, ArmState::Configured) => Err(Error::NotConnected(format!(
                "{} (connected but not configured)",
                self.label
            ))),
            _ => Ok(()),
        }
    }

    /// Run the calibration protocol without touching the stored calibration
    pub fn measure_calibration(&mut self, operator: &mut dyn Operator) -> Result<CalibrationMap> {
        self.require(ArmState::Connected)?;
        // Calibration turns torque off and resets the operating mode
        self.state = ArmState::Connected;
        run_calibration(&mut self.bus, &self.label, operator)
    }

    /// Write `calibration` to the motors, replacing the current one in full
    pub fn apply_calibration(&mut self, calibration: CalibrationMap) -> Result<()> {
        self.require(ArmState::Connected)?;
        self.bus.write_calibration(calibration)
    }

    /// Measure and apply a fresh calibration
    pub fn calibrate(&mut self, operator: &mut dyn Operator) -> Result<CalibrationMap> {
        let calibration = self.measure_calibration(operator)?;
        self.apply_calibration(calibration.clone())?;
        Ok(calibration)
    }

    /// Apply the runtime motor settings for this arm's role
    pub fn configure(&mut self) -> Result<()> {
        self.require(ArmState::Connected)?;
        match self.role {
            ArmRole::Follower => self.bus.with_torque_disabled(|bus| {
                bus.configure_motors()?;
                for joint in bus.motors().keys().copied().collect::<Vec<_>>() {
                    bus.write(Register::OperatingMode, joint, OperatingMode::Position as i32)?;
                    bus.write(Register::PCoefficient, joint, P_COEFFICIENT)?;
                    bus.write(Register::ICoefficient, joint, I_COEFFICIENT)?;
                    bus.write(Register::DCoefficient, joint, D_COEFFICIENT)?;
                }
                Ok(())
            })?,
            ArmRole::Leader => {
                self.bus.disable_torque()?;
                self.bus.configure_motors()?;
                self.bus.set_position_mode()?;
            }
        }
        self.state = ArmState::Configured;
        debug!("{} configured as {:?}", self.label, self.role);
        Ok(())
    }

    /// Present positions in calibrated units, one batched read
    pub fn read_positions(&mut self) -> Result<BTreeMap<Joint, f32>> {
        self.require(ArmState::Configured)?;
        let start = Instant::now();
        let raw = self.bus.sync_read(Register::PresentPosition)?;
        let mut positions = BTreeMap::new();
        for (joint, value) in raw {
            let (mode, cal) = self.unit_for(joint)?;
            positions.insert(joint, cal.normalize(mode, value));
        }
        debug!("{} read state: {:.1}ms", self.label, start.elapsed().as_secs_f64() * 1e3);
        Ok(positions)
    }

    /// Send goal positions in one batched write; empty targets touch nothing
    pub fn write_positions(&mut self, targets: &BTreeMap<Joint, f32>) -> Result<()> {
        self.require(ArmState::Configured)?;
        if targets.is_empty() {
            return Ok(());
        }
        let mut raw = RawValues::new();
        for (&joint, &value) in targets {
            let (mode, cal) = self.unit_for(joint)?;
            raw.insert(joint, cal.unnormalize(mode, value)?);
        }
        self.bus.sync_write(Register::GoalPosition, &raw)
    }

    fn unit_for(&self, joint: Joint) -> Result<(MotorNormMode, MotorCalibration)> {
        let motor = self.bus.motors().get(&joint).ok_or_else(|| {
            Error::InvalidConfiguration(format!("no motor {joint} on {}", self.label))
        })?;
        let cal = self.bus.calibration().get(&joint).ok_or_else(|| Error::CalibrationIncomplete {
            motor: format!("{} {}", self.label, joint),
            reason: "not calibrated".to_string(),
        })?;
        Ok((motor.norm_mode, *cal))
    }

    /// Release the bus, dropping torque first when configured to
    pub fn disconnect(&mut self) -> Result<()> {
        if !self.bus.is_connected() {
            return Err(Error::NotConnected(self.label.clone()));
        }
        // The bus closes its port even when the torque write fails
        self.state = ArmState::Unconnected;
        let result = self.bus.disconnect(self.disable_torque_on_disconnect);
        info!("{} disconnected", self.label);
        result
    }

    /// Interactively assign motor IDs, one motor plugged in at a time
    pub fn setup_motors(&mut self, operator: &mut dyn Operator) -> Result<()> {
        if self.bus.is_connected() {
            return Err(Error::AlreadyConnected(self.label.clone()));
        }
        let joints: Vec<Joint> = self.bus.motors().keys().rev().copied().collect();
        for joint in joints {
            operator.wait_for_confirm(&format!(
                "Connect the controller board to the {} '{}' motor only and confirm",
                self.label, joint
            ))?;
            self.bus.setup_motor(joint)?;
            let id = self.bus.motors().get(&joint).map_or(0, |m| m.id);
            info!("{} '{}' motor id set to {}", self.label, joint, id);
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::calibration::{NoOperator, ScriptedOperator};
    use crate::motor::mock::{BusOp, MockMotorBus, full_range_calibration};
    use crate::motor::so100_motors;

    fn calibrated_arm(role: ArmRole) -> ArmController<MockMotorBus> {
        let motors = so100_motors(1, false);
        let cal = full_range_calibration(&motors);
        let bus = MockMotorBus::new("/dev/left", motors).with_calibration(cal);
        ArmController::new(Some(Side::Left), role, bus)
    }

    #[test]
    fn test_read_requires_configured() {
        let mut arm = calibrated_arm(ArmRole::Follower);
        assert!(matches!(arm.read_positions(), Err(Error::NotConnected(_))));
        arm.connect_bus().unwrap();
        assert!(matches!(arm.read_positions(), Err(Error::NotConnected(_))));
        arm.configure().unwrap();
        assert_eq!(arm.read_positions().unwrap().len(), 6);
    }

    #[test]
    fn test_connect_twice_is_rejected() {
        let mut arm = calibrated_arm(ArmRole::Follower);
        assert_eq!(arm.connect(false, &mut NoOperator).unwrap(), ConnectOutcome::AlreadyCalibrated);
        let handle = arm.bus().handle();
        let before = handle.op_count();
        assert!(matches!(arm.connect(false, &mut NoOperator), Err(Error::AlreadyConnected(_))));
        assert_eq!(handle.op_count(), before);
    }

    #[test]
    fn test_follower_configure_writes_gains_with_torque_off() {
        let mut arm = calibrated_arm(ArmRole::Follower);
        arm.connect_bus().unwrap();
        let handle = arm.bus().handle();
        handle.clear_ops();
        arm.configure().unwrap();

        let ops = handle.ops();
        assert_eq!(ops.first(), Some(&BusOp::DisableTorque));
        assert_eq!(ops.last(), Some(&BusOp::EnableTorque));
        assert_eq!(handle.register(Joint::ElbowFlex, Register::PCoefficient), Some(16));
        assert_eq!(handle.register(Joint::ElbowFlex, Register::ICoefficient), Some(0));
        assert_eq!(handle.register(Joint::ElbowFlex, Register::DCoefficient), Some(32));
        assert_eq!(handle.register(Joint::Gripper, Register::ReturnDelayTime), Some(0));
        assert_eq!(handle.register(Joint::Gripper, Register::TorqueEnable), Some(1));
    }

    #[test]
    fn test_leader_configure_leaves_torque_off() {
        let mut arm = calibrated_arm(ArmRole::Leader);
        arm.connect_bus().unwrap();
        arm.configure().unwrap();
        let handle = arm.bus().handle();
        assert_eq!(handle.register(Joint::Gripper, Register::TorqueEnable), Some(0));
        assert!(!handle.ops().contains(&BusOp::EnableTorque));
    }

    #[test]
    fn test_write_positions_is_one_batched_write() {
        let mut arm = calibrated_arm(ArmRole::Follower);
        arm.connect(false, &mut NoOperator).unwrap();
        let handle = arm.bus().handle();
        handle.clear_ops();

        arm.write_positions(&BTreeMap::from([(Joint::Gripper, 50.0), (Joint::ElbowFlex, 0.0)]))
            .unwrap();
        let ops = handle.ops();
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            BusOp::SyncWrite { register, values } => {
                assert_eq!(*register, Register::GoalPosition);
                assert_eq!(values[&Joint::Gripper], 2048);
                assert_eq!(values[&Joint::ElbowFlex], 2048);
            }
            other => panic!("unexpected op {other:?}"),
        }

        handle.clear_ops();
        arm.write_positions(&BTreeMap::new()).unwrap();
        assert_eq!(handle.op_count(), 0);
    }

    #[test]
    fn test_calibrate_replaces_calibration_and_needs_reconfigure() {
        let motors = so100_motors(1, false);
        let mut arm = ArmController::new(Some(Side::Left), ArmRole::Follower, MockMotorBus::new("/dev/left", motors));
        assert!(!arm.is_calibrated());
        let handle = arm.bus().handle();
        // homing read, first sweep sample, then two sweep samples
        handle.queue_positions([
            Joint::ALL.iter().map(|&j| (j, 2047)).collect(),
            Joint::ALL.iter().map(|&j| (j, 2047)).collect(),
            Joint::ALL.iter().map(|&j| (j, 1000)).collect(),
            Joint::ALL.iter().map(|&j| (j, 3000)).collect(),
        ]);

        let outcome = arm.connect(true, &mut ScriptedOperator::new(2)).unwrap();
        let ConnectOutcome::Calibrated(cal) = outcome else {
            panic!("expected a fresh calibration, got {outcome:?}");
        };
        assert!(arm.is_calibrated());
        assert_eq!(arm.calibration(), &cal);
        assert_eq!(cal[&Joint::ShoulderLift].range_min, 1000);
        assert_eq!(cal[&Joint::ShoulderLift].range_max, 3000);
        assert_eq!(arm.state(), ArmState::Configured);

        arm.calibrate(&mut ScriptedOperator::new(0)).unwrap_err();
        assert_eq!(arm.state(), ArmState::Connected);
    }

    #[test]
    fn test_disconnect_requires_connection() {
        let mut arm = calibrated_arm(ArmRole::Follower);
        assert!(matches!(arm.disconnect(), Err(Error::NotConnected(_))));
        arm.connect(false, &mut NoOperator).unwrap();
        arm.disconnect().unwrap();
        assert_eq!(arm.state(), ArmState::Unconnected);
        assert!(
            arm.bus()
                .handle()
                .ops()
                .contains(&BusOp::Disconnect { disable_torque: true })
        );
    }

    #[test]
    fn test_setup_motors_walks_gripper_first() {
        let mut arm = calibrated_arm(ArmRole::Follower);
        let mut operator = ScriptedOperator::new(0);
        arm.setup_motors(&mut operator).unwrap();
        assert_eq!(operator.prompts.len(), 6);
        assert!(operator.prompts[0].contains("gripper"));
        let ops = arm.bus().handle().ops();
        assert_eq!(ops.first(), Some(&BusOp::SetupMotor { joint: Joint::Gripper }));
        assert_eq!(ops.last(), Some(&BusOp::SetupMotor { joint: Joint::ShoulderPan }));
    }
}
