// In-memory motor bus
//
// Keeps a register file per motor and records every transaction so callers
// can assert on bus traffic. A cloned `MockHandle` stays usable after the bus
// has been moved into a controller.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::bus::{MotorBus, RawValues};
use super::feetech::Register;
use super::types::{CalibrationMap, ENCODER_MAX, HALF_TURN, MotorCalibration, MotorMap};
use crate::error::{Error, Result};
use crate::messages::Joint;
use crate::motor::FeetechError;

/// One recorded bus transaction
#[derive(Debug, Clone, PartialEq)]
pub enum BusOp {
    Connect,
    Disconnect { disable_torque: bool },
    Read { register: Register, joint: Joint },
    Write { register: Register, joint: Joint, value: i32 },
    SyncRead { register: Register },
    SyncWrite { register: Register, values: RawValues },
    DisableTorque,
    EnableTorque,
    SetupMotor { joint: Joint },
}

#[derive(Debug, Default)]
struct MockState {
    registers: HashMap<(Joint, Register), i32>,
    log: Vec<BusOp>,
    position_frames: VecDeque<RawValues>,
    fail_on: Option<Register>,
    fail_connect: bool,
    fail_disconnect: bool,
    goal_tracking: bool,
}

/// Shared view into a `MockMotorBus`
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every transaction issued so far
    pub fn ops(&self) -> Vec<BusOp> {
        self.lock().log.clone()
    }

    pub fn clear_ops(&self) {
        self.lock().log.clear();
    }

    /// Number of transactions issued so far
    pub fn op_count(&self) -> usize {
        self.lock().log.len()
    }

    pub fn register(&self, joint: Joint, register: Register) -> Option<i32> {
        self.lock().registers.get(&(joint, register)).copied()
    }

    pub fn set_register(&self, joint: Joint, register: Register, value: i32) {
        self.lock().registers.insert((joint, register), value);
    }

    /// Set the raw present position of every listed joint
    pub fn set_positions(&self, positions: &RawValues) {
        let mut state = self.lock();
        for (&joint, &pos) in positions {
            state.registers.insert((joint, Register::PresentPosition), pos);
        }
    }

    /// Queue position frames; each present-position sync read consumes one
    pub fn queue_positions(&self, frames: impl IntoIterator<Item = RawValues>) {
        self.lock().position_frames.extend(frames);
    }

    pub fn queued_frames(&self) -> usize {
        self.lock().position_frames.len()
    }

    /// Make every transaction on `register` fail with a timeout
    pub fn fail_on(&self, register: Option<Register>) {
        self.lock().fail_on = register;
    }

    pub fn fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    pub fn fail_disconnect(&self, fail: bool) {
        self.lock().fail_disconnect = fail;
    }

    /// When on, goal position writes move the present position immediately
    pub fn set_goal_tracking(&self, on: bool) {
        self.lock().goal_tracking = on;
    }
}

/// Motor bus backed by memory instead of a serial port
pub struct MockMotorBus {
    port: String,
    motors: MotorMap,
    calibration: CalibrationMap,
    connected: bool,
    handle: MockHandle,
}

impl MockMotorBus {
    /// Every motor starts at mid-range, torque off, goal tracking on
    pub fn new(port: impl Into<String>, motors: MotorMap) -> Self {
        let mut state = MockState {
            goal_tracking: true,
            ..Default::default()
        };
        for (&joint, motor) in &motors {
            state.registers.insert((joint, Register::Id), motor.id as i32);
            state.registers.insert((joint, Register::PresentPosition), HALF_TURN);
            state.registers.insert((joint, Register::TorqueEnable), 0);
        }
        Self {
            port: port.into(),
            motors,
            calibration: CalibrationMap::new(),
            connected: false,
            handle: MockHandle {
                state: Arc::new(Mutex::new(state)),
            },
        }
    }

    pub fn with_calibration(mut self, calibration: CalibrationMap) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }

    fn guard(&self, register: Option<Register>, joint: Option<Joint>) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected(format!("bus {}", self.port)));
        }
        let state = self.handle.lock();
        if register.is_some() && state.fail_on == register {
            let id = joint.and_then(|j| self.motors.get(&j)).map_or(0, |m| m.id);
            return Err(FeetechError::Timeout { id }.into());
        }
        Ok(())
    }

    fn record(&self, op: BusOp) {
        self.handle.lock().log.push(op);
    }

    fn all_torque(&mut self, value: i32) -> Result<()> {
        self.guard(Some(Register::TorqueEnable), None)?;
        let mut state = self.handle.lock();
        for &joint in self.motors.keys() {
            state.registers.insert((joint, Register::TorqueEnable), value);
            state.registers.insert((joint, Register::Lock), value);
        }
        Ok(())
    }
}

impl MotorBus for MockMotorBus {
    fn port(&self) -> &str {
        &self.port
    }

    fn motors(&self) -> &MotorMap {
        &self.motors
    }

    fn calibration(&self) -> &CalibrationMap {
        &self.calibration
    }

    fn set_calibration(&mut self, calibration: CalibrationMap) {
        self.calibration = calibration;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Err(Error::AlreadyConnected(format!("bus {}", self.port)));
        }
        self.record(BusOp::Connect);
        if self.handle.lock().fail_connect {
            return Err(FeetechError::PortClosed(self.port.clone()).into());
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self, disable_torque: bool) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected(format!("bus {}", self.port)));
        }
        self.record(BusOp::Disconnect { disable_torque });
        if disable_torque {
            self.all_torque(0)?;
        }
        self.connected = false;
        if self.handle.lock().fail_disconnect {
            return Err(FeetechError::PortClosed(self.port.clone()).into());
        }
        Ok(())
    }

    fn read(&mut self, register: Register, joint: Joint) -> Result<i32> {
        self.guard(Some(register), Some(joint))?;
        self.record(BusOp::Read { register, joint });
        Ok(self.handle.register(joint, register).unwrap_or(0))
    }

    fn write(&mut self, register: Register, joint: Joint, value: i32) -> Result<()> {
        self.guard(Some(register), Some(joint))?;
        register.encode(value)?;
        self.record(BusOp::Write {
            register,
            joint,
            value,
        });
        self.handle.set_register(joint, register, value);
        Ok(())
    }

    fn sync_read(&mut self, register: Register) -> Result<RawValues> {
        self.guard(Some(register), None)?;
        self.record(BusOp::SyncRead { register });
        let mut state = self.handle.lock();
        if register == Register::PresentPosition {
            if let Some(frame) = state.position_frames.pop_front() {
                for (joint, pos) in frame {
                    state.registers.insert((joint, Register::PresentPosition), pos);
                }
            }
        }
        Ok(self
            .motors
            .keys()
            .map(|&joint| {
                let value = state.registers.get(&(joint, register)).copied().unwrap_or(0);
                (joint, value)
            })
            .collect())
    }

    fn sync_write(&mut self, register: Register, values: &RawValues) -> Result<()> {
        self.guard(Some(register), None)?;
        for &value in values.values() {
            register.encode(value)?;
        }
        self.record(BusOp::SyncWrite {
            register,
            values: values.clone(),
        });
        let mut state = self.handle.lock();
        let tracking = state.goal_tracking && register == Register::GoalPosition;
        for (&joint, &value) in values {
            state.registers.insert((joint, register), value);
            if tracking {
                state.registers.insert((joint, Register::PresentPosition), value);
            }
        }
        Ok(())
    }

    fn disable_torque(&mut self) -> Result<()> {
        self.guard(None, None)?;
        self.record(BusOp::DisableTorque);
        self.all_torque(0)
    }

    fn enable_torque(&mut self) -> Result<()> {
        self.guard(None, None)?;
        self.record(BusOp::EnableTorque);
        self.all_torque(1)
    }

    fn setup_motor(&mut self, joint: Joint) -> Result<()> {
        if self.connected {
            return Err(Error::AlreadyConnected(format!("bus {}", self.port)));
        }
        self.record(BusOp::SetupMotor { joint });
        let id = self
            .motors
            .get(&joint)
            .map(|m| m.id as i32)
            .ok_or_else(|| Error::InvalidConfiguration(format!("no motor {joint} on {}", self.port)))?;
        self.handle.set_register(joint, Register::Id, id);
        Ok(())
    }
}

/// Calibration that spans the whole encoder for every motor in `motors`
pub fn full_range_calibration(motors: &MotorMap) -> CalibrationMap {
    motors
        .iter()
        .map(|(&joint, motor)| {
            (
                joint,
                MotorCalibration {
                    id: motor.id,
                    drive_mode: 0,
                    homing_offset: 0,
                    range_min: 0,
                    range_max: ENCODER_MAX,
                },
            )
        })
        .collect()
}
