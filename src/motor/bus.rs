// Motor bus capability
//
// One bus per serial port. Implementations provide raw register I/O; homing,
// range recording, calibration writes and motor configuration are built on
// top of that I/O here so every backend behaves the same.

use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::feetech::{OperatingMode, Register};
use super::types::{CalibrationMap, HALF_TURN, MotorMap};
use crate::error::{Error, Result};
use crate::messages::Joint;

/// Raw register values keyed by joint
pub type RawValues = BTreeMap<Joint, i32>;

pub trait MotorBus: Send {
    /// Serial port identifier this bus owns
    fn port(&self) -> &str;

    fn motors(&self) -> &MotorMap;

    /// Calibration currently loaded into this bus
    fn calibration(&self) -> &CalibrationMap;

    /// Replace the in-memory calibration without touching registers
    fn set_calibration(&mut self, calibration: CalibrationMap);

    fn is_connected(&self) -> bool;

    fn connect(&mut self) -> Result<()>;

    fn disconnect(&mut self, disable_torque: bool) -> Result<()>;

    fn read(&mut self, register: Register, joint: Joint) -> Result<i32>;

    fn write(&mut self, register: Register, joint: Joint, value: i32) -> Result<()>;

    /// One batched read of `register` across every motor on the bus
    fn sync_read(&mut self, register: Register) -> Result<RawValues>;

    /// One batched write of `register` to the given motors
    fn sync_write(&mut self, register: Register, values: &RawValues) -> Result<()>;

    fn disable_torque(&mut self) -> Result<()>;

    fn enable_torque(&mut self) -> Result<()>;

    /// Assign the configured ID of `joint` to the only motor on the port
    ///
    /// Runs on a disconnected bus: the rest of the arm is unplugged, so the
    /// port is opened for the duration of the call only.
    fn setup_motor(&mut self, joint: Joint) -> Result<()>;

    /// True when every motor has a usable calibration entry
    fn is_calibrated(&self) -> bool {
        let calibration = self.calibration();
        self.motors().iter().all(|(joint, motor)| {
            calibration
                .get(joint)
                .is_some_and(|c| c.id == motor.id && c.validate(joint.name()).is_ok())
        })
    }

    /// Write homing offsets and position limits, then adopt `calibration`
    fn write_calibration(&mut self, calibration: CalibrationMap) -> Result<()> {
        for joint in self.motors().keys().copied().collect::<Vec<_>>() {
            let cal = calibration
                .get(&joint)
                .ok_or_else(|| Error::CalibrationIncomplete {
                    motor: joint.name().to_string(),
                    reason: "no calibration entry".to_string(),
                })?;
            cal.validate(joint.name())?;
        }

        for (&joint, cal) in &calibration {
            if !self.motors().contains_key(&joint) {
                continue;
            }
            self.write(Register::HomingOffset, joint, cal.homing_offset)?;
            self.write(Register::MinPositionLimit, joint, cal.range_min)?;
            self.write(Register::MaxPositionLimit, joint, cal.range_max)?;
        }
        debug!("Wrote calibration for {} motors on {}", calibration.len(), self.port());
        self.set_calibration(calibration);
        Ok(())
    }

    /// Put every motor in position mode (torque must already be off)
    fn set_position_mode(&mut self) -> Result<()> {
        for joint in self.motors().keys().copied().collect::<Vec<_>>() {
            self.write(Register::OperatingMode, joint, OperatingMode::Position as i32)?;
        }
        Ok(())
    }

    /// Compute and write homing offsets so the current pose reads as mid-range
    fn set_half_turn_homings(&mut self) -> Result<RawValues> {
        let joints: Vec<Joint> = self.motors().keys().copied().collect();
        for &joint in &joints {
            self.write(Register::HomingOffset, joint, 0)?;
        }

        let positions = self.sync_read(Register::PresentPosition)?;
        let mut offsets = RawValues::new();
        for joint in joints {
            let raw = *positions.get(&joint).ok_or_else(|| Error::CalibrationIncomplete {
                motor: joint.name().to_string(),
                reason: "no present position while homing".to_string(),
            })?;
            let offset = raw - HALF_TURN;
            self.write(Register::HomingOffset, joint, offset)?;
            offsets.insert(joint, offset);
        }
        info!("Homing offsets set on {}: {:?}", self.port(), offsets);
        Ok(offsets)
    }

    /// Sample present positions until `stop` returns true, tracking min/max
    fn record_ranges_of_motion(
        &mut self,
        joints: &[Joint],
        stop: &mut dyn FnMut() -> bool,
    ) -> Result<(RawValues, RawValues)> {
        let mut recorder = RangeRecorder::new(joints);
        loop {
            recorder.sample(self)?;
            if stop() {
                break;
            }
        }
        Ok(recorder.into_ranges())
    }

    /// Bus-level tuning applied before PID configuration
    fn configure_motors(&mut self) -> Result<()> {
        for joint in self.motors().keys().copied().collect::<Vec<_>>() {
            self.write(Register::ReturnDelayTime, joint, 0)?;
            self.write(Register::MaximumAcceleration, joint, 254)?;
            self.write(Register::Acceleration, joint, 254)?;
        }
        Ok(())
    }

    /// Run `f` with torque off, re-enabling torque on every exit path
    fn with_torque_disabled<T, F>(&mut self, f: F) -> Result<T>
    where
        Self: Sized,
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.disable_torque()?;
        let result = f(self);
        let enabled = self.enable_torque();
        match (result, enabled) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(enable_err)) => {
                warn!("Failed to re-enable torque on {}: {}", self.port(), enable_err);
                Err(e)
            }
        }
    }
}

/// Running min/max of raw positions during a range-of-motion sweep
#[derive(Debug, Clone)]
pub struct RangeRecorder {
    mins: RawValues,
    maxes: RawValues,
    samples: u64,
}

impl RangeRecorder {
    pub fn new(joints: &[Joint]) -> Self {
        Self {
            mins: joints.iter().map(|&j| (j, i32::MAX)).collect(),
            maxes: joints.iter().map(|&j| (j, i32::MIN)).collect(),
            samples: 0,
        }
    }

    /// Fold one set of readings into the running extremes
    pub fn update(&mut self, positions: &RawValues) {
        for (joint, min) in self.mins.iter_mut() {
            if let Some(&pos) = positions.get(joint) {
                *min = (*min).min(pos);
            }
        }
        for (joint, max) in self.maxes.iter_mut() {
            if let Some(&pos) = positions.get(joint) {
                *max = (*max).max(pos);
            }
        }
        self.samples += 1;
    }

    /// One batched read from `bus`, folded in
    pub fn sample<B: MotorBus + ?Sized>(&mut self, bus: &mut B) -> Result<()> {
        let positions = bus.sync_read(Register::PresentPosition)?;
        self.update(&positions);
        if self.samples % 30 == 0 {
            debug!("Range sample {} on {}: mins={:?} maxes={:?}", self.samples, bus.port(), self.mins, self.maxes);
        }
        Ok(())
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Final (mins, maxes); joints never observed are left out
    pub fn into_ranges(self) -> (RawValues, RawValues) {
        let mins = self.mins.into_iter().filter(|&(_, v)| v != i32::MAX).collect();
        let maxes = self.maxes.into_iter().filter(|&(_, v)| v != i32::MIN).collect();
        (mins, maxes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_recorder_tracks_extremes() {
        let mut rec = RangeRecorder::new(&[Joint::ShoulderPan, Joint::Gripper]);
        rec.update(&BTreeMap::from([(Joint::ShoulderPan, 2000), (Joint::Gripper, 1500)]));
        rec.update(&BTreeMap::from([(Joint::ShoulderPan, 1200), (Joint::Gripper, 2900)]));
        rec.update(&BTreeMap::from([(Joint::ShoulderPan, 3100), (Joint::WristRoll, 10)]));
        assert_eq!(rec.samples(), 3);

        let (mins, maxes) = rec.into_ranges();
        assert_eq!(mins[&Joint::ShoulderPan], 1200);
        assert_eq!(maxes[&Joint::ShoulderPan], 3100);
        assert_eq!(mins[&Joint::Gripper], 1500);
        assert_eq!(maxes[&Joint::Gripper], 2900);
        // Not part of the sweep
        assert!(!mins.contains_key(&Joint::WristRoll));
    }

    #[test]
    fn test_range_recorder_without_samples_is_empty() {
        let rec = RangeRecorder::new(&[Joint::ElbowFlex]);
        let (mins, maxes) = rec.into_ranges();
        assert!(mins.is_empty() && maxes.is_empty());
    }

    #[cfg(feature = "mock")]
    #[test]
    fn test_record_ranges_until_stopped() {
        use crate::motor::mock::MockMotorBus;
        use crate::motor::so100_motors;

        let mut bus = MockMotorBus::new("/dev/left", so100_motors(1, false));
        bus.connect().unwrap();
        bus.handle().queue_positions([
            BTreeMap::from([(Joint::ElbowFlex, 1800)]),
            BTreeMap::from([(Joint::ElbowFlex, 2600)]),
            BTreeMap::from([(Joint::ElbowFlex, 900)]),
        ]);
        let mut polls = 0;
        let (mins, maxes) = bus
            .record_ranges_of_motion(&[Joint::ElbowFlex], &mut || {
                polls += 1;
                polls == 3
            })
            .unwrap();
        assert_eq!(mins[&Joint::ElbowFlex], 900);
        assert_eq!(maxes[&Joint::ElbowFlex], 2600);
    }

    #[cfg(feature = "mock")]
    #[test]
    fn test_torque_comes_back_after_failed_body() {
        use crate::motor::mock::{BusOp, MockMotorBus};
        use crate::motor::so100_motors;

        let mut bus = MockMotorBus::new("/dev/left", so100_motors(1, false));
        bus.connect().unwrap();
        let handle = bus.handle();
        let result: Result<()> = bus.with_torque_disabled(|bus| {
            bus.write(Register::PCoefficient, Joint::Gripper, 16)?;
            Err(Error::Unsupported("test"))
        });
        assert!(matches!(result, Err(Error::Unsupported(_))));
        assert_eq!(handle.ops().last(), Some(&BusOp::EnableTorque));
        assert_eq!(handle.register(Joint::Gripper, Register::TorqueEnable), Some(1));
    }
}
