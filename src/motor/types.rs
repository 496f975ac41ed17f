// Motor identity, calibration records and position normalization

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::messages::Joint;

/// Highest raw encoder value of an STS3215 (12-bit)
pub const ENCODER_MAX: i32 = 4095;

/// Raw reading that corresponds to the middle of a turn
pub const HALF_TURN: i32 = ENCODER_MAX / 2;

/// How raw positions are presented to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MotorNormMode {
    /// Degrees relative to the middle of the calibrated range
    Degrees,
    /// [-100, 100] across the calibrated range
    #[serde(rename = "RANGE_M100_100")]
    RangeM100To100,
    /// [0, 100] across the calibrated range
    #[serde(rename = "RANGE_0_100")]
    Range0To100,
}

/// A motor bound to a bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Motor {
    pub id: u8,
    pub model: &'static str,
    pub norm_mode: MotorNormMode,
}

impl Motor {
    pub fn sts3215(id: u8, norm_mode: MotorNormMode) -> Self {
        Self {
            id,
            model: "sts3215",
            norm_mode,
        }
    }
}

/// Motor map of one arm, in joint order
pub type MotorMap = BTreeMap<Joint, Motor>;

/// Standard SO-100 motor map for one arm
///
/// IDs are consecutive from `id_base`. Body joints use degrees or [-100, 100]
/// depending on `use_degrees`; the gripper always uses [0, 100].
pub fn so100_motors(id_base: u8, use_degrees: bool) -> MotorMap {
    let body = if use_degrees {
        MotorNormMode::Degrees
    } else {
        MotorNormMode::RangeM100To100
    };
    Joint::ALL
        .into_iter()
        .map(|joint| {
            let mode = if joint == Joint::Gripper {
                MotorNormMode::Range0To100
            } else {
                body
            };
            (joint, Motor::sts3215(id_base + joint.index() as u8, mode))
        })
        .collect()
}

/// Calibration record for one motor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorCalibration {
    pub id: u8,
    pub drive_mode: u8,
    pub homing_offset: i32,
    pub range_min: i32,
    pub range_max: i32,
}

impl MotorCalibration {
    /// Reject ranges that cannot be normalized
    pub fn validate(&self, motor: &str) -> Result<()> {
        if self.range_min > self.range_max {
            return Err(Error::CalibrationIncomplete {
                motor: motor.to_string(),
                reason: format!("range_min {} > range_max {}", self.range_min, self.range_max),
            });
        }
        if self.range_min == self.range_max {
            return Err(Error::CalibrationIncomplete {
                motor: motor.to_string(),
                reason: format!("zero-width range at {}", self.range_min),
            });
        }
        if self.drive_mode > 1 {
            return Err(Error::CalibrationIncomplete {
                motor: motor.to_string(),
                reason: format!("drive_mode {} is not 0 or 1", self.drive_mode),
            });
        }
        Ok(())
    }

    fn mid(&self) -> f32 {
        (self.range_min + self.range_max) as f32 / 2.0
    }

    /// Convert a raw register reading to the caller-facing unit
    pub fn normalize(&self, mode: MotorNormMode, raw: i32) -> f32 {
        let min = self.range_min as f32;
        let max = self.range_max as f32;
        let bounded = (raw as f32).clamp(min, max);
        let inverted = self.drive_mode == 1;
        match mode {
            MotorNormMode::RangeM100To100 => {
                let norm = (bounded - min) / (max - min) * 200.0 - 100.0;
                if inverted { -norm } else { norm }
            }
            MotorNormMode::Range0To100 => {
                let norm = (bounded - min) / (max - min) * 100.0;
                if inverted { 100.0 - norm } else { norm }
            }
            MotorNormMode::Degrees => (raw as f32 - self.mid()) * 360.0 / ENCODER_MAX as f32,
        }
    }

    /// Convert a caller-facing value back to a raw register value
    pub fn unnormalize(&self, mode: MotorNormMode, value: f32) -> Result<i32> {
        if !value.is_finite() {
            return Err(Error::InvalidConfiguration(format!(
                "cannot convert non-finite position {value} for motor {}",
                self.id
            )));
        }
        let min = self.range_min as f32;
        let max = self.range_max as f32;
        let inverted = self.drive_mode == 1;
        let raw = match mode {
            MotorNormMode::RangeM100To100 => {
                let v = if inverted { -value } else { value };
                let bounded = v.clamp(-100.0, 100.0);
                (bounded + 100.0) / 200.0 * (max - min) + min
            }
            MotorNormMode::Range0To100 => {
                let v = if inverted { 100.0 - value } else { value };
                let bounded = v.clamp(0.0, 100.0);
                bounded / 100.0 * (max - min) + min
            }
            MotorNormMode::Degrees => value * ENCODER_MAX as f32 / 360.0 + self.mid(),
        };
        Ok((raw.round() as i32).clamp(0, ENCODER_MAX))
    }
}

/// Calibration of one arm, keyed by joint
pub type CalibrationMap = BTreeMap<Joint, MotorCalibration>;

#[cfg(test)]
mod tests {
    use super::*;

    fn cal(min: i32, max: i32, drive_mode: u8) -> MotorCalibration {
        MotorCalibration {
            id: 1,
            drive_mode,
            homing_offset: 0,
            range_min: min,
            range_max: max,
        }
    }

    #[test]
    fn test_so100_motor_ids_and_modes() {
        let left = so100_motors(1, false);
        let right = so100_motors(7, true);
        assert_eq!(left[&Joint::ShoulderPan].id, 1);
        assert_eq!(left[&Joint::Gripper].id, 6);
        assert_eq!(right[&Joint::ShoulderPan].id, 7);
        assert_eq!(right[&Joint::Gripper].id, 12);
        assert_eq!(left[&Joint::ElbowFlex].norm_mode, MotorNormMode::RangeM100To100);
        assert_eq!(right[&Joint::ElbowFlex].norm_mode, MotorNormMode::Degrees);
        assert_eq!(right[&Joint::Gripper].norm_mode, MotorNormMode::Range0To100);
    }

    #[test]
    fn test_range_m100_100_endpoints() {
        let c = cal(1000, 3000, 0);
        assert_eq!(c.normalize(MotorNormMode::RangeM100To100, 1000), -100.0);
        assert_eq!(c.normalize(MotorNormMode::RangeM100To100, 2000), 0.0);
        assert_eq!(c.normalize(MotorNormMode::RangeM100To100, 3000), 100.0);
        // Out-of-range raw values saturate
        assert_eq!(c.normalize(MotorNormMode::RangeM100To100, 3500), 100.0);
        assert_eq!(c.unnormalize(MotorNormMode::RangeM100To100, 0.0).unwrap(), 2000);
        assert_eq!(c.unnormalize(MotorNormMode::RangeM100To100, 250.0).unwrap(), 3000);
    }

    #[test]
    fn test_drive_mode_inverts() {
        let c = cal(1000, 3000, 1);
        assert_eq!(c.normalize(MotorNormMode::RangeM100To100, 1000), 100.0);
        assert_eq!(c.normalize(MotorNormMode::Range0To100, 1000), 100.0);
        assert_eq!(c.unnormalize(MotorNormMode::Range0To100, 100.0).unwrap(), 1000);
    }

    #[test]
    fn test_gripper_range_0_100() {
        let c = cal(2000, 3000, 0);
        assert_eq!(c.normalize(MotorNormMode::Range0To100, 2500), 50.0);
        assert_eq!(c.unnormalize(MotorNormMode::Range0To100, 50.0).unwrap(), 2500);
    }

    #[test]
    fn test_degrees_centered_on_mid_range() {
        let c = cal(0, 4095, 0);
        let deg = c.normalize(MotorNormMode::Degrees, 2047);
        assert!(deg.abs() < 0.1, "mid-range should be ~0 deg, got {deg}");
        let quarter = c.unnormalize(MotorNormMode::Degrees, 90.0).unwrap();
        assert!((quarter - 3071).abs() <= 1, "got {quarter}");
    }

    #[test]
    fn test_unnormalize_refuses_non_finite() {
        let c = cal(1000, 3000, 0);
        for value in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            for mode in [MotorNormMode::RangeM100To100, MotorNormMode::Range0To100, MotorNormMode::Degrees] {
                assert!(matches!(c.unnormalize(mode, value), Err(Error::InvalidConfiguration(_))));
            }
        }
    }

    #[test]
    fn test_validate_rejects_zero_width() {
        assert!(cal(2047, 2047, 0).validate("left_elbow_flex").is_err());
        assert!(cal(3000, 1000, 0).validate("left_elbow_flex").is_err());
        assert!(cal(1000, 3000, 2).validate("left_elbow_flex").is_err());
        assert!(cal(1000, 3000, 0).validate("left_elbow_flex").is_ok());
    }
}
