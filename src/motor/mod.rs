// Motor bus module for SO-100 arms
//
// Provides:
// - Feetech STS3215 serial protocol implementation
// - The `MotorBus` capability and its Feetech-backed implementation
// - Motor identity, calibration records and position normalization

mod bus;
mod driver;
pub mod feetech;
#[cfg(feature = "mock")]
pub mod mock;
mod types;

pub use bus::{MotorBus, RangeRecorder, RawValues};
pub use driver::FeetechMotorsBus;
pub use feetech::{FeetechBus, FeetechError, OperatingMode, Register};
pub use types::{
    CalibrationMap, ENCODER_MAX, HALF_TURN, Motor, MotorCalibration, MotorMap, MotorNormMode,
    so100_motors,
};
