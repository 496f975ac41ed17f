// Control layer for a bimanual SO-100 manipulator
//
// Two 6-DOF Feetech STS3215 arms, each on its own serial bus, exposed as one
// device with a prefixed observation/action interface.

pub mod calibration;
pub mod camera;
pub mod config;
pub mod error;
pub mod factory;
pub mod messages;
pub mod motor;
pub mod robot;
pub mod runtime;
pub mod teleop;

pub use error::{Error, Result};
pub use messages::{Joint, JointKey, Side};
