// Feetech motor bus for one SO-100 arm
//
// Binds a fixed motor map to a serial port and implements the `MotorBus`
// capability on top of the STS3215 packet protocol.

use tracing::{debug, info, warn};

use super::bus::{MotorBus, RawValues};
use super::feetech::{DEFAULT_BAUDRATE, FeetechBus, FeetechError, Register};
use super::types::{CalibrationMap, MotorMap};
use crate::error::{Error, Result};
use crate::messages::Joint;

pub struct FeetechMotorsBus {
    port: String,
    baudrate: u32,
    motors: MotorMap,
    calibration: CalibrationMap,
    bus: Option<FeetechBus>,
}

impl FeetechMotorsBus {
    pub fn new(port: impl Into<String>, motors: MotorMap, calibration: CalibrationMap) -> Self {
        Self {
            port: port.into(),
            baudrate: DEFAULT_BAUDRATE,
            motors,
            calibration,
            bus: None,
        }
    }

    fn open_bus(&mut self) -> Result<&mut FeetechBus> {
        self.bus
            .as_mut()
            .ok_or_else(|| Error::NotConnected(format!("bus {}", self.port)))
    }

    fn motor_id(&self, joint: Joint) -> Result<u8> {
        self.motors
            .get(&joint)
            .map(|m| m.id)
            .ok_or_else(|| Error::InvalidConfiguration(format!("no motor {joint} on {}", self.port)))
    }

    fn ids(&self) -> Vec<u8> {
        self.motors.values().map(|m| m.id).collect()
    }

    fn joint_for_id(&self, id: u8) -> Option<Joint> {
        self.motors
            .iter()
            .find(|(_, m)| m.id == id)
            .map(|(&joint, _)| joint)
    }

    /// Check that all motors are reachable
    fn handshake(&mut self) -> Result<()> {
        let ids = self.ids();
        let bus = self.open_bus()?;
        for id in ids {
            match bus.ping(id) {
                Ok(true) => debug!("Motor {} responding", id),
                Ok(false) => {
                    warn!("Motor {} not responding to ping", id);
                    return Err(FeetechError::Timeout { id }.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl MotorBus for FeetechMotorsBus {
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
        self.bus.is_some()
    }

    fn connect(&mut self) -> Result<()> {
        if self.bus.is_some() {
            return Err(Error::AlreadyConnected(format!("bus {}", self.port)));
        }
        info!("Opening motor bus on {}", self.port);
        self.bus = Some(FeetechBus::open_with_baudrate(&self.port, self.baudrate)?);
        if let Err(e) = self.handshake() {
            self.bus = None;
            return Err(e);
        }
        Ok(())
    }

    fn disconnect(&mut self, disable_torque: bool) -> Result<()> {
        if self.bus.is_none() {
            return Err(Error::NotConnected(format!("bus {}", self.port)));
        }
        let result = if disable_torque {
            self.disable_torque()
        } else {
            Ok(())
        };
        // The port is released even if the torque write failed
        self.bus = None;
        info!("Closed motor bus on {}", self.port);
        result
    }

    fn read(&mut self, register: Register, joint: Joint) -> Result<i32> {
        let id = self.motor_id(joint)?;
        let raw = self.open_bus()?.read_register(id, register)?;
        Ok(register.decode(raw))
    }

    fn write(&mut self, register: Register, joint: Joint, value: i32) -> Result<()> {
        let id = self.motor_id(joint)?;
        let raw = register.encode(value)?;
        self.open_bus()?.write_register(id, register, raw)?;
        Ok(())
    }

    fn sync_read(&mut self, register: Register) -> Result<RawValues> {
        let ids = self.ids();
        let values = self.open_bus()?.sync_read(register, &ids)?;
        let mut out = RawValues::new();
        for (id, raw) in values {
            let joint = self.joint_for_id(id).ok_or_else(|| FeetechError::InvalidResponse {
                id,
                reason: "ID not on this bus".to_string(),
            })?;
            out.insert(joint, register.decode(raw));
        }
        Ok(out)
    }

    fn sync_write(&mut self, register: Register, values: &RawValues) -> Result<()> {
        let mut data = Vec::with_capacity(values.len());
        for (&joint, &value) in values {
            data.push((self.motor_id(joint)?, register.encode(value)?));
        }
        self.open_bus()?.sync_write(register, &data)?;
        Ok(())
    }

    /// Disable torque on all motors (allows free movement)
    fn disable_torque(&mut self) -> Result<()> {
        debug!("Disabling torque on {}", self.port);
        let ids = self.ids();
        let bus = self.open_bus()?;
        for id in ids {
            bus.disable_torque(id)?;
        }
        Ok(())
    }

    fn enable_torque(&mut self) -> Result<()> {
        debug!("Enabling torque on {}", self.port);
        let ids = self.ids();
        let bus = self.open_bus()?;
        for id in ids {
            bus.enable_torque(id)?;
        }
        Ok(())
    }

    fn setup_motor(&mut self, joint: Joint) -> Result<()> {
        if self.bus.is_some() {
            return Err(Error::AlreadyConnected(format!(
                "bus {} (motor setup opens the port itself)",
                self.port
            )));
        }
        let target = self.motor_id(joint)?;
        // Only one motor is attached, so the handshake in `connect` would fail
        let mut bus = FeetechBus::open_with_baudrate(&self.port, self.baudrate)?;

        let found = bus.scan()?;
        let current = match found.as_slice() {
            [id] => *id,
            [] => {
                return Err(Error::InvalidConfiguration(format!(
                    "no motor answered on {} while setting up {joint}",
                    self.port
                )));
            }
            many => {
                return Err(Error::InvalidConfiguration(format!(
                    "expected exactly one motor on {} while setting up {joint}, found IDs {many:?}",
                    self.port
                )));
            }
        };

        if current == target {
            info!("'{}' motor already has ID {}", joint, target);
            return Ok(());
        }

        // EEPROM writes need torque off and the lock released
        bus.disable_torque(current)?;
        bus.write_register(current, Register::Id, target as u16)?;
        info!("'{}' motor ID changed {} -> {}", joint, current, target);
        Ok(())
    }
}

impl Drop for FeetechMotorsBus {
    fn drop(&mut self) {
        if self.bus.is_some() {
            warn!("Motor bus on {} dropped while connected", self.port);
        }
    }
}
