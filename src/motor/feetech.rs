// Feetech STS3215 serial protocol implementation
//
// Protocol is similar to Dynamixel Protocol 1.0:
// Packet format: [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

/// Default serial configuration for Feetech motors
pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Packet header bytes
const HEADER: [u8; 2] = [0xFF, 0xFF];

/// Broadcast ID used by sync instructions
pub const BROADCAST_ID: u8 = 0xFE;

/// Highest ID a motor can be assigned
pub const MAX_MOTOR_ID: u8 = 252;

/// Sign bit of the homing offset register (sign-magnitude, 11-bit magnitude)
const HOMING_OFFSET_SIGN_BIT: u32 = 11;

/// Instruction set
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    SyncRead = 0x82,
    SyncWrite = 0x83,
}

/// Register addresses for STS3215
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Register {
    // EEPROM area (persists across power cycles)
    ModelNumber = 3,      // 2 bytes, read-only
    Id = 5,               // 1 byte
    BaudRate = 6,         // 1 byte
    ReturnDelayTime = 7,  // 1 byte
    MinPositionLimit = 9, // 2 bytes
    MaxPositionLimit = 11, // 2 bytes
    PCoefficient = 21,    // 1 byte
    DCoefficient = 22,    // 1 byte
    ICoefficient = 23,    // 1 byte
    HomingOffset = 31,    // 2 bytes, sign-magnitude (bit 11)

    // RAM area (volatile)
    OperatingMode = 33,       // 1 byte: 0=position, 1=velocity, 2=PWM, 3=step
    TorqueEnable = 40,        // 1 byte: 0=off, 1=on
    Acceleration = 41,        // 1 byte
    GoalPosition = 42,        // 2 bytes
    Lock = 55,                // 1 byte: 0=unlocked, 1=locked
    PresentPosition = 56,     // 2 bytes, read-only
    MaximumAcceleration = 85, // 1 byte
}

impl Register {
    /// Width of the register in bytes
    pub fn size(self) -> u8 {
        match self {
            Register::ModelNumber
            | Register::MinPositionLimit
            | Register::MaxPositionLimit
            | Register::HomingOffset
            | Register::GoalPosition
            | Register::PresentPosition => 2,
            _ => 1,
        }
    }

    /// Encode a signed register value into its on-wire representation
    pub fn encode(self, value: i32) -> Result<u16> {
        let max = if self.size() == 1 { 0xFF } else { 0xFFFF };
        match self {
            Register::HomingOffset => {
                let limit = (1 << HOMING_OFFSET_SIGN_BIT) - 1;
                if value.abs() > limit {
                    return Err(FeetechError::InvalidValue {
                        register: self,
                        value,
                    });
                }
                Ok(encode_sign_magnitude(value, HOMING_OFFSET_SIGN_BIT))
            }
            _ if (0..=max).contains(&value) => Ok(value as u16),
            _ => Err(FeetechError::InvalidValue {
                register: self,
                value,
            }),
        }
    }

    /// Decode an on-wire register value
    pub fn decode(self, raw: u16) -> i32 {
        match self {
            Register::HomingOffset => decode_sign_magnitude(raw, HOMING_OFFSET_SIGN_BIT),
            _ => raw as i32,
        }
    }
}

/// Operating modes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatingMode {
    Position = 0,
    Velocity = 1,
    Pwm = 2,
    Step = 3,
}

/// Error types for Feetech communication
#[derive(Debug, thiserror::Error)]
pub enum FeetechError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from motor {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("Checksum mismatch for motor {id}")]
    ChecksumMismatch { id: u8 },

    #[error("Motor {id} returned error status: 0x{status:02X}")]
    MotorError { id: u8, status: u8 },

    #[error("Timeout waiting for response from motor {id}")]
    Timeout { id: u8 },

    #[error("Value {value} out of range for register {register:?}")]
    InvalidValue { register: Register, value: i32 },

    #[error("Port {0} is not open")]
    PortClosed(String),
}

pub type Result<T> = std::result::Result<T, FeetechError>;

/// Feetech motor bus - handles serial communication with motors
pub struct FeetechBus {
    port: Box<dyn SerialPort>,
}

impl FeetechBus {
    /// Open a new connection to the motor bus
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    /// Open with custom baudrate
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self { port })
    }

    /// Calculate checksum for a packet (excluding header)
    fn checksum(data: &[u8]) -> u8 {
        let sum: u16 = data.iter().map(|&b| b as u16).sum();
        (!sum & 0xFF) as u8
    }

    /// Build a packet with header and checksum
    fn build_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
        let length = (params.len() + 2) as u8; // params + instruction + checksum
        let mut packet = Vec::with_capacity(6 + params.len());

        packet.extend_from_slice(&HEADER);
        packet.push(id);
        packet.push(length);
        packet.push(instruction as u8);
        packet.extend_from_slice(params);

        // Checksum over id, length, instruction, params
        let checksum_data = &packet[2..]; // skip header
        packet.push(Self::checksum(checksum_data));

        packet
    }

    /// Build the params of a sync write: [addr, len, id1, data1..., id2, data2...]
    fn sync_write_params(register: Register, data: &[(u8, u16)]) -> Vec<u8> {
        let size = register.size();
        let mut params = Vec::with_capacity(2 + data.len() * (1 + size as usize));
        params.push(register as u8);
        params.push(size);

        for &(id, value) in data {
            params.push(id);
            params.push((value & 0xFF) as u8);
            if size == 2 {
                params.push((value >> 8) as u8);
            }
        }
        params
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.port.write_all(packet)?;
        self.port.flush()?;
        Ok(())
    }

    /// Read a response packet
    fn read_response(&mut self, expected_id: u8) -> Result<Vec<u8>> {
        let mut header = [0u8; 2];
        self.port.read_exact(&mut header).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                FeetechError::Timeout { id: expected_id }
            } else {
                FeetechError::Io(e)
            }
        })?;

        if header != HEADER {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("Invalid header: {:02X?}", header),
            });
        }

        let mut id_length = [0u8; 2];
        self.port.read_exact(&mut id_length)?;
        let id = id_length[0];
        let length = id_length[1] as usize;

        if id != expected_id {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("ID mismatch: expected {}, got {}", expected_id, id),
            });
        }
        if length < 2 {
            return Err(FeetechError::InvalidResponse {
                id,
                reason: format!("Length field too short: {}", length),
            });
        }

        // Read remaining bytes (error + params + checksum = length bytes)
        let mut remaining = vec![0u8; length];
        self.port.read_exact(&mut remaining)?;

        let mut checksum_data = vec![id, length as u8];
        checksum_data.extend_from_slice(&remaining[..remaining.len() - 1]);
        let expected_checksum = Self::checksum(&checksum_data);
        let received_checksum = remaining[remaining.len() - 1];

        if expected_checksum != received_checksum {
            return Err(FeetechError::ChecksumMismatch { id });
        }

        let error_status = remaining[0];
        if error_status != 0 {
            return Err(FeetechError::MotorError {
                id,
                status: error_status,
            });
        }

        // Return parameters (excluding error byte and checksum)
        Ok(remaining[1..remaining.len() - 1].to_vec())
    }

    /// Ping a motor to check if it's connected
    pub fn ping(&mut self, id: u8) -> Result<bool> {
        let packet = Self::build_packet(id, Instruction::Ping, &[]);
        self.send_packet(&packet)?;

        match self.read_response(id) {
            Ok(_) => Ok(true),
            Err(FeetechError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write a register, using its natural width (little-endian for 2 bytes)
    pub fn write_register(&mut self, id: u8, register: Register, value: u16) -> Result<()> {
        let mut params = vec![register as u8, (value & 0xFF) as u8];
        if register.size() == 2 {
            params.push((value >> 8) as u8);
        }
        let packet = Self::build_packet(id, Instruction::Write, &params);
        debug!(
            "Write to motor {}: reg={:?}, value={}",
            id, register, value
        );
        self.send_packet(&packet)?;

        // Read status response
        let _ = self.read_response(id)?;
        Ok(())
    }

    /// Read a register, using its natural width
    pub fn read_register(&mut self, id: u8, register: Register) -> Result<u16> {
        let size = register.size();
        let packet = Self::build_packet(id, Instruction::Read, &[register as u8, size]);
        self.send_packet(&packet)?;

        let response = self.read_response(id)?;
        Self::decode_data(id, size, &response)
    }

    fn decode_data(id: u8, size: u8, data: &[u8]) -> Result<u16> {
        if data.len() < size as usize {
            return Err(FeetechError::InvalidResponse {
                id,
                reason: format!("Expected {} bytes, got {}", size, data.len()),
            });
        }
        Ok(if size == 2 {
            u16::from_le_bytes([data[0], data[1]])
        } else {
            data[0] as u16
        })
    }

    /// Sync read: read the same register from several motors in one transaction
    ///
    /// Every addressed motor answers with its own status packet, in ID order.
    pub fn sync_read(&mut self, register: Register, ids: &[u8]) -> Result<Vec<(u8, u16)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let size = register.size();
        let mut params = vec![register as u8, size];
        params.extend_from_slice(ids);

        let packet = Self::build_packet(BROADCAST_ID, Instruction::SyncRead, &params);
        debug!("Sync read from {} motors: reg={:?}", ids.len(), register);
        self.send_packet(&packet)?;

        let mut values = Vec::with_capacity(ids.len());
        for &id in ids {
            let response = self.read_response(id)?;
            values.push((id, Self::decode_data(id, size, &response)?));
        }
        Ok(values)
    }

    /// Sync write: write same register to multiple motors efficiently
    /// data: [(id, value), ...]
    pub fn sync_write(&mut self, register: Register, data: &[(u8, u16)]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let params = Self::sync_write_params(register, data);

        // Broadcast ID for sync write
        let packet = Self::build_packet(BROADCAST_ID, Instruction::SyncWrite, &params);
        debug!("Sync write to {} motors: reg={:?}", data.len(), register);
        self.send_packet(&packet)?;

        // Sync write has no response
        Ok(())
    }

    // === High-level convenience methods ===

    /// Enable torque on a motor
    pub fn enable_torque(&mut self, id: u8) -> Result<()> {
        self.write_register(id, Register::TorqueEnable, 1)?;
        self.write_register(id, Register::Lock, 1)
    }

    /// Disable torque on a motor
    pub fn disable_torque(&mut self, id: u8) -> Result<()> {
        self.write_register(id, Register::TorqueEnable, 0)?;
        self.write_register(id, Register::Lock, 0)
    }

    /// Ping every possible ID and return the ones that answer
    pub fn scan(&mut self) -> Result<Vec<u8>> {
        let mut found = Vec::new();
        for id in 0..=MAX_MOTOR_ID {
            if self.ping(id)? {
                found.push(id);
            }
        }
        Ok(found)
    }
}

/// Encode a signed value to sign-magnitude format with the given sign bit
fn encode_sign_magnitude(value: i32, sign_bit: u32) -> u16 {
    let magnitude = value.unsigned_abs() as u16;
    if value < 0 {
        (1 << sign_bit) | magnitude
    } else {
        magnitude
    }
}

/// Decode sign-magnitude format to a signed value
fn decode_sign_magnitude(raw: u16, sign_bit: u32) -> i32 {
    let magnitude = (raw & ((1 << sign_bit) - 1)) as i32;
    if raw & (1 << sign_bit) != 0 {
        -magnitude
    } else {
        magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        // Example: ID=1, Length=4, Instruction=WRITE, Addr=30, Data=0, 2
        let data = [1u8, 4, 0x03, 30, 0, 2];
        let checksum = FeetechBus::checksum(&data);
        // ~(1+4+3+30+0+2) = ~40 = 215
        assert_eq!(checksum, 215);
    }

    #[test]
    fn test_homing_offset_sign_magnitude() {
        assert_eq!(Register::HomingOffset.encode(0).unwrap(), 0);
        assert_eq!(Register::HomingOffset.encode(100).unwrap(), 100);
        assert_eq!(Register::HomingOffset.encode(-100).unwrap(), 0x0800 | 100);
        assert_eq!(Register::HomingOffset.encode(-2047).unwrap(), 0x0FFF);
        assert!(Register::HomingOffset.encode(2048).is_err());

        assert_eq!(Register::HomingOffset.decode(0x0800 | 100), -100);
        assert_eq!(Register::HomingOffset.decode(100), 100);
    }

    #[test]
    fn test_register_range_checks() {
        assert_eq!(Register::GoalPosition.encode(4095).unwrap(), 4095);
        assert!(Register::GoalPosition.encode(-1).is_err());
        assert!(Register::PCoefficient.encode(256).is_err());
        assert_eq!(Register::PCoefficient.encode(16).unwrap(), 16);
    }

    #[test]
    fn test_build_packet() {
        let packet = FeetechBus::build_packet(1, Instruction::Ping, &[]);
        // Header (2) + ID (1) + Length (1) + Instruction (1) + Checksum (1) = 6 bytes
        assert_eq!(packet.len(), 6);
        assert_eq!(packet[0], 0xFF);
        assert_eq!(packet[1], 0xFF);
        assert_eq!(packet[2], 1); // ID
        assert_eq!(packet[3], 2); // Length (instruction + checksum)
        assert_eq!(packet[4], 0x01); // PING instruction
    }

    #[test]
    fn test_sync_write_params_widths() {
        let two = FeetechBus::sync_write_params(Register::GoalPosition, &[(7, 0x0102), (8, 5)]);
        assert_eq!(two, vec![42, 2, 7, 0x02, 0x01, 8, 5, 0]);

        let one = FeetechBus::sync_write_params(Register::TorqueEnable, &[(1, 1), (2, 0)]);
        assert_eq!(one, vec![40, 1, 1, 1, 2, 0]);
    }
}
