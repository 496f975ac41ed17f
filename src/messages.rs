// Message types exchanged with the policy side
//
// Joints are addressed internally by a typed (side, joint) key; the string key
// grammar `{left_|right_|}{joint}.pos` only exists at the wire boundary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::camera::Image;
use crate::error::{Error, Result};

/// Suffix of every joint position key on the wire
pub const POS_SUFFIX: &str = ".pos";

/// Which arm of the bimanual pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Left, Side::Right];

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }

    /// Wire prefix, including the trailing underscore
    pub fn prefix(self) -> &'static str {
        match self {
            Side::Left => "left_",
            Side::Right => "right_",
        }
    }

    /// First motor ID on this side's bus (left 1-6, right 7-12)
    pub fn id_base(self) -> u8 {
        match self {
            Side::Left => 1,
            Side::Right => 7,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The six joints of an SO-100 arm, in bus order
///
/// The derived `Ord` follows declaration order, so maps keyed by `Joint`
/// iterate shoulder to gripper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Joint {
    ShoulderPan,
    ShoulderLift,
    ElbowFlex,
    WristFlex,
    WristRoll,
    Gripper,
}

impl Joint {
    pub const ALL: [Joint; 6] = [
        Joint::ShoulderPan,
        Joint::ShoulderLift,
        Joint::ElbowFlex,
        Joint::WristFlex,
        Joint::WristRoll,
        Joint::Gripper,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Joint::ShoulderPan => "shoulder_pan",
            Joint::ShoulderLift => "shoulder_lift",
            Joint::ElbowFlex => "elbow_flex",
            Joint::WristFlex => "wrist_flex",
            Joint::WristRoll => "wrist_roll",
            Joint::Gripper => "gripper",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|j| j.name() == name)
    }

    /// Zero-based position in `ALL`
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Joint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A joint on a specific arm. `side` is `None` for single-arm robots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JointKey {
    pub side: Option<Side>,
    pub joint: Joint,
}

impl JointKey {
    pub fn sided(side: Side, joint: Joint) -> Self {
        Self {
            side: Some(side),
            joint,
        }
    }

    pub fn bare(joint: Joint) -> Self {
        Self { side: None, joint }
    }

    /// Motor name without the `.pos` suffix, e.g. `left_gripper`
    pub fn motor_name(&self) -> String {
        match self.side {
            Some(side) => format!("{}{}", side.prefix(), self.joint.name()),
            None => self.joint.name().to_string(),
        }
    }

    /// Wire key, e.g. `left_gripper.pos`
    pub fn wire_key(&self) -> String {
        format!("{}{}", self.motor_name(), POS_SUFFIX)
    }

    /// Parse a wire key. With `sided` the side prefix is mandatory, otherwise
    /// it must be absent. Returns `None` for anything that does not match.
    pub fn parse(key: &str, sided: bool) -> Option<Self> {
        let name = key.strip_suffix(POS_SUFFIX)?;
        Self::parse_motor_name(name, sided)
    }

    /// Parse a motor name (no `.pos` suffix), as used by the calibration file
    pub fn parse_motor_name(name: &str, sided: bool) -> Option<Self> {
        if !sided {
            return Joint::from_name(name).map(Self::bare);
        }
        Side::BOTH.into_iter().find_map(|side| {
            name.strip_prefix(side.prefix())
                .and_then(Joint::from_name)
                .map(|joint| Self::sided(side, joint))
        })
    }
}

impl fmt::Display for JointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire_key())
    }
}

/// Flat wire-format action: `{wire_key: position}`
pub type Action = BTreeMap<String, f32>;

/// Parse a wire action into typed targets, dropping keys that do not match
///
/// A non-finite goal on a joint key rejects the whole action.
pub fn parse_action(action: &Action, sided: bool) -> Result<BTreeMap<JointKey, f32>> {
    let mut targets = BTreeMap::new();
    for (key, &value) in action {
        let Some(joint) = JointKey::parse(key, sided) else {
            continue;
        };
        if !value.is_finite() {
            return Err(Error::InvalidConfiguration(format!(
                "goal for {key} is not a finite number: {value}"
            )));
        }
        targets.insert(joint, value);
    }
    Ok(targets)
}

/// Format typed targets back into a wire action
pub fn format_action(targets: &BTreeMap<JointKey, f32>) -> Action {
    targets.iter().map(|(k, &v)| (k.wire_key(), v)).collect()
}

/// Shape of one observation/action entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    Scalar,
    Image { height: u32, width: u32, channels: u32 },
}

/// One observation snapshot
///
/// Iteration order is fixed: left joints, right joints (each in `Joint::ALL`
/// order), then cameras sorted by name.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub joints: BTreeMap<JointKey, f32>,
    pub images: BTreeMap<String, Image>,
}

impl Observation {
    /// All wire keys, in the stable merge order
    pub fn keys(&self) -> Vec<String> {
        self.joints
            .keys()
            .map(JointKey::wire_key)
            .chain(self.images.keys().cloned())
            .collect()
    }

    /// Joint part of the observation in wire format
    pub fn joint_map(&self) -> Action {
        format_action(&self.joints)
    }
}

/// Joint state published by the runtime
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JointState {
    pub positions: BTreeMap<String, f32>,
    pub timestamp_ms: u64,
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
    Fault,
}
