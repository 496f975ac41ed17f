// Calibration protocol for one arm
//
// Two operator-guided phases:
//   1. homing: arm held at mid-range, homing offsets written so the pose reads
//      as the middle of the encoder span
//   2. range recording: every joint except the full-turn one is swept while
//      min/max raw positions are tracked
//
// The protocol is a state machine driven by `confirm()`; the `Operator` trait
// is one way to drive it from a console or UI.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::FULL_TURN_JOINT;
use crate::error::{Error, Result};
use crate::messages::{Joint, JointKey, Side};
use crate::motor::{
    CalibrationMap, ENCODER_MAX, MotorBus, MotorCalibration, RangeRecorder, RawValues,
};

/// Where the protocol currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStage {
    /// Torque is off; waiting for the operator to hold the arm at mid-range
    WaitingForOperator,
    /// Homing done; sampling positions while the operator sweeps the joints
    RecordingRanges,
    /// Calibration assembled and validated
    Complete,
}

/// Calibration run for a single bus
#[derive(Debug)]
pub struct CalibrationProtocol {
    label: String,
    stage: CalibrationStage,
    full_turn: Joint,
    homing_offsets: RawValues,
    recorder: Option<RangeRecorder>,
    result: Option<CalibrationMap>,
}

impl CalibrationProtocol {
    /// Disable torque and switch every motor to position mode
    pub fn begin<B: MotorBus + ?Sized>(bus: &mut B, label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        info!("Running calibration of {}", label);
        bus.disable_torque()?;
        bus.set_position_mode()?;
        Ok(Self {
            label,
            stage: CalibrationStage::WaitingForOperator,
            full_turn: FULL_TURN_JOINT,
            homing_offsets: RawValues::new(),
            recorder: None,
            result: None,
        })
    }

    pub fn stage(&self) -> CalibrationStage {
        self.stage
    }

    /// Prompt shown to the operator for the current stage
    pub fn instructions(&self) -> String {
        match self.stage {
            CalibrationStage::WaitingForOperator => format!(
                "Move {} to the middle of its range of motion and confirm",
                self.label
            ),
            CalibrationStage::RecordingRanges => format!(
                "Move all {} joints except '{}' sequentially through their entire ranges of motion. Recording positions; confirm to stop",
                self.label, self.full_turn
            ),
            CalibrationStage::Complete => format!("{} calibration complete", self.label),
        }
    }

    /// Advance to the next stage
    ///
    /// From `WaitingForOperator` this computes homing offsets and starts
    /// recording; from `RecordingRanges` it stops recording and assembles the
    /// calibration map (failing on any zero-width range).
    pub fn confirm<B: MotorBus + ?Sized>(&mut self, bus: &mut B) -> Result<CalibrationStage> {
        match self.stage {
            CalibrationStage::WaitingForOperator => {
                self.homing_offsets = bus.set_half_turn_homings()?;
                let sweep: Vec<Joint> = bus
                    .motors()
                    .keys()
                    .copied()
                    .filter(|&j| j != self.full_turn)
                    .collect();
                let mut recorder = RangeRecorder::new(&sweep);
                // The homing pose is the first sample of the sweep
                recorder.sample(bus)?;
                self.recorder = Some(recorder);
                self.stage = CalibrationStage::RecordingRanges;
                info!("{}: homing done, recording ranges of motion", self.label);
            }
            CalibrationStage::RecordingRanges => {
                let recorder = self.recorder.take().ok_or_else(|| Error::CalibrationIncomplete {
                    motor: self.label.clone(),
                    reason: "range recording never started".to_string(),
                })?;
                info!("{}: stopped after {} samples", self.label, recorder.samples());
                let (mins, maxes) = recorder.into_ranges();
                let calibration = self.assemble(bus, &mins, &maxes)?;
                self.result = Some(calibration);
                self.stage = CalibrationStage::Complete;
            }
            CalibrationStage::Complete => {}
        }
        Ok(self.stage)
    }

    /// Take one position sample while recording ranges
    pub fn sample<B: MotorBus + ?Sized>(&mut self, bus: &mut B) -> Result<()> {
        match (self.stage, self.recorder.as_mut()) {
            (CalibrationStage::RecordingRanges, Some(recorder)) => recorder.sample(bus),
            _ => Ok(()),
        }
    }

    fn assemble<B: MotorBus + ?Sized>(
        &self,
        bus: &B,
        mins: &RawValues,
        maxes: &RawValues,
    ) -> Result<CalibrationMap> {
        let mut calibration = CalibrationMap::new();
        for (&joint, motor) in bus.motors() {
            let homing_offset = *self.homing_offsets.get(&joint).ok_or_else(|| {
                Error::CalibrationIncomplete {
                    motor: format!("{} {}", self.label, joint),
                    reason: "no homing offset".to_string(),
                }
            })?;
            let (range_min, range_max) = if joint == self.full_turn {
                (0, ENCODER_MAX)
            } else {
                match (mins.get(&joint), maxes.get(&joint)) {
                    (Some(&min), Some(&max)) => (min, max),
                    _ => {
                        return Err(Error::CalibrationIncomplete {
                            motor: format!("{} {}", self.label, joint),
                            reason: "never sampled during range recording".to_string(),
                        });
                    }
                }
            };
            let cal = MotorCalibration {
                id: motor.id,
                drive_mode: 0,
                homing_offset,
                range_min,
                range_max,
            };
            cal.validate(&format!("{} {}", self.label, joint))?;
            calibration.insert(joint, cal);
        }
        Ok(calibration)
    }

    /// The finished calibration, once `Complete`
    pub fn into_calibration(self) -> Result<CalibrationMap> {
        self.result.ok_or_else(|| Error::CalibrationIncomplete {
            motor: self.label,
            reason: "calibration did not reach completion".to_string(),
        })
    }
}

/// Whoever physically moves the arm during calibration
pub trait Operator: Send {
    /// Show `message` and block until the operator confirms
    fn wait_for_confirm(&mut self, message: &str) -> Result<()>;

    /// Polled between range samples; true once the operator wants to stop
    fn stop_requested(&mut self) -> Result<bool>;
}

/// Drive a full calibration of `bus` with `operator`
pub fn run_calibration<B: MotorBus + ?Sized>(
    bus: &mut B,
    label: &str,
    operator: &mut dyn Operator,
) -> Result<CalibrationMap> {
    let mut protocol = CalibrationProtocol::begin(bus, label)?;
    operator.wait_for_confirm(&protocol.instructions())?;
    protocol.confirm(bus)?;

    operator.wait_for_confirm(&protocol.instructions())?;
    while !operator.stop_requested()? {
        protocol.sample(bus)?;
    }
    protocol.confirm(bus)?;
    protocol.into_calibration()
}

/// Operator that cannot calibrate; for unattended runs
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOperator;

impl Operator for NoOperator {
    fn wait_for_confirm(&mut self, _message: &str) -> Result<()> {
        Err(Error::Unsupported("calibration requires an operator"))
    }

    fn stop_requested(&mut self) -> Result<bool> {
        Ok(true)
    }
}

/// Operator that confirms immediately and stops after a fixed number of polls
#[derive(Debug, Clone)]
pub struct ScriptedOperator {
    polls_before_stop: usize,
    polls: usize,
    pub prompts: Vec<String>,
}

impl ScriptedOperator {
    pub fn new(polls_before_stop: usize) -> Self {
        Self {
            polls_before_stop,
            polls: 0,
            prompts: Vec::new(),
        }
    }
}

impl Operator for ScriptedOperator {
    fn wait_for_confirm(&mut self, message: &str) -> Result<()> {
        self.prompts.push(message.to_string());
        self.polls = 0;
        Ok(())
    }

    fn stop_requested(&mut self) -> Result<bool> {
        self.polls += 1;
        Ok(self.polls > self.polls_before_stop)
    }
}

// === Persistence ===

/// Combined calibration keyed by prefixed motor name (`left_gripper`, ...)
pub type CalibrationFile = BTreeMap<String, MotorCalibration>;

/// Persistence seam for calibration data
pub trait CalibrationStore: Send {
    /// Stored calibration, or `None` when nothing has been saved yet
    fn load(&self) -> Result<Option<CalibrationFile>>;

    fn save(&mut self, calibration: &CalibrationFile) -> Result<()>;
}

/// Calibration kept as pretty-printed JSON on disk
#[derive(Debug, Clone)]
pub struct JsonCalibrationStore {
    path: PathBuf,
}

impl JsonCalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CalibrationStore for JsonCalibrationStore {
    fn load(&self) -> Result<Option<CalibrationFile>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn save(&mut self, calibration: &CalibrationFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(calibration)?;
        std::fs::write(&self.path, json)?;
        info!("Calibration saved to {}", self.path.display());
        Ok(())
    }
}

/// Calibration kept in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryCalibrationStore {
    pub saved: Option<CalibrationFile>,
    pub saves: usize,
}

impl MemoryCalibrationStore {
    pub fn with(calibration: CalibrationFile) -> Self {
        Self {
            saved: Some(calibration),
            saves: 0,
        }
    }
}

impl CalibrationStore for MemoryCalibrationStore {
    fn load(&self) -> Result<Option<CalibrationFile>> {
        Ok(self.saved.clone())
    }

    fn save(&mut self, calibration: &CalibrationFile) -> Result<()> {
        self.saved = Some(calibration.clone());
        self.saves += 1;
        Ok(())
    }
}

/// Flatten per-arm maps into the persisted layout
pub fn merge_calibration(arms: &[(Option<Side>, &CalibrationMap)]) -> CalibrationFile {
    arms.iter()
        .flat_map(|&(side, map)| {
            map.iter().map(move |(&joint, cal)| {
                let key = JointKey { side, joint };
                (key.motor_name(), *cal)
            })
        })
        .collect()
}

/// Extract one arm's map from the persisted layout, ignoring foreign entries
pub fn split_calibration(file: &CalibrationFile, side: Option<Side>) -> CalibrationMap {
    let sided = side.is_some();
    file.iter()
        .filter_map(|(name, cal)| {
            let key = JointKey::parse_motor_name(name, sided)?;
            (key.side == side).then_some((key.joint, *cal))
        })
        .collect()
}

/// Load a persisted calibration; only a missing one counts as empty
pub fn load_or_empty(store: &dyn CalibrationStore) -> Result<CalibrationFile> {
    Ok(store.load()?.unwrap_or_default())
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::motor::mock::MockMotorBus;
    use crate::motor::so100_motors;

    fn sweep_frames() -> Vec<RawValues> {
        vec![
            Joint::ALL.iter().map(|&j| (j, 1000)).collect(),
            Joint::ALL.iter().map(|&j| (j, 3000)).collect(),
        ]
    }

    #[test]
    fn test_state_machine_stages() {
        let mut bus = MockMotorBus::new("/dev/left", so100_motors(1, false));
        bus.connect().unwrap();
        let mut protocol = CalibrationProtocol::begin(&mut bus, "left arm").unwrap();
        assert_eq!(protocol.stage(), CalibrationStage::WaitingForOperator);
        assert!(protocol.instructions().contains("middle"));

        assert_eq!(protocol.confirm(&mut bus).unwrap(), CalibrationStage::RecordingRanges);
        bus.handle().queue_positions(sweep_frames());
        protocol.sample(&mut bus).unwrap();
        protocol.sample(&mut bus).unwrap();
        assert_eq!(protocol.confirm(&mut bus).unwrap(), CalibrationStage::Complete);

        let cal = protocol.into_calibration().unwrap();
        assert_eq!(cal.len(), 6);
        assert_eq!(cal[&Joint::ElbowFlex].range_min, 1000);
        assert_eq!(cal[&Joint::ElbowFlex].range_max, 3000);
        // Full-turn joint ignores the sweep
        assert_eq!(cal[&Joint::WristRoll].range_min, 0);
        assert_eq!(cal[&Joint::WristRoll].range_max, 4095);
    }

    #[test]
    fn test_unswept_joint_is_rejected() {
        let mut bus = MockMotorBus::new("/dev/left", so100_motors(1, false));
        bus.connect().unwrap();
        // Operator stops immediately: every range collapses to the homing pose
        let err = run_calibration(&mut bus, "left arm", &mut ScriptedOperator::new(0)).unwrap_err();
        assert!(matches!(err, Error::CalibrationIncomplete { .. }), "got {err}");
    }

    #[test]
    fn test_no_operator_refuses() {
        let mut bus = MockMotorBus::new("/dev/left", so100_motors(1, false));
        bus.connect().unwrap();
        assert!(matches!(
            run_calibration(&mut bus, "left arm", &mut NoOperator),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_merge_and_split_round_trip_by_side() {
        let motors = so100_motors(1, false);
        let left = crate::motor::mock::full_range_calibration(&motors);
        let right = crate::motor::mock::full_range_calibration(&so100_motors(7, false));
        let file = merge_calibration(&[(Some(Side::Left), &left), (Some(Side::Right), &right)]);
        assert_eq!(file.len(), 12);
        assert!(file.contains_key("left_gripper"));
        assert_eq!(file["right_shoulder_pan"].id, 7);

        assert_eq!(split_calibration(&file, Some(Side::Left)), left);
        assert_eq!(split_calibration(&file, Some(Side::Right)), right);
        // A single-arm view of a bimanual file finds nothing
        assert!(split_calibration(&file, None).is_empty());
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("so100-cal-{}", std::process::id()));
        let mut store = JsonCalibrationStore::new(dir.join("bimanual.json"));
        assert!(store.load().unwrap().is_none());

        let file = merge_calibration(&[(
            None,
            &crate::motor::mock::full_range_calibration(&so100_motors(1, true)),
        )]);
        store.save(&file).unwrap();
        assert_eq!(store.load().unwrap(), Some(file));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = std::env::temp_dir().join(format!("so100-cal-corrupt-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bimanual.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = JsonCalibrationStore::new(&path);
        assert!(matches!(load_or_empty(&store), Err(Error::Json(_))));
        // Missing is the only case treated as empty
        let missing = JsonCalibrationStore::new(dir.join("missing.json"));
        assert!(load_or_empty(&missing).unwrap().is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }
}
