// Per-step motion bound
//
// Clips every commanded goal to within `bound` of the present position so a
// single bad command cannot slam a joint across its range.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::{Error, Result};
use crate::messages::JointKey;

/// Configured bound: one value for every motor, or one per motor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxRelativeTarget {
    Uniform(f32),
    PerMotor(Vec<f32>),
}

impl MaxRelativeTarget {
    /// Check the bound against the number of motors it will cover
    pub fn validate(&self, motor_count: usize) -> Result<()> {
        let values: &[f32] = match self {
            MaxRelativeTarget::Uniform(v) => std::slice::from_ref(v),
            MaxRelativeTarget::PerMotor(list) => {
                if list.len() != motor_count {
                    return Err(Error::InvalidConfiguration(format!(
                        "max_relative_target list must have exactly {motor_count} values (one per motor), got {}",
                        list.len()
                    )));
                }
                list
            }
        };
        if let Some(bad) = values.iter().find(|v| !v.is_finite() || **v < 0.0) {
            return Err(Error::InvalidConfiguration(format!(
                "max_relative_target must be finite and non-negative, got {bad}"
            )));
        }
        Ok(())
    }

    /// Pin the bound to `keys`, which must be in the fixed motor order
    pub fn resolve(&self, keys: &[JointKey]) -> Result<SafetyBounds> {
        self.validate(keys.len())?;
        let bounds = match self {
            MaxRelativeTarget::Uniform(v) => keys.iter().map(|&k| (k, *v)).collect(),
            MaxRelativeTarget::PerMotor(list) => keys.iter().copied().zip(list.iter().copied()).collect(),
        };
        Ok(SafetyBounds { bounds })
    }
}

/// Bound per motor, resolved at construction
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyBounds {
    bounds: BTreeMap<JointKey, f32>,
}

impl SafetyBounds {
    pub fn bound(&self, key: &JointKey) -> Option<f32> {
        self.bounds.get(key).copied()
    }

    /// Clamp every `(goal, present)` pair
    pub fn clamp(&self, goal_present: &BTreeMap<JointKey, (f32, f32)>) -> Result<BTreeMap<JointKey, f32>> {
        goal_present
            .iter()
            .map(|(key, &(goal, present))| {
                let bound = self.bound(key).ok_or_else(|| {
                    Error::InvalidConfiguration(format!("no safety bound for {key}"))
                })?;
                Ok((*key, clamp_goal(goal, present, bound)))
            })
            .collect()
    }
}

/// Clip `goal` so that `|goal - present| <= bound`, keeping the direction
pub fn clamp_goal(goal: f32, present: f32, bound: f32) -> f32 {
    let delta = goal - present;
    if delta.abs() <= bound {
        return goal;
    }
    let safe = present + delta.signum() * bound;
    warn!(
        "Relative goal position magnitude had to be clamped to be safe: {} -> {} (present {}, bound {})",
        goal, safe, present, bound
    );
    safe
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Joint, Side};

    fn all_keys() -> Vec<JointKey> {
        Side::BOTH
            .iter()
            .flat_map(|&s| Joint::ALL.iter().map(move |&j| JointKey::sided(s, j)))
            .collect()
    }

    #[test]
    fn test_clamp_scenarios() {
        assert_eq!(clamp_goal(50.0, 0.0, 10.0), 10.0);
        assert_eq!(clamp_goal(5.0, 0.0, 10.0), 5.0);
        assert_eq!(clamp_goal(-50.0, 0.0, 10.0), -10.0);
        assert_eq!(clamp_goal(-50.0, -45.0, 10.0), -50.0);
        assert_eq!(clamp_goal(3.0, 3.0, 0.0), 3.0);
    }

    #[test]
    fn test_clamp_properties_over_grid() {
        let values = [-100.0f32, -37.5, -10.0, -0.5, 0.0, 0.5, 9.0, 42.0, 100.0];
        let bounds = [0.0f32, 1.0, 5.0, 10.0, 250.0];
        for &bound in &bounds {
            for &goal in &values {
                for &present in &values {
                    let clamped = clamp_goal(goal, present, bound);
                    assert!((clamped - present).abs() <= bound + 1e-4);
                    if goal != present && bound > 0.0 {
                        assert_eq!((clamped - present).signum(), (goal - present).signum());
                    }
                }
            }
        }
    }

    #[test]
    fn test_list_length_must_match() {
        let keys = all_keys();
        assert!(MaxRelativeTarget::PerMotor(vec![10.0; 11]).resolve(&keys).is_err());
        assert!(MaxRelativeTarget::PerMotor(vec![10.0; 13]).resolve(&keys).is_err());
        assert!(MaxRelativeTarget::PerMotor(vec![10.0; 12]).resolve(&keys).is_ok());
        assert!(MaxRelativeTarget::Uniform(-1.0).resolve(&keys).is_err());
        assert!(MaxRelativeTarget::Uniform(f32::NAN).resolve(&keys).is_err());
    }

    #[test]
    fn test_per_motor_order_is_left_then_right() {
        let keys = all_keys();
        let list: Vec<f32> = (1..=12).map(|v| v as f32).collect();
        let bounds = MaxRelativeTarget::PerMotor(list).resolve(&keys).unwrap();
        assert_eq!(bounds.bound(&JointKey::sided(Side::Left, Joint::ShoulderPan)), Some(1.0));
        assert_eq!(bounds.bound(&JointKey::sided(Side::Left, Joint::Gripper)), Some(6.0));
        assert_eq!(bounds.bound(&JointKey::sided(Side::Right, Joint::ShoulderPan)), Some(7.0));
        assert_eq!(bounds.bound(&JointKey::sided(Side::Right, Joint::Gripper)), Some(12.0));
    }

    #[test]
    fn test_clamp_map_requires_bound() {
        let keys = vec![JointKey::bare(Joint::Gripper)];
        let bounds = MaxRelativeTarget::Uniform(10.0).resolve(&keys).unwrap();
        let ok = BTreeMap::from([(JointKey::bare(Joint::Gripper), (50.0, 0.0))]);
        assert_eq!(bounds.clamp(&ok).unwrap()[&JointKey::bare(Joint::Gripper)], 10.0);
        let foreign = BTreeMap::from([(JointKey::bare(Joint::ElbowFlex), (50.0, 0.0))]);
        assert!(bounds.clamp(&foreign).is_err());
    }
}
