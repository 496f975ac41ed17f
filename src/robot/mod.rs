// Robots built from SO-100 arms
//
// Provides:
// - `ArmController`: lifecycle and normalized I/O of one arm
// - `BimanualFollower`: two follower arms plus cameras as one device
// - `So100Follower`: a single follower arm with unprefixed keys
// - The per-step safety clamp applied to outgoing goals

mod arm;
mod bimanual;
mod safety;
mod single;

pub use arm::{ArmController, ArmRole, ArmState, ConnectOutcome};
pub use bimanual::BimanualFollower;
pub use safety::{MaxRelativeTarget, SafetyBounds, clamp_goal};
pub use single::So100Follower;

use std::collections::BTreeMap;
use std::panic;
use std::thread;
use std::time::Instant;
use tracing::{debug, info};

use crate::camera::{CameraConfig, CameraSet, Image};
use crate::config::CAMERA_TIMEOUT;
use crate::error::{Error, Result};
use crate::messages::{Action, FeatureType, Joint, JointKey, Observation};
use crate::motor::MotorBus;

/// Ordered `(key, type)` descriptors of an observation or action
pub type Features = Vec<(String, FeatureType)>;

/// A device that is observed and commanded through flat key maps
pub trait Robot: Send {
    fn name(&self) -> &'static str;

    fn observation_features(&self) -> &Features;

    fn action_features(&self) -> &Features;

    fn is_connected(&self) -> bool;

    fn is_calibrated(&self) -> bool;

    /// Connect every resource, calibrating first when needed and `calibrate` is set
    fn connect(&mut self, calibrate: bool) -> Result<()>;

    fn calibrate(&mut self) -> Result<()>;

    fn configure(&mut self) -> Result<()>;

    /// Assign motor IDs one motor at a time (robot must be disconnected)
    fn setup_motors(&mut self) -> Result<()>;

    fn get_observation(&mut self) -> Result<Observation>;

    /// Command joint goals; returns what was actually sent after clamping
    fn send_action(&mut self, action: &Action) -> Result<Action>;

    fn disconnect(&mut self) -> Result<()>;
}

/// Run `a` on a scoped thread and `b` on the current one, then join
pub(crate) fn join<A, B, RA, RB>(a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA + Send,
    B: FnOnce() -> RB,
    RA: Send,
{
    thread::scope(|s| {
        let handle = s.spawn(a);
        let rb = b();
        let ra = handle.join().unwrap_or_else(|e| panic::resume_unwind(e));
        (ra, rb)
    })
}

/// Read every camera concurrently
pub(crate) fn read_cameras(cameras: &mut CameraSet) -> Result<BTreeMap<String, Image>> {
    if cameras.is_empty() {
        return Ok(BTreeMap::new());
    }
    thread::scope(|s| {
        let handles: Vec<_> = cameras
            .iter_mut()
            .map(|(name, camera)| {
                let handle = s.spawn(move || {
                    let start = Instant::now();
                    let frame = camera.async_read(CAMERA_TIMEOUT);
                    debug!("{} read: {:.1}ms", name, start.elapsed().as_secs_f64() * 1e3);
                    frame
                });
                (name.clone(), handle)
            })
            .collect();

        let mut images = BTreeMap::new();
        for (name, handle) in handles {
            let frame = handle.join().unwrap_or_else(|e| panic::resume_unwind(e));
            let image = frame.map_err(|e| {
                if e.is_lifecycle() {
                    e
                } else {
                    Error::Camera {
                        name: name.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;
            images.insert(name, image);
        }
        Ok(images)
    })
}

pub(crate) fn connect_cameras(cameras: &mut CameraSet) -> Result<()> {
    for (name, camera) in cameras.iter_mut() {
        camera.connect()?;
        info!("Camera {} connected", name);
    }
    Ok(())
}

/// Check that the supplied cameras are exactly the configured ones
pub(crate) fn check_cameras(cameras: &CameraSet, configs: &BTreeMap<String, CameraConfig>) -> Result<()> {
    if cameras.keys().ne(configs.keys()) {
        return Err(Error::InvalidConfiguration(format!(
            "cameras {:?} do not match configured cameras {:?}",
            cameras.keys().collect::<Vec<_>>(),
            configs.keys().collect::<Vec<_>>()
        )));
    }
    Ok(())
}

/// Joint keys as scalars, then cameras as images
pub(crate) fn features(keys: &[JointKey], cameras: &BTreeMap<String, CameraConfig>) -> (Features, Features) {
    let action: Features = keys.iter().map(|k| (k.wire_key(), FeatureType::Scalar)).collect();
    let mut observation = action.clone();
    observation.extend(cameras.iter().map(|(name, cfg)| {
        (
            name.clone(),
            FeatureType::Image {
                height: cfg.height,
                width: cfg.width,
                channels: Image::CHANNELS,
            },
        )
    }));
    (observation, action)
}

/// Clamp (when bounded) and write one arm's goals
///
/// An arm without goals is not touched at all, not even for the
/// present-position read the clamp needs.
pub(crate) fn drive_arm<B: MotorBus>(
    arm: &mut ArmController<B>,
    goals: &BTreeMap<Joint, f32>,
    bounds: Option<&SafetyBounds>,
) -> Result<BTreeMap<JointKey, f32>> {
    if goals.is_empty() {
        return Ok(BTreeMap::new());
    }
    let side = arm.side();
    let key = |joint| JointKey { side, joint };

    let sent = match bounds {
        Some(bounds) => {
            let present = arm.read_positions()?;
            let mut goal_present = BTreeMap::new();
            for (&joint, &goal) in goals {
                let now = present.get(&joint).copied().ok_or_else(|| Error::CalibrationIncomplete {
                    motor: key(joint).motor_name(),
                    reason: "no present position".to_string(),
                })?;
                goal_present.insert(key(joint), (goal, now));
            }
            bounds.clamp(&goal_present)?
        }
        None => goals.iter().map(|(&joint, &goal)| (key(joint), goal)).collect(),
    };

    let per_joint: BTreeMap<Joint, f32> = sent.iter().map(|(k, &v)| (k.joint, v)).collect();
    arm.write_positions(&per_joint)?;
    Ok(sent)
}

/// Collects disconnect failures so every resource gets a release attempt
#[derive(Debug, Default)]
pub(crate) struct Teardown {
    failures: Vec<(String, Error)>,
}

impl Teardown {
    pub(crate) fn attempt(&mut self, resource: &str, result: Result<()>) {
        if let Err(e) = result {
            tracing::error!("Failed to disconnect {}: {}", resource, e);
            self.failures.push((resource.to_string(), e));
        }
    }

    pub(crate) fn finish(self) -> Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(self.failures))
        }
    }
}

/// Release every connected camera, recording failures
pub(crate) fn disconnect_cameras(cameras: &mut CameraSet, teardown: &mut Teardown) {
    for (name, camera) in cameras.iter_mut() {
        if camera.is_connected() {
            teardown.attempt(&format!("camera {name}"), camera.disconnect());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::make_cameras_from_configs;

    #[test]
    fn test_join_runs_both_sides() {
        let mut left = 0;
        let mut right = 0;
        let (a, b) = join(|| {
            left += 1;
            "a"
        }, || {
            right += 2;
            "b"
        });
        assert_eq!((a, b, left, right), ("a", "b", 1, 2));
    }

    #[test]
    fn test_features_put_cameras_last() {
        let keys = [JointKey::bare(Joint::ShoulderPan), JointKey::bare(Joint::Gripper)];
        let cameras = BTreeMap::from([(
            "wrist".to_string(),
            CameraConfig {
                width: 640,
                height: 480,
                fps: 30,
            },
        )]);
        let (obs, act) = features(&keys, &cameras);
        assert_eq!(act.len(), 2);
        assert_eq!(obs.len(), 3);
        assert_eq!(obs[0].0, "shoulder_pan.pos");
        assert_eq!(
            obs[2],
            (
                "wrist".to_string(),
                FeatureType::Image {
                    height: 480,
                    width: 640,
                    channels: 3
                }
            )
        );
    }

    #[test]
    fn test_read_cameras_keyed_by_name() {
        let configs = BTreeMap::from([
            ("top".to_string(), CameraConfig { width: 4, height: 2, fps: 30 }),
            ("front".to_string(), CameraConfig { width: 2, height: 2, fps: 30 }),
        ]);
        let mut cameras = make_cameras_from_configs(&configs);
        assert!(matches!(read_cameras(&mut cameras), Err(Error::NotConnected(_))));
        connect_cameras(&mut cameras).unwrap();
        let images = read_cameras(&mut cameras).unwrap();
        assert_eq!(images.keys().collect::<Vec<_>>(), ["front", "top"]);
        assert_eq!(images["top"].shape(), (2, 4, 3));
    }

    #[test]
    fn test_teardown_aggregates() {
        let mut teardown = Teardown::default();
        teardown.attempt("left arm", Ok(()));
        teardown.attempt("right arm", Err(Error::NotConnected("right arm".into())));
        teardown.attempt("camera top", Err(Error::Unsupported("x")));
        match teardown.finish() {
            Err(Error::Teardown(failures)) => assert_eq!(failures.len(), 2),
            other => panic!("expected teardown error, got {other:?}"),
        }
    }
}
