// 30 Hz control loop with watchdog
// Note: the watchdog stops commanding the arms when the policy goes quiet.
// Motors keep their last goal, so a stale command stream means "hold position"
// rather than replaying an old target forever.

use serde::Serialize;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::time::interval;
use zenoh::pubsub::Publisher;
use tracing::{debug, error, info, warn};

use crate::config::{CMD_TIMEOUT, LOOP_HZ, TOPIC_CMD_ACTION, TOPIC_HEALTH, TOPIC_OBSERVATION, TOPIC_RT_ACTION};
use crate::error::{Error, Result};
use crate::messages::{Action, JointState, Observation, RuntimeHealth};
use crate::robot::Robot;
use crate::teleop::Teleoperator;

pub struct Runtime {
    latest_action: Option<Action>,
    cmd_received_at: Instant,
    health: RuntimeHealth,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            latest_action: None,
            cmd_received_at: Instant::now(),
            health: RuntimeHealth::CmdStale, // Start stale until first cmd
        }
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    /// Process incoming command
    pub fn on_command(&mut self, action: Action) {
        self.on_command_at(action, Instant::now());
    }

    fn on_command_at(&mut self, action: Action, now: Instant) {
        debug!("Received action with {} keys", action.len());
        self.latest_action = Some(action);
        self.cmd_received_at = now;
    }

    /// Action to apply this tick, or `None` to hold position
    pub fn next_action(&mut self) -> Option<Action> {
        self.next_action_at(Instant::now())
    }

    fn next_action_at(&mut self, now: Instant) -> Option<Action> {
        let cmd_age = now.saturating_duration_since(self.cmd_received_at);

        if cmd_age > CMD_TIMEOUT {
            // Watchdog triggered - hold position
            if self.health == RuntimeHealth::Ok {
                warn!("Command stale ({:?} old), holding position", cmd_age);
            }
            self.health = RuntimeHealth::CmdStale;
            None
        } else if let Some(ref action) = self.latest_action {
            if self.health == RuntimeHealth::CmdStale {
                info!("Commands resumed");
            }
            self.health = RuntimeHealth::Ok;
            Some(action.clone())
        } else {
            // No command ever received
            self.health = RuntimeHealth::CmdStale;
            None
        }
    }

    /// A control step failed; nothing more will be commanded
    pub fn fault(&mut self) {
        self.health = RuntimeHealth::Fault;
        self.latest_action = None;
    }
}

fn transport(e: impl std::fmt::Display) -> Error {
    Error::Transport(e.to_string())
}

fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Run blocking device I/O off the async executor
///
/// The device is moved into the blocking task and handed back alongside the
/// result, so it survives a failed call.
pub async fn on_blocking<D, T, F>(mut device: D, f: F) -> Result<(D, Result<T>)>
where
    D: Send + 'static,
    T: Send + 'static,
    F: FnOnce(&mut D) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = f(&mut device);
        (device, result)
    })
    .await
    .map_err(|e| transport(format!("blocking task failed: {e}")))
}

async fn publish<T: Serialize>(publisher: &Publisher<'_>, value: &T) -> Result<()> {
    let json = serde_json::to_string(value)?;
    publisher.put(json).await.map_err(transport)
}

fn joint_state(observation: &Observation) -> JointState {
    JointState {
        positions: observation.joint_map(),
        timestamp_ms: timestamp_ms(),
    }
}

/// Release the robot, keeping the first error
async fn shutdown(robot: Box<dyn Robot>, outcome: Result<()>) -> Result<()> {
    let (_robot, released) = on_blocking(robot, |r| r.disconnect()).await?;
    if let Err(e) = &released {
        error!("Disconnect failed: {}", e);
    }
    outcome.and(released)
}

async fn release_teleop(teleop: Box<dyn Teleoperator>) {
    match on_blocking(teleop, |t| t.disconnect()).await {
        Ok((_, Ok(()))) => {}
        Ok((_, Err(e))) | Err(e) => warn!("Leader disconnect failed: {}", e),
    }
}

/// Serve `robot` to a policy over zenoh until Ctrl-C or a failed step
pub async fn run(robot: Box<dyn Robot>) -> Result<()> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await.map_err(transport)?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD_ACTION).await.map_err(transport)?;
    let pub_action = session.declare_publisher(TOPIC_RT_ACTION).await.map_err(transport)?;
    let pub_observation = session.declare_publisher(TOPIC_OBSERVATION).await.map_err(transport)?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await.map_err(transport)?;

    let (mut robot, connected) = on_blocking(robot, |r| r.connect(true)).await?;
    if let Err(e) = connected {
        error!("Connect failed: {}", e);
        return shutdown(robot, Err(e)).await;
    }

    let mut runtime = Runtime::new();
    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!(
        "Runtime started: {}Hz loop, {}ms watchdog timeout",
        LOOP_HZ,
        CMD_TIMEOUT.as_millis()
    );
    info!("Subscribed to: {}", TOPIC_CMD_ACTION);
    info!("Publishing to: {}, {}, {}", TOPIC_RT_ACTION, TOPIC_OBSERVATION, TOPIC_HEALTH);

    let outcome = loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = &mut ctrl_c => {
                info!("Ctrl-C received, stopping");
                break Ok(());
            }
        }

        // 1. Drain all pending commands (non-blocking), keep latest
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<Action>(&payload) {
                Ok(action) => runtime.on_command(action),
                Err(e) => warn!("Failed to parse action: {}", e),
            }
        }

        // 2. Watchdog decides whether to command this tick
        let command = runtime.next_action();

        // 3. Apply and observe
        let (r, step) = on_blocking(robot, move |robot| {
            let applied = command.map(|action| robot.send_action(&action)).transpose()?;
            let observation = robot.get_observation()?;
            Ok((applied, observation))
        })
        .await?;
        robot = r;

        let (applied, observation) = match step {
            Ok(step) => step,
            Err(e) => {
                error!("Control step failed: {}", e);
                runtime.fault();
                if let Err(publish_err) = publish(&pub_health, &runtime.health()).await {
                    warn!("Failed to publish fault: {}", publish_err);
                }
                break Err(e);
            }
        };

        // 4. Publish applied action, joint state and health
        let published: Result<()> = async {
            if let Some(applied) = &applied {
                publish(&pub_action, applied).await?;
            }
            publish(&pub_observation, &joint_state(&observation)).await?;
            publish(&pub_health, &runtime.health()).await
        }
        .await;
        if let Err(e) = published {
            error!("Publishing failed: {}", e);
            break Err(e);
        }
    };

    shutdown(robot, outcome).await
}

/// Mirror `teleop` onto `robot` every tick until Ctrl-C or a failed step
///
/// Applied actions are published so recorders can follow along.
pub async fn teleoperate(robot: Box<dyn Robot>, teleop: Box<dyn Teleoperator>) -> Result<()> {
    let session = zenoh::open(zenoh::Config::default()).await.map_err(transport)?;
    let pub_action = session.declare_publisher(TOPIC_RT_ACTION).await.map_err(transport)?;

    let (mut devices, connected) = on_blocking((robot, teleop), |(robot, teleop)| {
        teleop.connect(true)?;
        robot.connect(true)
    })
    .await?;
    if let Err(e) = connected {
        error!("Connect failed: {}", e);
        let (robot, teleop) = devices;
        release_teleop(teleop).await;
        return shutdown(robot, Err(e)).await;
    }

    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    info!("Teleoperation started at {}Hz", LOOP_HZ);

    let outcome = loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = &mut ctrl_c => {
                info!("Ctrl-C received, stopping");
                break Ok(());
            }
        }

        let start = Instant::now();
        let (d, step) = on_blocking(devices, |(robot, teleop)| {
            let action = teleop.get_action()?;
            robot.send_action(&action)
        })
        .await?;
        devices = d;

        match step {
            Ok(applied) => {
                debug!("Teleop step: {:.1}ms", start.elapsed().as_secs_f64() * 1e3);
                if let Err(e) = publish(&pub_action, &applied).await {
                    warn!("Failed to publish applied action: {}", e);
                }
            }
            Err(e) => {
                error!("Teleop step failed: {}", e);
                break Err(e);
            }
        }
    };

    let (robot, teleop) = devices;
    release_teleop(teleop).await;
    shutdown(robot, outcome).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(value: f32) -> Action {
        Action::from([("left_gripper.pos".to_string(), value)])
    }

    #[test]
    fn test_starts_stale() {
        let mut runtime = Runtime::new();
        assert_eq!(runtime.next_action(), None);
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);
    }

    #[test]
    fn test_fresh_command_is_applied_then_expires() {
        let mut runtime = Runtime::new();
        let t0 = Instant::now();
        runtime.on_command_at(action(5.0), t0);
        assert_eq!(runtime.next_action_at(t0 + Duration::from_millis(10)), Some(action(5.0)));
        assert_eq!(runtime.health(), RuntimeHealth::Ok);

        assert_eq!(runtime.next_action_at(t0 + CMD_TIMEOUT + Duration::from_millis(1)), None);
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);

        // A new command revives the loop
        let t1 = t0 + Duration::from_secs(1);
        runtime.on_command_at(action(7.0), t1);
        assert_eq!(runtime.next_action_at(t1), Some(action(7.0)));
    }

    #[test]
    fn test_fault_drops_pending_command() {
        let mut runtime = Runtime::new();
        runtime.on_command(action(1.0));
        runtime.fault();
        assert_eq!(runtime.health(), RuntimeHealth::Fault);
        assert_eq!(runtime.next_action(), None);
    }

    #[tokio::test]
    async fn test_on_blocking_hands_device_back_on_error() {
        let (device, result) = on_blocking(41u32, |d| {
            *d += 1;
            Err::<(), _>(Error::Unsupported("test"))
        })
        .await
        .unwrap();
        assert_eq!(device, 42);
        assert!(result.is_err());
    }
}
