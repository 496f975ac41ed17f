use clap::{ArgAction, Parser, Subcommand};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use so100_bimanual::calibration::Operator;
use so100_bimanual::config::AppConfig;
use so100_bimanual::factory::{make_robot, make_teleoperator};
use so100_bimanual::robot::Robot;
use so100_bimanual::runtime::{self, on_blocking};
use so100_bimanual::teleop::Teleoperator;
use so100_bimanual::{Error, Result};

#[derive(Parser, Debug)]
#[command(name = "so100-bimanual", version, about = "Bimanual SO-100 control runtime")]
struct Cli {
    /// JSON configuration file (default: bimanual follower on /dev/ttyACM0 + /dev/ttyACM1)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use in-memory motor buses instead of serial ports
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the robot to a policy over zenoh
    Run,
    /// Drive the follower from the leader arms
    Teleoperate,
    /// Run the interactive calibration and save it
    Calibrate {
        /// Calibrate the leader arms instead of the robot
        #[arg(long, action = ArgAction::SetTrue)]
        teleop: bool,
    },
    /// Assign motor IDs, one motor plugged in at a time
    SetupMotors {
        #[arg(long, action = ArgAction::SetTrue)]
        teleop: bool,
    },
    /// Connect, print one observation and disconnect
    Observe,
}

/// Operator prompts on the terminal; Enter confirms and stops recording
#[derive(Debug, Default)]
struct ConsoleOperator {
    raw: bool,
}

impl ConsoleOperator {
    fn set_raw(&mut self, raw: bool) -> Result<()> {
        if raw != self.raw {
            if raw {
                enable_raw_mode()?;
            } else {
                disable_raw_mode()?;
            }
            self.raw = raw;
        }
        Ok(())
    }

    fn enter_pressed(timeout: Duration) -> Result<bool> {
        if event::poll(timeout)? {
            if let Event::Key(KeyEvent {
                code: KeyCode::Enter,
                kind: KeyEventKind::Press,
                ..
            }) = event::read()?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Operator for ConsoleOperator {
    fn wait_for_confirm(&mut self, message: &str) -> Result<()> {
        self.set_raw(false)?;
        println!("{message} (press ENTER)");
        self.set_raw(true)?;
        while !Self::enter_pressed(Duration::from_millis(100))? {}
        self.set_raw(false)
    }

    fn stop_requested(&mut self) -> Result<bool> {
        self.set_raw(true)?;
        // Also paces range sampling at roughly 50 Hz
        let stop = Self::enter_pressed(Duration::from_millis(20))?;
        if stop {
            self.set_raw(false)?;
        }
        Ok(stop)
    }
}

impl Drop for ConsoleOperator {
    fn drop(&mut self) {
        if self.raw {
            let _ = disable_raw_mode();
        }
    }
}

fn operator() -> Box<dyn Operator> {
    Box::new(ConsoleOperator::default())
}

fn teleoperator(config: &AppConfig, mock: bool) -> Result<Box<dyn Teleoperator>> {
    let teleop = config
        .teleop
        .as_ref()
        .ok_or_else(|| Error::InvalidConfiguration("no `teleop` section in the configuration".into()))?;
    make_teleoperator(teleop, operator(), mock)
}

async fn calibrate(config: &AppConfig, mock: bool, teleop: bool) -> Result<()> {
    if teleop {
        let device = teleoperator(config, mock)?;
        let (_, result) = on_blocking(device, |t| {
            t.connect(false)?;
            let calibrated = t.calibrate();
            t.disconnect().and(calibrated)
        })
        .await?;
        return result;
    }
    let robot = make_robot(&config.robot, operator(), mock)?;
    let (_, result) = on_blocking(robot, |r| {
        r.connect(false)?;
        let calibrated = r.calibrate();
        r.disconnect().and(calibrated)
    })
    .await?;
    result
}

async fn setup_motors(config: &AppConfig, mock: bool, teleop: bool) -> Result<()> {
    if teleop {
        let device = teleoperator(config, mock)?;
        let (_, result) = on_blocking(device, |t| t.setup_motors()).await?;
        return result;
    }
    let robot = make_robot(&config.robot, operator(), mock)?;
    let (_, result) = on_blocking(robot, |r| r.setup_motors()).await?;
    result
}

async fn observe(config: &AppConfig, mock: bool) -> Result<()> {
    let robot: Box<dyn Robot> = make_robot(&config.robot, operator(), mock)?;
    let (_, result) = on_blocking(robot, |r| {
        r.connect(true)?;
        let observation = r.get_observation();
        r.disconnect()?;
        observation
    })
    .await?;
    let observation = result?;
    println!("{}", serde_json::to_string_pretty(&observation.joint_map())?);
    for (name, image) in &observation.images {
        info!("Camera {}: {:?}", name, image.shape());
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Run => runtime::run(make_robot(&config.robot, operator(), cli.mock)?).await,
        Commands::Teleoperate => {
            let teleop = teleoperator(&config, cli.mock)?;
            let robot = make_robot(&config.robot, operator(), cli.mock)?;
            runtime::teleoperate(robot, teleop).await
        }
        Commands::Calibrate { teleop } => calibrate(&config, cli.mock, teleop).await,
        Commands::SetupMotors { teleop } => setup_motors(&config, cli.mock, teleop).await,
        Commands::Observe => observe(&config, cli.mock).await,
    }
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
