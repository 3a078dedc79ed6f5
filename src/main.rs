use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use capture_node::config::{Mode, NodeConfig};
use capture_node::{
    Action, ActionSlot, CaptureAgent, CommandCamera, FrameError, HttpUploader, MqttSession, Offline,
    Scheduler, VERSION,
};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt,
    prelude::*,
};

/// Pause before rebuilding the node after a fatal frame fault.
const RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "capture-node", version, about = "Camera sensor node control loop")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "CAPTURE_NODE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Side of the object this camera sees.
    #[arg(long, env = "CAPTURE_NODE_SIDE")]
    side: Option<String>,

    /// Failed publish attempts before a request is abandoned.
    #[arg(long)]
    max_attempts: Option<u32>,

    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(err) = run(args) {
        error!("{err:#}");
        eprintln!("Error: {err:?}");
        process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;

    info!(
        version = VERSION,
        mode = config.node.mode.as_str(),
        side = %config.node.side,
        max_attempts = config.capture.max_attempts,
        "starting capture node"
    );

    // Supervisory boundary: a fatal frame fault rebuilds everything from scratch.
    loop {
        let fault = match config.node.mode {
            Mode::Capture => boot_capture(&config),
            Mode::Classify => boot_classify(&config),
        };
        error!(error = %fault, delay_ms = RESTART_DELAY.as_millis() as u64, "fatal fault; restarting");
        thread::sleep(RESTART_DELAY);
    }
}

fn load_config(args: &Args) -> Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => NodeConfig::default(),
    };

    if let Some(mode) = args.mode {
        config.node.mode = mode;
    }
    if let Some(side) = &args.side {
        config.node.side = side.clone();
    }
    if let Some(max_attempts) = args.max_attempts {
        config.capture.max_attempts = max_attempts;
    }

    config.validate().context("configuration rejected")?;
    Ok(config)
}

fn boot_capture(config: &NodeConfig) -> FrameError {
    let mut camera = CommandCamera::from_config(&config.capture);
    if let Err(err) = camera.init() {
        return err;
    }

    let agent = CaptureAgent::new(
        ActionSlot::new(),
        camera,
        MqttSession::new(config.session_options()),
        HttpUploader::new(config.backend_options()),
        config.publish_policy(),
    );
    let mut scheduler = Scheduler::new(agent, config.tick_interval());

    let fault = scheduler.run(|session, slot| {
        if !session.maintain() {
            return false;
        }
        for request_id in session.poll() {
            slot.trigger_publish(request_id);
        }
        true
    });
    scheduler.log_metrics();
    fault
}

fn boot_classify(config: &NodeConfig) -> FrameError {
    let mut camera = CommandCamera::from_config(&config.capture);
    if let Err(err) = camera.init() {
        return err;
    }

    let agent = CaptureAgent::new(
        ActionSlot::new(),
        camera,
        Offline,
        HttpUploader::new(config.backend_options()),
        config.publish_policy(),
    );
    let mut scheduler = Scheduler::new(agent, config.tick_interval());

    let interval = config.classify_interval();
    let mut next_due = Instant::now() + interval;
    let fault = scheduler.run(|_, slot| {
        let now = Instant::now();
        if now >= next_due {
            slot.set(Action::ClassifyRequested);
            next_due = now + interval;
        }
        true
    });
    scheduler.log_metrics();
    fault
}
