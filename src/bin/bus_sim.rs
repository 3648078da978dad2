use std::io::IsTerminal;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use bus_contention::config::{DEFAULT_ATTEMPTS, DEFAULT_DEVICES, DEFAULT_TMAX, DEFAULT_TMIN};
use bus_contention::shutdown;
use bus_contention::{
    ConfigError, Runtime, Shutdown, Simulation, SimulationConfig, SimulationError,
};

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_INTERRUPTED: u8 = shutdown::EXIT_INTERRUPTED as u8;

#[derive(Parser)]
#[command(author, version, about = "Simulate devices contending for a shared bus")]
struct Args {
    /// Number of devices contending for the bus
    #[arg(short, long, default_value_t = DEFAULT_DEVICES)]
    devices: usize,

    /// Acquire/hold/release cycles per device
    #[arg(short, long, default_value_t = DEFAULT_ATTEMPTS)]
    attempts: u32,

    /// Shortest time a device holds the bus, in seconds
    #[arg(long, default_value_t = DEFAULT_TMIN, allow_negative_numbers = true)]
    tmin: f64,

    /// Longest time a device holds the bus, in seconds
    #[arg(long, default_value_t = DEFAULT_TMAX, allow_negative_numbers = true)]
    tmax: f64,

    /// Give up on the bus after waiting this many seconds
    #[arg(long, value_name = "SECS", allow_negative_numbers = true)]
    acquire_timeout: Option<f64>,

    /// Seed for reproducible think and hold durations
    #[arg(long)]
    seed: Option<u64>,

    /// How devices are scheduled
    #[arg(long, value_enum, default_value_t = Runtime::Threads)]
    runtime: Runtime,

    /// Log phase changes too
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn config(&self) -> SimulationConfig {
        SimulationConfig {
            devices: self.devices,
            attempts: self.attempts,
            tmin: self.tmin,
            tmax: self.tmax,
            acquire_timeout: self.acquire_timeout,
            seed: self.seed,
            runtime: self.runtime,
            ..Default::default()
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    setup_logging(args.verbose);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let simulation = Simulation::new(&args.config())?;

    let shutdown = Shutdown::new();
    shutdown
        .register_signals()
        .context("failed to install signal handlers")?;

    info!(pid = %nix::unistd::getpid(), "bus simulator starting");
    let report = simulation.with_shutdown(shutdown).run()?;

    for worker in &report.workers {
        info!(
            device = %worker.device,
            completed = worker.completed,
            waited = ?worker.waited,
            held = ?worker.held,
            "device summary"
        );
    }
    info!(elapsed = ?report.elapsed, "simulation complete");
    Ok(())
}

fn exit_code(e: &anyhow::Error) -> u8 {
    if e.downcast_ref::<ConfigError>().is_some() {
        return EXIT_CONFIG;
    }
    match e.downcast_ref::<SimulationError>() {
        Some(SimulationError::Config(_)) => EXIT_CONFIG,
        Some(SimulationError::Interrupted) => EXIT_INTERRUPTED,
        _ => EXIT_FAILURE,
    }
}

fn setup_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(std::io::stdout().is_terminal())
                .with_thread_names(true),
        )
        .init();
}
