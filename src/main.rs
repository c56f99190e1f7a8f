mod datasource;
mod error;
mod model;
mod utils;

use std::{
    io,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{error, info, warn};

use crate::{
    datasource::{
        config_parser::{Config, config_read},
        control_signal::{FileControlChannel, write_signal},
        file_path::*,
        telemetry::NvidiaSmi,
    },
    model::{
        dashboard::DashboardRenderer,
        device::Mode,
        load_worker::{LoadJob, run_worker},
        scheduler::{Scheduler, run},
        worker::ProcessLauncher,
    },
    utils::{
        constants::{AUTHOR, NOTES, VERSION, exit_code},
        log_monitor::monitor_log_level,
        logger::init_logger,
    },
};

#[derive(Parser)]
#[command(name = "gpu-keepalive", version, about = NOTES)]
struct Cli {
    /// Config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch all GPUs and keep idle ones busy (default)
    Monitor(MonitorArgs),

    /// Run the load command on one GPU (spawned by the monitor)
    Worker {
        /// Target GPU index
        #[arg(long)]
        gpu_id: u32,

        /// Load duration in minutes, unbounded if omitted
        #[arg(long, conflicts_with = "seconds")]
        minutes: Option<u64>,

        /// Load duration in seconds, unbounded if omitted
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Ask a running monitor to switch a GPU's mode
    Signal {
        #[arg(value_enum)]
        mode: SignalMode,

        /// Target GPU index
        gpu_id: u32,
    },
}

#[derive(Args, Default)]
struct MonitorArgs {
    /// Telemetry poll interval (seconds)
    #[arg(long)]
    poll_sec: Option<u64>,

    /// Idle threshold before falling back to inject mode (minutes)
    #[arg(long)]
    idle_min: Option<u64>,

    /// Shorter idle threshold for the first fallback only (minutes, 0 disables)
    #[arg(long)]
    first_idle_min: Option<u64>,

    /// Worker time budget (minutes, 0 means unbounded)
    #[arg(long)]
    minutes: Option<u64>,

    /// Start every GPU in watch mode instead of inject mode
    #[arg(long)]
    watch: bool,

    /// Control marker directory
    #[arg(long)]
    control_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum SignalMode {
    Watch,
    Inject,
}

impl From<SignalMode> for Mode {
    fn from(mode: SignalMode) -> Self {
        match mode {
            SignalMode::Watch => Mode::Watch,
            SignalMode::Inject => Mode::Inject,
        }
    }
}

impl MonitorArgs {
    fn apply(&self, config: &mut Config) {
        let m = &mut config.monitor;
        if let Some(poll) = self.poll_sec {
            m.poll_interval_sec = poll;
        }
        if let Some(idle) = self.idle_min {
            m.idle_threshold_sec = idle.saturating_mul(60);
        }
        if let Some(first) = self.first_idle_min {
            m.first_idle_threshold_sec = Some(first.saturating_mul(60));
        }
        if let Some(minutes) = self.minutes {
            m.worker_duration_sec = Some(minutes.saturating_mul(60));
        }
        if self.watch {
            m.initial_mode = Mode::Watch;
        }
        if let Some(dir) = &self.control_dir {
            m.control_dir = dir.clone();
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    Ok(config_read(path)?)
}

fn setup_logging(config: &Config) -> Result<()> {
    init_logger(
        &config.log.level_file,
        config.log.file.as_deref(),
        config.log.max_size_mb,
    )
}

fn install_interrupt_handler() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set interrupt handler")?;
    Ok(running)
}

fn run_monitor(config_path: Option<PathBuf>, config: Config) -> Result<ExitCode> {
    info!("{NOTES}");
    info!("{AUTHOR}");
    info!("{VERSION}");

    let monitor = config.monitor.clone();
    info!(
        "Monitor start poll={}s idle={}s first_idle={} worker={}",
        monitor.poll_interval_sec,
        monitor.idle_threshold_sec,
        monitor
            .first_idle_threshold()
            .map(|d| format!("{}s", d.as_secs()))
            .unwrap_or_else(|| "off".to_string()),
        monitor
            .worker_duration()
            .map(|d| format!("{}s", d.as_secs()))
            .unwrap_or_else(|| "unbounded".to_string())
    );

    let level_file = config.log.level_file.clone();
    thread::Builder::new()
        .name(LOG_LEVEL_THREAD.to_string())
        .spawn(move || {
            if let Err(e) = monitor_log_level(level_file) {
                warn!("Log level monitor error: {e}");
            }
        })
        .context("Failed to spawn log level monitor")?;

    let running = install_interrupt_handler()?;

    let control = FileControlChannel::new(&monitor.control_dir)?;
    info!(
        "Control dir: {} (touch {}<id> / {}<id>)",
        control.dir().display(),
        WATCH_MARKER_PREFIX,
        INJECT_MARKER_PREFIX
    );

    let telemetry = NvidiaSmi::new(config.telemetry.command.clone(), config.telemetry.timeout());
    let launcher = ProcessLauncher::current_exe(config_path)?;

    let mut scheduler = match Scheduler::discover(telemetry, launcher, control, &monitor) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            error!("{e}");
            return Ok(ExitCode::from(exit_code::NO_DEVICES));
        }
    };

    info!("{MAIN_THREAD} Start");

    let mut renderer = DashboardRenderer::for_stdout();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    run(&mut scheduler, &monitor, &running, &mut renderer, &mut out);

    info!("Stopped");
    Ok(ExitCode::SUCCESS)
}

fn run_worker_command(config: &Config, gpu_id: u32, duration: Option<Duration>) -> Result<ExitCode> {
    let running = install_interrupt_handler()?;
    let mut telemetry =
        NvidiaSmi::new(config.telemetry.command.clone(), config.telemetry.timeout());
    let job = LoadJob {
        gpu_id,
        command: &config.worker.command,
        process_name: &config.worker.process_name,
        duration,
        stop_grace: config.monitor.stop_grace(),
    };
    Ok(ExitCode::from(run_worker(&job, &mut telemetry, &running)))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(|| PathBuf::from(CONFIG_FILE));

    let mut config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let command = cli
        .command
        .unwrap_or(Commands::Monitor(MonitorArgs::default()));

    if let Commands::Monitor(args) = &command {
        args.apply(&mut config);
        if let Err(e) = config.validate_monitor() {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    }

    if let Err(e) = setup_logging(&config) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    let result = match command {
        Commands::Monitor(_) => run_monitor(cli.config, config),
        Commands::Worker {
            gpu_id,
            minutes,
            seconds,
        } => {
            let duration = seconds
                .or(minutes.map(|m| m.saturating_mul(60)))
                .filter(|&s| s > 0)
                .map(Duration::from_secs);
            run_worker_command(&config, gpu_id, duration)
        }
        Commands::Signal { mode, gpu_id } => {
            write_signal(&config.monitor.control_dir, mode.into(), gpu_id)
                .map(|_| ExitCode::SUCCESS)
                .map_err(anyhow::Error::from)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
