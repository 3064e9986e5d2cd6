use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use clap::{Args, Parser, Subcommand};

use crate::config::Scenario;
use crate::monitor::{Monitor, MonitorEnd};
use crate::prelude::*;
use crate::{report, terminator};

#[derive(Parser, Debug)]
#[command(version, about = "Launch, monitor and judge multi-process test scenarios")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch the processes of a scenario, monitor them to completion,
    /// and report each one's verdict
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the scenario file (JSON)
    pub scenario: PathBuf,

    /// Directory receiving per-process logs and collected dumps
    #[arg(long, env = "LOADTEST_LOG_DIR", default_value = "results")]
    pub log_dir: PathBuf,

    /// Do not echo child output while monitoring
    #[arg(long)]
    pub no_echo: bool,

    /// Override the scenario's heartbeat period, e.g. "30s"
    #[arg(long)]
    pub heartbeat: Option<String>,
}

/// Exit code of the whole run: 0 iff every handle passed its
/// expectation.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_scenario(args),
    }
}

fn run_scenario(args: RunArgs) -> Result<i32> {
    let scenario = Scenario::load(&args.scenario)?;
    fs::create_dir_all(&args.log_dir)
        .with_context(|| format!("failed to create log directory {}", args.log_dir.display()))?;

    let mut settings = scenario.monitor_settings()?;
    if args.no_echo {
        settings.echo = false;
    }
    if let Some(heartbeat) = &args.heartbeat {
        settings.heartbeat_period = humantime::parse_duration(heartbeat)
            .with_context(|| format!("invalid heartbeat period `{heartbeat}`"))?;
    }

    let mut handles = scenario.build_handles(&args.log_dir)?;
    let monitor = Monitor::new(scenario.platform()?, settings);

    // Launch everything up front; a launch failure is fatal for the run.
    let mut launch_failed = false;
    for handle in handles.iter_mut() {
        if let Err(err) = handle.launch() {
            error!("{err:#}");
            launch_failed = true;
            break;
        }
        info!("{}: started {}", handle.uid, handle.command_line());
    }

    if !launch_failed {
        let cancel = AtomicBool::new(false);
        match monitor.run(&mut handles, &cancel)? {
            MonitorEnd::AllCompleted => info!("all monitored processes completed"),
            MonitorEnd::Fatal { uid } => warn!("monitoring stopped early: {uid} is doomed"),
            MonitorEnd::Cancelled => warn!("monitoring was cancelled"),
        }
    }

    // Judge before cleaning up: a process expected to never end must be
    // seen still running, not killed.
    let all_passed = report::emit_report(&handles);

    for handle in handles.iter_mut() {
        if handle.is_running() {
            terminator::terminate(handle, monitor.platform(), monitor.settings().echo)?;
        }
    }

    Ok(if all_passed { 0 } else { 1 })
}
