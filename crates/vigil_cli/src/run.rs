//! `vigil run`: the reference driver loop.
//!
//! Builds a [`Counter`] under an [`Agent`], starts the debug link and toggles
//! the clock for the requested number of cycles. Each cycle is advance, clock
//! low, step, advance, clock high, step.

use std::error::Error;
use std::path::PathBuf;

use tracing::info;
use vigil_agent::{Agent, ClockDriver, Counter, Location, SpoolWriter};
use vigil_config::{HarnessConfig, SpoolMode};

use crate::{GlobalArgs, RunArgs};

/// Instance name of the reference counter.
const INSTANCE: &str = "top";
const DEFAULT_CYCLES: u64 = 1000;
const DEFAULT_WIDTH: u32 = 8;

/// Loads `--config`, or `vigil.toml` from the working directory if present.
pub fn load_config(global: &GlobalArgs) -> Result<HarnessConfig, Box<dyn Error>> {
    let config = match &global.config {
        Some(path) => vigil_config::load_config_file(path)?,
        None => vigil_config::load_config(&std::env::current_dir()?)?,
    };
    Ok(config)
}

/// Runs the `vigil run` command. Returns exit code 0 once the run finishes.
pub fn run(args: &RunArgs, global: &GlobalArgs) -> Result<i32, Box<dyn Error>> {
    let config = load_config(global)?;
    let cycles = args.cycles.unwrap_or(DEFAULT_CYCLES);
    let width = args.width.unwrap_or(DEFAULT_WIDTH);
    let spool_path: PathBuf = args
        .spool
        .clone()
        .unwrap_or_else(|| config.spool.path.clone());

    let spool = match config.spool.mode {
        SpoolMode::Create => SpoolWriter::create(&spool_path, config.spool.sync)?,
        SpoolMode::Append => SpoolWriter::open_append(&spool_path, config.spool.sync)?,
    };
    let mut agent =
        Agent::with_session_config(spool, Counter::new(INSTANCE, width), &config.session)?;
    let clock_port = agent
        .find_port(&config.clock.port)
        .ok_or_else(|| format!("clock port '{}' is not a port of the design", config.clock.port))?;
    let mut clock = ClockDriver::from_frequency(clock_port, config.clock.frequency()?)?;

    if !args.no_debug {
        let mut link = config.link.clone();
        if let Some(bind) = &args.bind {
            link.bind = bind.clone();
        }
        let uri = agent.start_debugging(&link)?;
        eprintln!("Simulation started on {uri}");
    }

    info!(cycles, width, spool = %spool_path.display(), "starting reference run");
    agent.step()?;
    for cycle in 1..=cycles {
        clock.cycle(&mut agent)?;
        if args.break_at_cycle == Some(cycle) {
            agent.breakpoint(Location::new(format!("cycle {cycle}")))?;
        }
    }
    agent.finish()?;

    if !global.quiet {
        eprintln!(
            "    Finished {cycles} cycles at {} ({} steps)",
            agent.time(),
            agent.steps()
        );
        eprintln!("    Spool {}", spool_path.display());
    }
    Ok(0)
}
