//! Vigil CLI: runs the reference counter under the debug harness and works
//! with recorded spools.
//!
//! `vigil run` drives the counter and serves debug clients, `vigil replay`
//! prints recorded transitions, and `vigil export` writes a VCD file.

#![warn(missing_docs)]

mod replay;
mod run;

use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Vigil: live debugging and trace capture for cycle-driven simulation.
#[derive(Parser, Debug)]
#[command(name = "vigil", version, about = "Vigil simulation debug harness")]
pub struct Cli {
    /// Suppress all output except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Enable verbose (debug-level) output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a `vigil.toml` configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// The subcommand to run. Defaults to `run`.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the reference counter with the debug link enabled.
    Run(RunArgs),
    /// Print the transitions recorded in a spool.
    Replay(ReplayArgs),
    /// Convert a spool into a VCD waveform.
    Export(ExportArgs),
}

/// Arguments for `vigil run`. Unset options fall back to the configuration.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Number of clock cycles to simulate.
    #[arg(long)]
    pub cycles: Option<u64>,

    /// Address for the debug link, e.g. `127.0.0.1:0`.
    #[arg(long)]
    pub bind: Option<String>,

    /// Spool file to record into.
    #[arg(long)]
    pub spool: Option<PathBuf>,

    /// Width of the counter in bits.
    #[arg(long)]
    pub width: Option<u32>,

    /// Pause at the end of this cycle until a debugger resumes.
    #[arg(long)]
    pub break_at_cycle: Option<u64>,

    /// Record only; do not start the debug link.
    #[arg(long)]
    pub no_debug: bool,
}

/// Arguments for `vigil replay`.
#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Spool file to read.
    pub spool: PathBuf,

    /// Start of the range, inclusive (`"4ns"` or wire form).
    #[arg(long)]
    pub from: Option<String>,

    /// End of the range, exclusive.
    #[arg(long)]
    pub to: Option<String>,

    /// Only print these ports.
    #[arg(long = "port")]
    pub ports: Vec<String>,
}

/// Arguments for `vigil export`.
#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Spool file to read.
    pub spool: PathBuf,

    /// Output VCD path.
    #[arg(short, long)]
    pub output: PathBuf,
}

/// Global settings derived from CLI flags.
pub struct GlobalArgs {
    /// Whether to suppress non-error output.
    pub quiet: bool,
    /// Whether to print debug-level logs.
    pub verbose: bool,
    /// Optional path to a configuration file.
    pub config: Option<PathBuf>,
}

fn init_logging(global: &GlobalArgs) {
    let level = if global.quiet {
        "error"
    } else if global.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() {
    let cli = Cli::parse();
    let global = GlobalArgs {
        quiet: cli.quiet,
        verbose: cli.verbose,
        config: cli.config,
    };
    init_logging(&global);

    let command = cli.command.unwrap_or(Command::Run(RunArgs::default()));
    let result = match command {
        Command::Run(ref args) => run::run(args, &global),
        Command::Replay(ref args) => replay::replay(args, &global),
        Command::Export(ref args) => replay::export(args, &global),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_arguments_means_run() {
        let cli = Cli::parse_from(["vigil"]);
        assert!(cli.command.is_none());
        assert!(!cli.quiet);
        assert!(cli.config.is_none());
    }

    #[test]
    fn parse_run_with_args() {
        let cli = Cli::parse_from([
            "vigil",
            "run",
            "--cycles",
            "20",
            "--bind",
            "127.0.0.1:0",
            "--spool",
            "out/run.spool",
            "--width",
            "4",
            "--break-at-cycle",
            "3",
        ]);
        match cli.command {
            Some(Command::Run(ref args)) => {
                assert_eq!(args.cycles, Some(20));
                assert_eq!(args.bind.as_deref(), Some("127.0.0.1:0"));
                assert_eq!(args.spool, Some(PathBuf::from("out/run.spool")));
                assert_eq!(args.width, Some(4));
                assert_eq!(args.break_at_cycle, Some(3));
                assert!(!args.no_debug);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn parse_replay_ports() {
        let cli = Cli::parse_from([
            "vigil",
            "replay",
            "run.spool",
            "--from",
            "2ns",
            "--port",
            "top.count",
            "--port",
            "top.carry",
        ]);
        match cli.command {
            Some(Command::Replay(ref args)) => {
                assert_eq!(args.spool, PathBuf::from("run.spool"));
                assert_eq!(args.from.as_deref(), Some("2ns"));
                assert!(args.to.is_none());
                assert_eq!(args.ports, vec!["top.count", "top.carry"]);
            }
            _ => panic!("expected Replay command"),
        }
    }

    #[test]
    fn parse_export() {
        let cli = Cli::parse_from(["vigil", "export", "run.spool", "-o", "run.vcd"]);
        match cli.command {
            Some(Command::Export(ref args)) => {
                assert_eq!(args.output, PathBuf::from("run.vcd"));
            }
            _ => panic!("expected Export command"),
        }
    }

    #[test]
    fn parse_global_flags() {
        let cli = Cli::parse_from(["vigil", "--verbose", "--config", "/etc/vigil.toml", "run"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/vigil.toml")));
    }

    #[test]
    fn quiet_and_verbose_conflict() {
        assert!(Cli::try_parse_from(["vigil", "-q", "-v"]).is_err());
    }

    #[test]
    fn export_requires_output() {
        let err = Cli::try_parse_from(["vigil", "export", "run.spool"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
