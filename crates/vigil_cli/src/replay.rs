//! `vigil replay` and `vigil export`: offline views of a recorded spool.

use std::collections::BTreeSet;
use std::error::Error;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use tracing::warn;
use vigil_agent::{export_vcd, replay as replay_spool, SimTime, SpoolError, SpoolReader};

use crate::{ExportArgs, GlobalArgs, ReplayArgs};

/// Counts from one [`print_transitions`] call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Transitions printed after filtering.
    pub printed: u64,
    /// Offset of a torn trailing record, if one was reached.
    pub corrupt_tail: Option<u64>,
}

/// Runs the `vigil replay` command.
pub fn replay(args: &ReplayArgs, global: &GlobalArgs) -> Result<i32, Box<dyn Error>> {
    let from = parse_bound(args.from.as_deref(), SimTime::ZERO)?;
    let to = parse_bound(args.to.as_deref(), SimTime::MAX)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let stats = print_transitions(&args.spool, from, to, &args.ports, &mut out)?;
    out.flush()?;
    if let Some(offset) = stats.corrupt_tail {
        eprintln!("warning: spool ends with a torn record at byte {offset}");
    }
    if !global.quiet {
        eprintln!("    {} transitions", stats.printed);
    }
    Ok(0)
}

/// Writes one line per transition in `[from, to)`, optionally filtered by
/// port name.
pub fn print_transitions(
    spool: &Path,
    from: SimTime,
    to: SimTime,
    ports: &[String],
    out: &mut impl Write,
) -> Result<ReplayStats, Box<dyn Error>> {
    let wanted: BTreeSet<&str> = ports.iter().map(String::as_str).collect();
    let mut iter = replay_spool(spool, from, to).iter()?;
    let mut stats = ReplayStats::default();
    while let Some(next) = iter.next() {
        let t = match next {
            Ok(t) => t,
            Err(SpoolError::CorruptTrailingRecord { offset }) => {
                warn!(offset, "replay stopped at a torn record");
                stats.corrupt_tail = Some(offset);
                break;
            }
            Err(e) => return Err(e.into()),
        };
        let name = iter
            .ports()
            .get(t.port.index())
            .map_or("?", |p| p.name.as_str());
        if !wanted.is_empty() && !wanted.contains(name) {
            continue;
        }
        writeln!(out, "{:>16}  {:<24} {} -> {}", t.time, name, t.before, t.after)?;
        stats.printed += 1;
    }

    let declared: BTreeSet<&str> = iter.ports().iter().map(|p| p.name.as_str()).collect();
    if let Some(missing) = wanted.iter().find(|name| !declared.contains(*name)) {
        return Err(format!("port '{missing}' is not declared in {}", spool.display()).into());
    }
    Ok(stats)
}

/// Runs the `vigil export` command.
pub fn export(args: &ExportArgs, global: &GlobalArgs) -> Result<i32, Box<dyn Error>> {
    let reader = SpoolReader::open(&args.spool)?;
    let out = BufWriter::new(File::create(&args.output)?);
    let summary = export_vcd(reader, out)?;
    if let Some(offset) = summary.corrupt_tail {
        eprintln!("warning: spool ends with a torn record at byte {offset}");
    }
    if !global.quiet {
        let end = summary
            .end_time
            .map_or_else(|| "-".to_string(), |t| t.to_string());
        eprintln!(
            "    Exported {} ports, {} changes (until {end}) to {}",
            summary.ports,
            summary.changes,
            args.output.display()
        );
    }
    Ok(0)
}

fn parse_bound(text: Option<&str>, default: SimTime) -> Result<SimTime, Box<dyn Error>> {
    match text {
        Some(text) => Ok(text.parse::<SimTime>()?),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use vigil_agent::{Agent, ClockDriver, Counter, SpoolWriter};
    use vigil_config::SyncPolicy;

    fn quiet() -> GlobalArgs {
        GlobalArgs {
            quiet: true,
            verbose: false,
            config: None,
        }
    }

    fn record(dir: &tempfile::TempDir, cycles: u64) -> PathBuf {
        let path = dir.path().join("counter.spool");
        let spool = SpoolWriter::create(&path, SyncPolicy::Buffered).unwrap();
        let mut agent = Agent::new(spool, Counter::new("top", 4)).unwrap();
        let mut clock =
            ClockDriver::new(Counter::CLK, vigil_agent::SimDuration::from_ns(1)).unwrap();
        agent.step().unwrap();
        clock.cycles(&mut agent, cycles).unwrap();
        agent.finish().unwrap();
        path
    }

    #[test]
    fn prints_filtered_window() {
        let dir = tempfile::tempdir().unwrap();
        let spool = record(&dir, 5);
        let mut out = Vec::new();
        let stats = print_transitions(
            &spool,
            SimTime::from_ns(2),
            SimTime::from_ns(6),
            &["top.count".to_string()],
            &mut out,
        )
        .unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        // count changes on the rising edges at 2 ns and 4 ns.
        assert_eq!(stats.printed, 2);
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.contains("top.count")));
        assert!(lines[0].ends_with("0000 -> 0001"));
        assert!(lines[1].ends_with("0001 -> 0010"));
        assert_eq!(stats.corrupt_tail, None);
    }

    #[test]
    fn unknown_port_filter_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let spool = record(&dir, 1);
        let err = print_transitions(
            &spool,
            SimTime::ZERO,
            SimTime::MAX,
            &["top.bogus".to_string()],
            &mut Vec::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("top.bogus"));
    }

    #[test]
    fn torn_tail_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let spool = record(&dir, 3);
        let file = std::fs::OpenOptions::new().write(true).open(&spool).unwrap();
        let len = file.metadata().unwrap().len();
        file.set_len(len - 2).unwrap();

        let stats =
            print_transitions(&spool, SimTime::ZERO, SimTime::MAX, &[], &mut Vec::new()).unwrap();
        assert!(stats.corrupt_tail.is_some());
        assert!(stats.printed > 0);
    }

    #[test]
    fn bad_time_bound_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let args = ReplayArgs {
            spool: record(&dir, 1),
            from: Some("soon".into()),
            to: None,
            ports: Vec::new(),
        };
        assert!(replay(&args, &quiet()).is_err());
    }

    #[test]
    fn export_writes_vcd_file() {
        let dir = tempfile::tempdir().unwrap();
        let args = ExportArgs {
            spool: record(&dir, 2),
            output: dir.path().join("counter.vcd"),
        };
        assert_eq!(export(&args, &quiet()).unwrap(), 0);

        let vcd = std::fs::read_to_string(&args.output).unwrap();
        assert!(vcd.contains("$enddefinitions $end"));
        assert!(vcd.contains("$var wire 4 "));
        assert!(vcd.contains("b0010 "));
    }

    #[test]
    fn export_of_missing_spool_fails() {
        let dir = tempfile::tempdir().unwrap();
        let args = ExportArgs {
            spool: dir.path().join("absent.spool"),
            output: dir.path().join("absent.vcd"),
        };
        assert!(export(&args, &quiet()).is_err());
    }
}
