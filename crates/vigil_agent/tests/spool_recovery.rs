//! Spool durability: torn tails, resumed runs, replay and export.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;

use vigil_agent::{
    export_vcd, replay, Agent, ClockDriver, Counter, PortId, SimDuration, SimTime, SpoolError,
    SpoolReader, SpoolWriter, Transition,
};
use vigil_common::LogicVec;
use vigil_config::SyncPolicy;

fn run_counter(spool: SpoolWriter, cycles: u64) -> Vec<(SimTime, Vec<LogicVec>)> {
    let mut agent = Agent::new(spool, Counter::new("top", 8)).unwrap();
    let mut clock = ClockDriver::new(Counter::CLK, SimDuration::from_ns(1)).unwrap();
    let mut seen = Vec::new();
    agent.step().unwrap();
    seen.push((agent.time(), agent.snapshot().values.clone()));
    for _ in 0..cycles {
        for _ in 0..2 {
            clock.half_cycle(&mut agent).unwrap();
            seen.push((agent.time(), agent.snapshot().values.clone()));
        }
    }
    agent.finish().unwrap();
    seen
}

fn read_all(path: &Path) -> (Vec<Transition>, Vec<SpoolError>) {
    let mut transitions = Vec::new();
    let mut errors = Vec::new();
    for item in SpoolReader::open(path).unwrap().transitions() {
        match item {
            Ok(t) => transitions.push(t),
            Err(e) => errors.push(e),
        }
    }
    (transitions, errors)
}

fn tear(path: &Path, bytes: u64) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    let len = file.metadata().unwrap().len();
    file.set_len(len - bytes).unwrap();
}

#[test]
fn replay_matches_every_committed_step() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fidelity.spool");
    let seen = run_counter(SpoolWriter::create(&path, SyncPolicy::Step).unwrap(), 12);

    let whole = replay(&path, SimTime::ZERO, SimTime::MAX);
    for (time, values) in &seen {
        let replayed = whole.values_at(*time).unwrap();
        assert_eq!(&replayed.values, values, "values differ at {time}");
    }

    let (transitions, errors) = read_all(&path);
    assert!(errors.is_empty());
    assert!(transitions.windows(2).all(|w| w[0].time <= w[1].time));
}

#[test]
fn replay_range_is_half_open_and_restartable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("range.spool");
    run_counter(SpoolWriter::create(&path, SyncPolicy::Buffered).unwrap(), 5);

    let window = replay(&path, SimTime::from_ns(2), SimTime::from_ns(6));
    let first: Vec<Transition> = window.iter().unwrap().collect::<Result<_, _>>().unwrap();
    let second: Vec<Transition> = window.iter().unwrap().collect::<Result<_, _>>().unwrap();
    assert_eq!(first, second);
    assert!(!first.is_empty());
    assert!(first
        .iter()
        .all(|t| t.time >= SimTime::from_ns(2) && t.time < SimTime::from_ns(6)));
    assert!(first.iter().any(|t| t.time == SimTime::from_ns(2)));

    // Describing a replay of a missing file is fine; running it is not.
    let missing = replay(dir.path().join("missing.spool"), SimTime::ZERO, SimTime::MAX);
    assert!(matches!(missing.iter(), Err(SpoolError::Io { .. })));
}

#[test]
fn torn_tail_is_reported_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("torn.spool");
    run_counter(SpoolWriter::create(&path, SyncPolicy::Step).unwrap(), 10);
    let (intact, _) = read_all(&path);
    tear(&path, 3);

    let (transitions, errors) = read_all(&path);
    assert_eq!(transitions.len(), intact.len() - 1);
    assert_eq!(transitions[..], intact[..intact.len() - 1]);
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], SpoolError::CorruptTrailingRecord { .. }));

    // Replay stops quietly at the last complete record.
    let values = replay(&path, SimTime::ZERO, SimTime::MAX)
        .values_at(SimTime::from_ns(20))
        .unwrap();
    assert_eq!(values.by_name("top.count").unwrap().to_u64(), Some(9));
}

#[test]
fn resumed_spool_drops_torn_tail_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resume.spool");
    run_counter(SpoolWriter::create(&path, SyncPolicy::Step).unwrap(), 10);
    tear(&path, 3);
    let (before, _) = read_all(&path);

    let spool = SpoolWriter::open_append(&path, SyncPolicy::Step).unwrap();
    assert_eq!(spool.last_time(), Some(SimTime::from_ns(20)));
    assert_eq!(spool.ports().len(), 5);
    let mut agent = Agent::new(spool, Counter::new("top", 8)).unwrap();
    assert_eq!(agent.time(), SimTime::from_ns(20));
    agent.step().unwrap();
    ClockDriver::new(Counter::CLK, SimDuration::from_ns(1))
        .unwrap()
        .cycles(&mut agent, 5)
        .unwrap();
    agent.finish().unwrap();

    let (after, errors) = read_all(&path);
    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    assert_eq!(after[..before.len()], before[..]);
    assert!(after.windows(2).all(|w| w[0].time <= w[1].time));
    assert_eq!(after.last().unwrap().time, SimTime::from_ns(30));

    let values = replay(&path, SimTime::ZERO, SimTime::MAX)
        .values_at(SimTime::from_ns(30))
        .unwrap();
    assert_eq!(values.by_name("top.count").unwrap().to_u64(), Some(5));
}

#[test]
fn resumed_run_continues_from_recorded_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chain.spool");
    run_counter(SpoolWriter::create(&path, SyncPolicy::Step).unwrap(), 3);
    let (before_resume, _) = read_all(&path);

    let spool = SpoolWriter::open_append(&path, SyncPolicy::Step).unwrap();
    let mut agent = Agent::new(spool, Counter::new("top", 8)).unwrap();
    agent.step().unwrap();
    agent.finish().unwrap();

    let (transitions, errors) = read_all(&path);
    assert!(errors.is_empty());
    let resumed = &transitions[before_resume.len()..];
    // Only clk (1 -> X) and count (3 -> 0) differ from the recorded state.
    assert_eq!(resumed.len(), 2);
    assert!(resumed.iter().all(|t| t.time == SimTime::from_ns(6)));

    let mut last: HashMap<PortId, LogicVec> = HashMap::new();
    for t in &transitions {
        let expected = last
            .get(&t.port)
            .cloned()
            .unwrap_or_else(|| LogicVec::unknown(t.before.width()));
        assert_eq!(t.before, expected, "broken history at {} on {}", t.time, t.port);
        last.insert(t.port, t.after.clone());
    }
}

#[test]
fn resuming_with_a_different_design_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conflict.spool");
    run_counter(SpoolWriter::create(&path, SyncPolicy::Step).unwrap(), 1);

    let spool = SpoolWriter::open_append(&path, SyncPolicy::Step).unwrap();
    let err = Agent::new(spool, Counter::new("top", 4)).err().unwrap();
    assert_eq!(err.code(), "spool_error");
}

#[test]
fn export_writes_a_vcd() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wave.spool");
    run_counter(SpoolWriter::create(&path, SyncPolicy::Step).unwrap(), 3);
    let (transitions, _) = read_all(&path);

    let mut out = Vec::new();
    let summary = export_vcd(SpoolReader::open(&path).unwrap(), &mut out).unwrap();
    assert_eq!(summary.ports, 5);
    assert_eq!(summary.changes, transitions.len() as u64);
    assert_eq!(summary.end_time, Some(SimTime::from_ns(6)));
    assert_eq!(summary.corrupt_tail, None);

    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("$timescale\n  1fs\n$end"));
    assert!(text.contains("$scope module top $end"));
    assert!(text.contains("$var wire 8 "));
    assert!(text.contains("#6000000\n"));
    assert!(text.contains("b00000011 "));
}

#[test]
fn export_of_torn_spool_reports_the_tail() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("torn-wave.spool");
    run_counter(SpoolWriter::create(&path, SyncPolicy::Step).unwrap(), 3);
    tear(&path, 2);

    let summary = export_vcd(SpoolReader::open(&path).unwrap(), Vec::new()).unwrap();
    assert!(summary.corrupt_tail.is_some());
}
