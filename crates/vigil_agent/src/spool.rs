//! The waveform spool: an append-only record of every port transition.
//!
//! # File layout
//!
//! ```text
//! header : "VGSP" | format version (u32 LE)
//! record : payload length (u32 LE) | XXH3-64 of payload (u64 LE) | payload
//! ```
//!
//! Payloads are bincode-encoded [`SpoolRecord`]s. Every port is declared by a
//! `Port` record before any transition refers to it. Records are written
//! whole and never rewritten, so an interrupted run leaves at most one torn
//! record at the end of the file. Readers report that record once as
//! [`SpoolError::CorruptTrailingRecord`] and stop at the last complete one.

use crate::design::{Port, PortId};
use crate::time::SimTime;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use vigil_common::{LogicVec, RecordChecksum};
use vigil_config::SyncPolicy;

const SPOOL_MAGIC: [u8; 4] = *b"VGSP";
const SPOOL_FORMAT_VERSION: u32 = 1;
const HEADER_LEN: u64 = 8;
const FRAME_HEADER_LEN: usize = 4 + RecordChecksum::LEN;
const MAX_RECORD_LEN: usize = 64 << 20;

/// Errors raised while writing or reading a spool.
#[derive(Debug, thiserror::Error)]
pub enum SpoolError {
    /// An I/O error on the spool file.
    #[error("spool I/O error at {path}: {source}")]
    Io {
        /// The spool path.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The file does not start with a valid spool header.
    #[error("invalid spool header in {path}: {reason}")]
    BadHeader {
        /// The spool path.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },

    /// A transition was older than the last one written.
    #[error("out-of-order spool write: {attempted} is before {last}")]
    OutOfOrderWrite {
        /// Time of the last recorded transition.
        last: SimTime,
        /// Time of the rejected transition.
        attempted: SimTime,
    },

    /// A transition referred to a port with no declaration.
    #[error("transition on undeclared {port}")]
    UndeclaredPort {
        /// The unknown port.
        port: PortId,
    },

    /// A port declaration conflicts with the ports already in the spool.
    #[error("conflicting declaration for {port}: {reason}")]
    PortConflict {
        /// The conflicting port.
        port: PortId,
        /// What did not match.
        reason: String,
    },

    /// The last record of the file is incomplete or fails its checksum.
    #[error("spool ends with a torn record at byte {offset}")]
    CorruptTrailingRecord {
        /// File offset where the torn record starts.
        offset: u64,
    },

    /// A record in the middle of the file fails its checksum.
    #[error("corrupt spool record at byte {offset}")]
    CorruptRecord {
        /// File offset of the damaged record.
        offset: u64,
    },

    /// A record could not be encoded or decoded.
    #[error("spool serialization error: {reason}")]
    Serialization {
        /// Description of the failure.
        reason: String,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> SpoolError + '_ {
    move |source| SpoolError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One committed change of a port value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// When the change was committed.
    pub time: SimTime,
    /// The port that changed.
    pub port: PortId,
    /// Value before the change.
    pub before: LogicVec,
    /// Value after the change.
    pub after: LogicVec,
}

/// A decoded spool record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpoolRecord {
    /// A port declaration.
    Port(Port),
    /// A port transition.
    Transition(Transition),
}

// Serializes exactly like `SpoolRecord` without cloning the payload.
#[derive(Serialize)]
enum RecordRef<'a> {
    Port(&'a Port),
    Transition(&'a Transition),
}

/// Appends records to a spool file. Owned by the stepping context.
#[derive(Debug)]
pub struct SpoolWriter {
    path: PathBuf,
    out: BufWriter<File>,
    sync: SyncPolicy,
    ports: Vec<Port>,
    values: Vec<LogicVec>,
    last_time: Option<SimTime>,
    records: u64,
    len: u64,
}

impl SpoolWriter {
    /// Creates a new spool, replacing any existing file at `path`.
    pub fn create(path: impl AsRef<Path>, sync: SyncPolicy) -> Result<Self, SpoolError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error(&path))?;
        }
        let file = File::create(&path).map_err(io_error(&path))?;
        let mut out = BufWriter::new(file);
        out.write_all(&SPOOL_MAGIC).map_err(io_error(&path))?;
        out.write_all(&SPOOL_FORMAT_VERSION.to_le_bytes())
            .map_err(io_error(&path))?;
        out.flush().map_err(io_error(&path))?;
        debug!(path = %path.display(), "created spool");
        Ok(Self {
            path,
            out,
            sync,
            ports: Vec::new(),
            values: Vec::new(),
            last_time: None,
            records: 0,
            len: HEADER_LEN,
        })
    }

    /// Opens an existing spool for appending, creating it if absent.
    ///
    /// A torn trailing record is cut off before appending resumes.
    pub fn open_append(path: impl AsRef<Path>, sync: SyncPolicy) -> Result<Self, SpoolError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Self::create(path, sync);
        }
        let mut reader = SpoolReader::open(&path)?;
        let mut last_time = None;
        let mut records = 0u64;
        let mut values: Vec<LogicVec> = Vec::new();
        let mut torn = false;
        for record in reader.by_ref() {
            match record {
                Ok(SpoolRecord::Port(port)) => {
                    values.push(LogicVec::unknown(port.width));
                    records += 1;
                }
                Ok(SpoolRecord::Transition(t)) => {
                    last_time = Some(t.time);
                    if let Some(slot) = values.get_mut(t.port.index()) {
                        *slot = t.after;
                    }
                    records += 1;
                }
                Err(SpoolError::CorruptTrailingRecord { .. }) => torn = true,
                Err(e) => return Err(e),
            }
        }
        let valid_len = reader.offset();
        let ports = reader.ports().to_vec();

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(io_error(&path))?;
        if torn {
            file.set_len(valid_len).map_err(io_error(&path))?;
            warn!(
                path = %path.display(),
                valid_len,
                "truncated torn record before resuming spool"
            );
        }
        info!(path = %path.display(), records, "resuming spool");
        Ok(Self {
            path,
            out: BufWriter::new(file),
            sync,
            ports,
            values,
            last_time,
            records,
            len: valid_len,
        })
    }

    /// Returns the spool path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the declared ports.
    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    /// Returns the latest recorded value of each port, all `X` before its
    /// first transition.
    pub fn values(&self) -> &[LogicVec] {
        &self.values
    }

    /// Returns the time of the last recorded transition.
    pub fn last_time(&self) -> Option<SimTime> {
        self.last_time
    }

    /// Returns the number of records in the spool.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Returns the number of bytes in the spool, including buffered records.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` when the spool holds no records.
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Declares a port.
    ///
    /// Ports must be declared in id order. Re-declaring an identical port, as
    /// happens when a run resumes an existing spool, is a no-op.
    pub fn declare_port(&mut self, port: &Port) -> Result<(), SpoolError> {
        if let Some(existing) = self.ports.get(port.id.index()) {
            if existing == port {
                return Ok(());
            }
            return Err(SpoolError::PortConflict {
                port: port.id,
                reason: format!("spool already declares {} as '{}'", port.id, existing.name),
            });
        }
        if port.id.index() != self.ports.len() {
            return Err(SpoolError::PortConflict {
                port: port.id,
                reason: format!("expected {}", PortId::from_raw(self.ports.len() as u32)),
            });
        }
        self.append(&RecordRef::Port(port))?;
        self.ports.push(port.clone());
        self.values.push(LogicVec::unknown(port.width));
        Ok(())
    }

    /// Appends a transition. Times must be non-decreasing.
    pub fn record(&mut self, transition: &Transition) -> Result<(), SpoolError> {
        if let Some(last) = self.last_time {
            if transition.time < last {
                return Err(SpoolError::OutOfOrderWrite {
                    last,
                    attempted: transition.time,
                });
            }
        }
        if transition.port.index() >= self.ports.len() {
            return Err(SpoolError::UndeclaredPort {
                port: transition.port,
            });
        }
        self.append(&RecordRef::Transition(transition))?;
        self.last_time = Some(transition.time);
        self.values[transition.port.index()] = transition.after.clone();
        Ok(())
    }

    fn append(&mut self, record: &RecordRef<'_>) -> Result<(), SpoolError> {
        let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
            .map_err(|e| SpoolError::Serialization {
                reason: e.to_string(),
            })?;
        if payload.len() > MAX_RECORD_LEN {
            return Err(SpoolError::Serialization {
                reason: format!("record of {} bytes exceeds the limit", payload.len()),
            });
        }
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&RecordChecksum::of(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);
        self.out.write_all(&frame).map_err(io_error(&self.path))?;
        self.len += frame.len() as u64;
        self.records += 1;
        Ok(())
    }

    /// Applies the sync policy at the end of a step.
    pub fn end_step(&mut self) -> Result<(), SpoolError> {
        match self.sync {
            SyncPolicy::Buffered => Ok(()),
            SyncPolicy::Step => self.flush(),
            SyncPolicy::Durable => {
                self.flush()?;
                self.out.get_ref().sync_data().map_err(io_error(&self.path))
            }
        }
    }

    /// Pushes buffered records to the operating system.
    pub fn flush(&mut self) -> Result<(), SpoolError> {
        self.out.flush().map_err(io_error(&self.path))
    }

    /// Flushes and fsyncs the spool.
    pub fn close(&mut self) -> Result<(), SpoolError> {
        self.flush()?;
        self.out.get_ref().sync_all().map_err(io_error(&self.path))
    }
}

/// Reads records from a spool lazily, one at a time.
#[derive(Debug)]
pub struct SpoolReader<R> {
    input: R,
    path: PathBuf,
    offset: u64,
    ports: Vec<Port>,
    finished: bool,
}

impl SpoolReader<BufReader<File>> {
    /// Opens a spool file and validates its header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SpoolError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(io_error(path))?;
        Self::from_reader(BufReader::new(file), path)
    }
}

impl<R: BufRead> SpoolReader<R> {
    /// Wraps a buffered reader positioned at the start of a spool.
    ///
    /// `source` names the spool in errors and log messages.
    pub fn from_reader(mut input: R, source: impl Into<PathBuf>) -> Result<Self, SpoolError> {
        let path = source.into();
        let mut header = [0u8; HEADER_LEN as usize];
        let n = read_full(&mut input, &mut header).map_err(io_error(&path))?;
        let bad = |reason: String| SpoolError::BadHeader {
            path: path.clone(),
            reason,
        };
        if n < header.len() {
            return Err(bad(format!("file is only {n} bytes long")));
        }
        if header[..4] != SPOOL_MAGIC {
            return Err(bad("not a spool file".to_string()));
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != SPOOL_FORMAT_VERSION {
            return Err(bad(format!(
                "format version {version}, expected {SPOOL_FORMAT_VERSION}"
            )));
        }
        Ok(Self {
            input,
            path,
            offset: HEADER_LEN,
            ports: Vec::new(),
            finished: false,
        })
    }

    /// Returns the offset just past the last complete record read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the ports declared so far.
    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    /// Turns the reader into an iterator over transitions only.
    pub fn transitions(self) -> Transitions<R> {
        Transitions { reader: self }
    }

    fn read_record(&mut self) -> Option<Result<SpoolRecord, SpoolError>> {
        let start = self.offset;
        let mut head = [0u8; FRAME_HEADER_LEN];
        match read_full(&mut self.input, &mut head) {
            Ok(0) => {
                self.finished = true;
                return None;
            }
            Ok(n) if n < FRAME_HEADER_LEN => return Some(Err(self.torn(start))),
            Ok(_) => {}
            Err(e) => {
                let err = io_error(&self.path)(e);
                return Some(Err(self.fail(err)));
            }
        }
        let len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as u64;
        // The writer never produces such a length, so the frame header is damaged.
        if len > MAX_RECORD_LEN as u64 {
            return Some(Err(self.fail(SpoolError::CorruptRecord { offset: start })));
        }
        let mut sum = [0u8; RecordChecksum::LEN];
        sum.copy_from_slice(&head[4..]);
        let checksum = RecordChecksum::from_le_bytes(sum);

        let mut payload = Vec::new();
        if let Err(e) = (&mut self.input).take(len).read_to_end(&mut payload) {
            let err = io_error(&self.path)(e);
            return Some(Err(self.fail(err)));
        }
        if (payload.len() as u64) < len {
            return Some(Err(self.torn(start)));
        }
        if !checksum.verify(&payload) {
            if self.at_eof() {
                return Some(Err(self.torn(start)));
            }
            return Some(Err(self.fail(SpoolError::CorruptRecord { offset: start })));
        }
        let record = match bincode::serde::decode_from_slice::<SpoolRecord, _>(
            &payload,
            bincode::config::standard(),
        ) {
            Ok((record, _)) => record,
            Err(e) => {
                return Some(Err(self.fail(SpoolError::Serialization {
                    reason: format!("record at byte {start}: {e}"),
                })))
            }
        };
        self.offset = start + FRAME_HEADER_LEN as u64 + len;
        if let SpoolRecord::Port(port) = &record {
            self.ports.push(port.clone());
        }
        Some(Ok(record))
    }

    fn at_eof(&mut self) -> bool {
        self.input.fill_buf().map(|b| b.is_empty()).unwrap_or(false)
    }

    fn torn(&mut self, offset: u64) -> SpoolError {
        warn!(
            path = %self.path.display(),
            offset,
            "spool ends with a torn record; stopping at the last complete record"
        );
        self.fail(SpoolError::CorruptTrailingRecord { offset })
    }

    fn fail(&mut self, err: SpoolError) -> SpoolError {
        self.finished = true;
        err
    }
}

impl<R: BufRead> Iterator for SpoolReader<R> {
    type Item = Result<SpoolRecord, SpoolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        self.read_record()
    }
}

/// Iterator over the transitions of a spool, skipping port declarations.
#[derive(Debug)]
pub struct Transitions<R> {
    reader: SpoolReader<R>,
}

impl<R> Transitions<R> {
    /// Returns the ports declared so far.
    pub fn ports(&self) -> &[Port] {
        &self.reader.ports
    }
}

impl<R: BufRead> Iterator for Transitions<R> {
    type Item = Result<Transition, SpoolError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.reader.next()? {
                Ok(SpoolRecord::Port(_)) => continue,
                Ok(SpoolRecord::Transition(t)) => return Some(Ok(t)),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// A lazy, restartable replay of the transitions in `[from, to)`.
///
/// Creating a replay touches nothing. Each call to [`iter`](Self::iter) opens
/// the spool afresh, so a replay can be run again or alongside a live writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replay {
    path: PathBuf,
    from: SimTime,
    to: SimTime,
}

/// Describes a replay of the spool at `path` over `[from, to)`.
pub fn replay(path: impl Into<PathBuf>, from: SimTime, to: SimTime) -> Replay {
    Replay {
        path: path.into(),
        from,
        to,
    }
}

impl Replay {
    /// Returns the spool path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the inclusive start of the range.
    pub fn from(&self) -> SimTime {
        self.from
    }

    /// Returns the exclusive end of the range.
    pub fn to(&self) -> SimTime {
        self.to
    }

    /// Opens the spool and starts iterating.
    pub fn iter(&self) -> Result<ReplayIter, SpoolError> {
        Ok(ReplayIter {
            inner: SpoolReader::open(&self.path)?.transitions(),
            from: self.from,
            to: self.to,
            done: false,
            corrupt_tail: None,
        })
    }

    /// Folds every transition at or before `time` into per-port values.
    ///
    /// Ports with no transition yet read as all `X`. A torn tail ends the
    /// fold without error.
    pub fn values_at(&self, time: SimTime) -> Result<PortValues, SpoolError> {
        let mut transitions = SpoolReader::open(&self.path)?.transitions();
        let mut values: Vec<LogicVec> = Vec::new();
        while let Some(next) = transitions.next() {
            let t = match next {
                Ok(t) => t,
                Err(SpoolError::CorruptTrailingRecord { .. }) => break,
                Err(e) => return Err(e),
            };
            if t.time > time {
                break;
            }
            let ports = transitions.ports();
            while values.len() < ports.len() {
                values.push(LogicVec::unknown(ports[values.len()].width));
            }
            if let Some(slot) = values.get_mut(t.port.index()) {
                *slot = t.after;
            }
        }
        let ports = transitions.ports().to_vec();
        while values.len() < ports.len() {
            values.push(LogicVec::unknown(ports[values.len()].width));
        }
        Ok(PortValues {
            time,
            ports,
            values,
        })
    }
}

/// Iterator returned by [`Replay::iter`].
#[derive(Debug)]
pub struct ReplayIter {
    inner: Transitions<BufReader<File>>,
    from: SimTime,
    to: SimTime,
    done: bool,
    corrupt_tail: Option<u64>,
}

impl ReplayIter {
    /// Returns the ports declared so far.
    pub fn ports(&self) -> &[Port] {
        self.inner.ports()
    }

    /// Returns the offset of the torn trailing record, once it was reached.
    pub fn corrupt_tail(&self) -> Option<u64> {
        self.corrupt_tail
    }
}

impl Iterator for ReplayIter {
    type Item = Result<Transition, SpoolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.inner.next() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Ok(t)) if t.time < self.from => continue,
                Some(Ok(t)) if t.time >= self.to => {
                    self.done = true;
                    return None;
                }
                Some(Ok(t)) => return Some(Ok(t)),
                Some(Err(e)) => {
                    if let SpoolError::CorruptTrailingRecord { offset } = e {
                        self.corrupt_tail = Some(offset);
                    }
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Port values reconstructed from a spool at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortValues {
    /// The time the values hold at.
    pub time: SimTime,
    /// Declared ports.
    pub ports: Vec<Port>,
    /// Value of each port, indexed by port id.
    pub values: Vec<LogicVec>,
}

impl PortValues {
    /// Returns the value of a port.
    pub fn get(&self, port: PortId) -> Option<&LogicVec> {
        self.values.get(port.index())
    }

    /// Returns the value of a port by name.
    pub fn by_name(&self, name: &str) -> Option<&LogicVec> {
        let port = self.ports.iter().find(|p| p.name == name)?;
        self.get(port.id)
    }
}

/// Reads until `buf` is full or the input ends, returning the bytes read.
fn read_full(input: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::PortDirection;

    fn port(id: u32, name: &str, width: u32) -> Port {
        Port {
            id: PortId::from_raw(id),
            name: name.to_string(),
            width,
            direction: PortDirection::Input,
        }
    }

    fn transition(ns: u64, port: u32, before: u64, after: u64) -> Transition {
        Transition {
            time: SimTime::from_ns(ns),
            port: PortId::from_raw(port),
            before: LogicVec::from_u64(before, 4),
            after: LogicVec::from_u64(after, 4),
        }
    }

    fn write_spool(path: &Path, transitions: &[Transition]) {
        let mut writer = SpoolWriter::create(path, SyncPolicy::Step).unwrap();
        writer.declare_port(&port(0, "top.a", 4)).unwrap();
        writer.declare_port(&port(1, "top.b", 4)).unwrap();
        for t in transitions {
            writer.record(t).unwrap();
        }
        writer.close().unwrap();
    }

    #[test]
    fn write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.spool");
        let written = vec![transition(0, 0, 0, 1), transition(1, 1, 0, 2), transition(1, 0, 1, 3)];
        write_spool(&path, &written);

        let reader = SpoolReader::open(&path).unwrap();
        let records: Vec<_> = reader.map(Result::unwrap).collect();
        assert_eq!(records.len(), 5);
        assert!(matches!(&records[0], SpoolRecord::Port(p) if p.name == "top.a"));

        let read: Vec<_> = SpoolReader::open(&path)
            .unwrap()
            .transitions()
            .map(Result::unwrap)
            .collect();
        assert_eq!(read, written);
    }

    #[test]
    fn rejects_time_regression() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SpoolWriter::create(dir.path().join("s"), SyncPolicy::Buffered).unwrap();
        writer.declare_port(&port(0, "a", 4)).unwrap();
        writer.record(&transition(5, 0, 0, 1)).unwrap();
        writer.record(&transition(5, 0, 1, 2)).unwrap();
        let err = writer.record(&transition(4, 0, 2, 3)).unwrap_err();
        assert!(matches!(err, SpoolError::OutOfOrderWrite { .. }));
        assert_eq!(writer.last_time(), Some(SimTime::from_ns(5)));
    }

    #[test]
    fn rejects_undeclared_port() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SpoolWriter::create(dir.path().join("s"), SyncPolicy::Buffered).unwrap();
        let err = writer.record(&transition(0, 0, 0, 1)).unwrap_err();
        assert!(matches!(err, SpoolError::UndeclaredPort { .. }));
    }

    #[test]
    fn port_declarations_must_be_dense() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SpoolWriter::create(dir.path().join("s"), SyncPolicy::Buffered).unwrap();
        let err = writer.declare_port(&port(1, "b", 1)).unwrap_err();
        assert!(matches!(err, SpoolError::PortConflict { .. }));
        writer.declare_port(&port(0, "a", 1)).unwrap();
        writer.declare_port(&port(0, "a", 1)).unwrap();
        assert_eq!(writer.records(), 1);
        let err = writer.declare_port(&port(0, "renamed", 1)).unwrap_err();
        assert!(matches!(err, SpoolError::PortConflict { .. }));
    }

    #[test]
    fn bad_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, b"NOPE\x01\x00\x00\x00").unwrap();
        assert!(matches!(
            SpoolReader::open(&path),
            Err(SpoolError::BadHeader { .. })
        ));
        std::fs::write(&path, b"VG").unwrap();
        assert!(matches!(
            SpoolReader::open(&path),
            Err(SpoolError::BadHeader { .. })
        ));
        std::fs::write(&path, b"VGSP\x09\x00\x00\x00").unwrap();
        let err = SpoolReader::open(&path).unwrap_err();
        assert!(err.to_string().contains("format version 9"));
    }

    #[test]
    fn truncated_tail_yields_complete_records_then_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torn.spool");
        let written = vec![transition(0, 0, 0, 1), transition(2, 0, 1, 2), transition(4, 0, 2, 3)];
        write_spool(&path, &written);
        let full = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 3).unwrap();

        let results: Vec<_> = SpoolReader::open(&path).unwrap().transitions().collect();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), &written[0]);
        assert_eq!(results[1].as_ref().unwrap(), &written[1]);
        assert!(matches!(
            results[2],
            Err(SpoolError::CorruptTrailingRecord { .. })
        ));
    }

    #[test]
    fn flipped_byte_in_last_record_is_a_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flip.spool");
        write_spool(&path, &[transition(0, 0, 0, 1), transition(1, 0, 1, 2)]);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let results: Vec<_> = SpoolReader::open(&path).unwrap().transitions().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(SpoolError::CorruptTrailingRecord { .. })
        ));
    }

    #[test]
    fn damage_mid_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mid.spool");
        write_spool(&path, &[transition(0, 0, 0, 1), transition(1, 0, 1, 2)]);
        let mut bytes = std::fs::read(&path).unwrap();
        // Last byte of the first port declaration's payload.
        let mut reader = SpoolReader::open(&path).unwrap();
        reader.next().unwrap().unwrap();
        let end_of_first = reader.offset() as usize;
        bytes[end_of_first - 1] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let results: Vec<_> = SpoolReader::open(&path).unwrap().collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(SpoolError::CorruptRecord { .. })));
    }

    #[test]
    fn damaged_length_mid_file_is_not_a_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("length.spool");
        let written: Vec<_> = (0..10).map(|i| transition(i, 0, i, i + 1)).collect();
        write_spool(&path, &written);

        // Two port declarations and two transitions precede the damaged record.
        let mut reader = SpoolReader::open(&path).unwrap();
        for _ in 0..4 {
            reader.next().unwrap().unwrap();
        }
        let start = reader.offset();
        let mut bytes = std::fs::read(&path).unwrap();
        let full = bytes.len() as u64;
        bytes[start as usize + 3] = 0x7f;
        std::fs::write(&path, &bytes).unwrap();

        let results: Vec<_> = SpoolReader::open(&path).unwrap().collect();
        assert_eq!(results.len(), 5);
        assert!(results[..4].iter().all(Result::is_ok));
        assert!(matches!(
            results[4],
            Err(SpoolError::CorruptRecord { offset }) if offset == start
        ));

        let err = SpoolWriter::open_append(&path, SyncPolicy::Step).unwrap_err();
        assert!(matches!(err, SpoolError::CorruptRecord { .. }));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), full);
    }

    #[test]
    fn append_recovers_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.spool");
        write_spool(&path, &[transition(0, 0, 0, 1), transition(2, 0, 1, 2)]);
        let full = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(full - 1)
            .unwrap();

        let mut writer = SpoolWriter::open_append(&path, SyncPolicy::Step).unwrap();
        assert_eq!(writer.ports().len(), 2);
        assert_eq!(writer.last_time(), Some(SimTime::from_ns(0)));
        assert_eq!(writer.values()[0].to_u64(), Some(1));
        assert_eq!(writer.values()[1].to_string(), "XXXX");
        writer.declare_port(&port(0, "top.a", 4)).unwrap();
        writer.record(&transition(3, 1, 0, 5)).unwrap();
        writer.close().unwrap();

        let read: Vec<_> = SpoolReader::open(&path)
            .unwrap()
            .transitions()
            .map(Result::unwrap)
            .collect();
        assert_eq!(read, vec![transition(0, 0, 0, 1), transition(3, 1, 0, 5)]);
    }

    #[test]
    fn append_to_missing_file_creates_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("new.spool");
        let writer = SpoolWriter::open_append(&path, SyncPolicy::Step).unwrap();
        assert!(writer.is_empty());
        assert!(path.exists());
    }

    #[test]
    fn replay_is_half_open_and_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.spool");
        let written: Vec<_> = (0..6).map(|i| transition(i, 0, i, i + 1)).collect();
        write_spool(&path, &written);

        let range = replay(&path, SimTime::from_ns(2), SimTime::from_ns(5));
        let first: Vec<_> = range.iter().unwrap().map(Result::unwrap).collect();
        let times: Vec<_> = first.iter().map(|t| t.time).collect();
        assert_eq!(
            times,
            vec![SimTime::from_ns(2), SimTime::from_ns(3), SimTime::from_ns(4)]
        );
        let second: Vec<_> = range.iter().unwrap().map(Result::unwrap).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn replay_missing_file_errors_only_when_iterated() {
        let range = replay("/nonexistent/spool.bin", SimTime::ZERO, SimTime::from_ns(1));
        assert!(matches!(range.iter(), Err(SpoolError::Io { .. })));
    }

    #[test]
    fn values_at_folds_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fold.spool");
        write_spool(
            &path,
            &[transition(0, 0, 0, 1), transition(3, 0, 1, 7), transition(5, 1, 0, 2)],
        );
        let range = replay(&path, SimTime::ZERO, SimTime::from_ns(10));
        let at4 = range.values_at(SimTime::from_ns(4)).unwrap();
        assert_eq!(at4.by_name("top.a").unwrap().to_u64(), Some(7));
        assert_eq!(at4.by_name("top.b").unwrap().to_string(), "XXXX");
        let at5 = range.values_at(SimTime::from_ns(5)).unwrap();
        assert_eq!(at5.get(PortId::from_raw(1)).unwrap().to_u64(), Some(2));
    }

    #[test]
    fn reader_sees_flushed_records_of_live_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.spool");
        let mut writer = SpoolWriter::create(&path, SyncPolicy::Step).unwrap();
        writer.declare_port(&port(0, "a", 4)).unwrap();
        writer.record(&transition(1, 0, 0, 1)).unwrap();
        writer.end_step().unwrap();

        let seen: Vec<_> = SpoolReader::open(&path)
            .unwrap()
            .transitions()
            .map(Result::unwrap)
            .collect();
        assert_eq!(seen.len(), 1);

        writer.record(&transition(2, 0, 1, 2)).unwrap();
        writer.end_step().unwrap();
        let seen = SpoolReader::open(&path).unwrap().transitions().count();
        assert_eq!(seen, 2);
    }

    #[test]
    fn error_display() {
        let err = SpoolError::OutOfOrderWrite {
            last: SimTime::from_ns(5),
            attempted: SimTime::from_ns(4),
        };
        assert_eq!(err.to_string(), "out-of-order spool write: 4 ns is before 5 ns");
        let err = SpoolError::CorruptTrailingRecord { offset: 42 };
        assert_eq!(err.to_string(), "spool ends with a torn record at byte 42");
    }
}
