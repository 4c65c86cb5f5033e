//! Conversion of spools into IEEE 1364 Value Change Dump files.
//!
//! [`WaveformSink`] abstracts the output format; [`VcdWriter`] is the VCD
//! implementation. [`export_vcd`] streams a spool through it so the output
//! can be opened in GTKWave, Surfer or any other VCD viewer.

use crate::design::{Port, PortId};
use crate::spool::{SpoolError, SpoolReader, SpoolRecord};
use crate::time::SimTime;
use std::io::{self, BufRead, Write};
use tracing::warn;
use vigil_common::{Logic, LogicVec};

/// Errors raised while writing a waveform.
#[derive(Debug, thiserror::Error)]
pub enum WaveformError {
    /// Writing the output failed.
    #[error("failed to write waveform: {0}")]
    Io(#[from] io::Error),
    /// Reading the spool failed.
    #[error(transparent)]
    Spool(#[from] SpoolError),
    /// A change referred to a port that was never declared.
    #[error("waveform change for undeclared {port}")]
    UndeclaredPort {
        /// The offending port.
        port: PortId,
    },
    /// A port was declared after the first value change.
    #[error("{port} declared after value changes were written")]
    LateDeclaration {
        /// The offending port.
        port: PortId,
    },
}

/// A waveform output format.
pub trait WaveformSink {
    /// Declares a port. All ports must be declared before the first change.
    fn declare(&mut self, port: &Port) -> Result<(), WaveformError>;

    /// Records a value change.
    fn change(&mut self, time: SimTime, port: PortId, value: &LogicVec)
        -> Result<(), WaveformError>;

    /// Writes any trailer and flushes the output.
    fn finish(&mut self) -> Result<(), WaveformError>;
}

#[derive(Debug)]
struct VcdVar {
    port: Port,
    code: String,
}

/// Writes VCD text with a femtosecond timescale.
///
/// Dotted port names become nested `$scope module` blocks. Identifier codes
/// are printable ASCII starting from `!`.
#[derive(Debug)]
pub struct VcdWriter<W: Write> {
    out: W,
    vars: Vec<Option<VcdVar>>,
    header_written: bool,
    current_time: Option<SimTime>,
}

impl<W: Write> VcdWriter<W> {
    /// Creates a writer over `out`.
    pub fn new(out: W) -> Self {
        Self {
            out,
            vars: Vec::new(),
            header_written: false,
            current_time: None,
        }
    }

    /// Returns the underlying output.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn id_code(index: usize) -> String {
        let mut code = String::new();
        let mut idx = index;
        loop {
            code.push(char::from(b'!' + (idx % 94) as u8));
            idx /= 94;
            if idx == 0 {
                break;
            }
            idx -= 1;
        }
        code
    }

    fn format_value(value: &LogicVec) -> String {
        let bit = |l: Logic| match l {
            Logic::Zero => '0',
            Logic::One => '1',
            Logic::X => 'x',
            Logic::Z => 'z',
        };
        if value.width() == 1 {
            return bit(value.get(0)).to_string();
        }
        let mut s = String::with_capacity(value.width() as usize + 1);
        s.push('b');
        s.extend((0..value.width()).rev().map(|i| bit(value.get(i))));
        s
    }

    fn write_header(&mut self) -> Result<(), WaveformError> {
        writeln!(self.out, "$version\n  vigil\n$end")?;
        writeln!(self.out, "$timescale\n  1fs\n$end")?;

        let mut vars: Vec<&VcdVar> = self.vars.iter().flatten().collect();
        vars.sort_by(|a, b| a.port.name.cmp(&b.port.name));
        let mut open: Vec<&str> = Vec::new();
        for var in vars {
            let mut path: Vec<&str> = var.port.name.split('.').collect();
            let leaf = path.pop().unwrap_or_default();
            let common = open
                .iter()
                .zip(&path)
                .take_while(|(a, b)| a == b)
                .count();
            for _ in common..open.len() {
                writeln!(self.out, "$upscope $end")?;
            }
            open.truncate(common);
            for scope in &path[common..] {
                writeln!(self.out, "$scope module {scope} $end")?;
                open.push(scope);
            }
            writeln!(
                self.out,
                "$var wire {} {} {leaf} $end",
                var.port.width, var.code
            )?;
        }
        for _ in &open {
            writeln!(self.out, "$upscope $end")?;
        }
        writeln!(self.out, "$enddefinitions $end")?;
        self.header_written = true;
        Ok(())
    }
}

impl<W: Write> WaveformSink for VcdWriter<W> {
    fn declare(&mut self, port: &Port) -> Result<(), WaveformError> {
        if self.header_written {
            return Err(WaveformError::LateDeclaration { port: port.id });
        }
        let index = port.id.index();
        if self.vars.len() <= index {
            self.vars.resize_with(index + 1, || None);
        }
        self.vars[index] = Some(VcdVar {
            port: port.clone(),
            code: Self::id_code(index),
        });
        Ok(())
    }

    fn change(
        &mut self,
        time: SimTime,
        port: PortId,
        value: &LogicVec,
    ) -> Result<(), WaveformError> {
        if !self.header_written {
            self.write_header()?;
        }
        let Some(Some(var)) = self.vars.get(port.index()) else {
            return Err(WaveformError::UndeclaredPort { port });
        };
        let code = var.code.clone();
        if self.current_time != Some(time) {
            if self.current_time.is_none() {
                writeln!(self.out, "$dumpvars")?;
            }
            writeln!(self.out, "#{}", time.as_fs())?;
            self.current_time = Some(time);
        }
        let text = Self::format_value(value);
        if value.width() == 1 {
            writeln!(self.out, "{text}{code}")?;
        } else {
            writeln!(self.out, "{text} {code}")?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), WaveformError> {
        if !self.header_written {
            self.write_header()?;
        }
        self.out.flush()?;
        Ok(())
    }
}

/// What [`export_vcd`] wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportSummary {
    /// Declared ports.
    pub ports: usize,
    /// Value changes written.
    pub changes: u64,
    /// Time of the last change.
    pub end_time: Option<SimTime>,
    /// Offset of a torn trailing record, if the spool ended with one.
    pub corrupt_tail: Option<u64>,
}

/// Streams every record of a spool into a VCD file.
///
/// A torn trailing record ends the export early without failing it.
pub fn export_vcd<R: BufRead, W: Write>(
    reader: SpoolReader<R>,
    out: W,
) -> Result<ExportSummary, WaveformError> {
    let mut sink = VcdWriter::new(out);
    let mut summary = ExportSummary::default();
    for record in reader {
        match record {
            Ok(SpoolRecord::Port(port)) => {
                sink.declare(&port)?;
                summary.ports += 1;
            }
            Ok(SpoolRecord::Transition(t)) => {
                sink.change(t.time, t.port, &t.after)?;
                summary.changes += 1;
                summary.end_time = Some(t.time);
            }
            Err(SpoolError::CorruptTrailingRecord { offset }) => {
                warn!(offset, "spool export stopped at a torn record");
                summary.corrupt_tail = Some(offset);
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    sink.finish()?;
    Ok(summary)
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

    fn render(f: impl FnOnce(&mut VcdWriter<Vec<u8>>)) -> String {
        let mut writer = VcdWriter::new(Vec::new());
        f(&mut writer);
        String::from_utf8(writer.into_inner()).unwrap()
    }

    #[test]
    fn id_codes() {
        assert_eq!(VcdWriter::<Vec<u8>>::id_code(0), "!");
        assert_eq!(VcdWriter::<Vec<u8>>::id_code(93), "~");
        assert_eq!(VcdWriter::<Vec<u8>>::id_code(94).len(), 2);
    }

    #[test]
    fn nested_scopes_from_dotted_names() {
        let text = render(|w| {
            w.declare(&port(0, "top.clk", 1)).unwrap();
            w.declare(&port(1, "top.core.count", 4)).unwrap();
            w.declare(&port(2, "top.core.carry", 1)).unwrap();
            w.finish().unwrap();
        });
        let expected_order = [
            "$scope module top $end",
            "$var wire 1 ! clk $end",
            "$scope module core $end",
            "$var wire 1 # carry $end",
            "$var wire 4 \" count $end",
            "$upscope $end",
            "$upscope $end",
            "$enddefinitions $end",
        ];
        let mut from = 0;
        for line in expected_order {
            let at = text[from..]
                .find(line)
                .unwrap_or_else(|| panic!("missing {line:?} in\n{text}"));
            from += at + line.len();
        }
    }

    #[test]
    fn changes_are_timestamped() {
        let text = render(|w| {
            w.declare(&port(0, "top.clk", 1)).unwrap();
            w.declare(&port(1, "top.bus", 3)).unwrap();
            w.change(SimTime::ZERO, PortId::from_raw(0), &LogicVec::from_bool(false))
                .unwrap();
            w.change(SimTime::ZERO, PortId::from_raw(1), &"1x0".parse().unwrap())
                .unwrap();
            w.change(SimTime::from_ns(1), PortId::from_raw(0), &LogicVec::from_bool(true))
                .unwrap();
            w.finish().unwrap();
        });
        assert!(text.contains("$dumpvars\n#0\n0!\nb1x0 \"\n#1000000\n1!\n"));
    }

    #[test]
    fn rejects_late_and_undeclared_ports() {
        let mut w = VcdWriter::new(Vec::new());
        w.declare(&port(0, "top.a", 1)).unwrap();
        assert!(matches!(
            w.change(SimTime::ZERO, PortId::from_raw(5), &LogicVec::zeros(1)),
            Err(WaveformError::UndeclaredPort { .. })
        ));
        assert!(matches!(
            w.declare(&port(1, "top.b", 1)),
            Err(WaveformError::LateDeclaration { .. })
        ));
    }
}
