//! GPU temperature polling through an external monitoring process.
//!
//! The source (by default `nvidia-smi -l 5 -q -d TEMPERATURE`) prints one
//! sample per GPU in device order, over and over. A reader thread splits its
//! output into lines; the monitor decodes at most one line per tick.
//!
//! Samples carry no GPU index, so each decoded sample (value or N/A) advances
//! a rotating cursor over the table. An `Attached GPUs` header starts a new
//! polling round and resets the cursor, so a missing sample can only skew the
//! rest of its own round.

use crossbeam::channel::{self, Receiver, TryRecvError};
use log::{debug, warn};
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::thread;

/// Longest accepted line. Longer lines are discarded.
pub const MAX_LINE_LEN: usize = 10240;

/// Lines buffered between the reader thread and the monitor.
const LINE_QUEUE: usize = 1024;

/// External command producing temperature samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemperatureCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for TemperatureCommand {
    fn default() -> Self {
        Self {
            program: "nvidia-smi".to_string(),
            args: ["-l", "5", "-q", "-d", "TEMPERATURE"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// What one line of source output means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    /// Current temperature of the next GPU, in Celsius.
    Celsius(i32),
    /// The next GPU has no reading.
    Unavailable,
    /// A new polling round begins.
    RoundStart,
    /// Anything else.
    Ignored,
}

/// Classifies one line of `nvidia-smi -q -d TEMPERATURE` output.
pub fn decode_line(line: &str) -> Sample {
    let Some((key, value)) = line.split_once(':') else {
        return Sample::Ignored;
    };
    let key = key.trim();
    let value = value.trim();

    match key {
        "GPU Current Temp" => {
            if value == "N/A" {
                return Sample::Unavailable;
            }
            value
                .strip_suffix('C')
                .and_then(|v| v.trim().parse().ok())
                .map_or(Sample::Ignored, Sample::Celsius)
        }
        "Gpu" if value == "N/A" => Sample::Unavailable,
        "Attached GPUs" => Sample::RoundStart,
        _ => Sample::Ignored,
    }
}

/// Last known temperature per GPU slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemperatureTable {
    temps: Vec<Option<i32>>,
    cursor: usize,
}

impl TemperatureTable {
    pub fn new(slots: usize) -> Self {
        Self {
            temps: vec![None; slots],
            cursor: 0,
        }
    }

    /// Feeds one line and returns how it was interpreted.
    pub fn feed(&mut self, line: &str) -> Sample {
        let sample = decode_line(line);
        if self.temps.is_empty() {
            return sample;
        }
        match sample {
            Sample::Celsius(value) => {
                self.temps[self.cursor] = Some(value);
                self.advance();
            }
            // Keeps the rotation aligned with the source's device order.
            Sample::Unavailable => self.advance(),
            Sample::RoundStart => self.cursor = 0,
            Sample::Ignored => {}
        }
        sample
    }

    fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.temps.len();
    }

    /// Temperature of GPU `slot`, `None` when unknown.
    pub fn get(&self, slot: usize) -> Option<i32> {
        self.temps.get(slot).copied().flatten()
    }

    #[cfg(test)]
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

/// Outcome of reading one capped line.
#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Line(String),
    Discarded,
    Eof,
}

/// Reads up to and including the next newline, at most `cap` bytes.
///
/// A line that reaches the cap before its newline is consumed to the end
/// and discarded.
fn read_capped_line<R: BufRead>(reader: &mut R, cap: usize) -> std::io::Result<LineRead> {
    let mut buf = Vec::new();
    let n = reader.by_ref().take(cap as u64).read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.last() == Some(&b'\n') {
        return Ok(LineRead::Line(String::from_utf8_lossy(&buf).into_owned()));
    }
    if n < cap {
        // Final line without a newline.
        return Ok(LineRead::Line(String::from_utf8_lossy(&buf).into_owned()));
    }

    let mut skipped = Vec::new();
    loop {
        skipped.clear();
        let n = reader.by_ref().take(cap as u64).read_until(b'\n', &mut skipped)?;
        if n == 0 || skipped.last() == Some(&b'\n') {
            return Ok(LineRead::Discarded);
        }
    }
}

/// Polls GPU temperatures from an external process.
pub struct TemperaturePoller {
    child: Option<Child>,
    lines: Option<Receiver<String>>,
    table: TemperatureTable,
}

impl TemperaturePoller {
    /// Launches `command` and starts reading its output.
    ///
    /// A launch failure is logged and yields an unavailable poller; the run
    /// continues without temperatures.
    pub fn spawn(command: &TemperatureCommand, slots: usize) -> Self {
        let mut child = match Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(
                    "Could not start {} for temperature monitoring: {}",
                    command.program, e
                );
                return Self::unavailable(slots);
            }
        };

        let Some(stdout) = child.stdout.take() else {
            warn!("{} has no output stream", command.program);
            let _ = child.kill();
            let _ = child.wait();
            return Self::unavailable(slots);
        };

        let mut poller = Self::from_reader(stdout, slots);
        poller.child = Some(child);
        poller
    }

    /// Reads samples from an arbitrary stream.
    pub fn from_reader<R: Read + Send + 'static>(reader: R, slots: usize) -> Self {
        let (tx, rx) = channel::bounded(LINE_QUEUE);
        let spawned = thread::Builder::new()
            .name("temperature-reader".to_string())
            .spawn(move || {
                let mut reader = BufReader::new(reader);
                loop {
                    match read_capped_line(&mut reader, MAX_LINE_LEN) {
                        Ok(LineRead::Line(line)) => {
                            if tx.send(line).is_err() {
                                break;
                            }
                        }
                        Ok(LineRead::Discarded) => debug!("Discarded overlong temperature line"),
                        Ok(LineRead::Eof) => break,
                        Err(e) => {
                            debug!("Temperature source read failed: {}", e);
                            break;
                        }
                    }
                }
            });

        match spawned {
            Ok(_) => Self {
                child: None,
                lines: Some(rx),
                table: TemperatureTable::new(slots),
            },
            Err(e) => {
                warn!("Could not start temperature reader: {}", e);
                Self::unavailable(slots)
            }
        }
    }

    /// A poller with no source; every temperature stays unknown.
    pub fn unavailable(slots: usize) -> Self {
        Self {
            child: None,
            lines: None,
            table: TemperatureTable::new(slots),
        }
    }

    #[cfg(test)]
    pub fn is_available(&self) -> bool {
        self.lines.is_some()
    }

    /// Decodes at most one pending line. Returns true if a line was consumed.
    pub fn poll(&mut self) -> bool {
        let Some(lines) = &self.lines else {
            return false;
        };
        match lines.try_recv() {
            Ok(line) => {
                self.table.feed(&line);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                warn!("Temperature source ended; temperatures will no longer update");
                self.lines = None;
                false
            }
        }
    }

    pub fn temperature(&self, slot: usize) -> Option<i32> {
        self.table.get(slot)
    }

    /// Stops the source process and drops the line stream.
    pub fn shutdown(&mut self) {
        self.lines = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for TemperaturePoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
