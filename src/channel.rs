//! One-way report channel from a worker to the monitor.
//!
//! The channel is a bounded byte conduit. Each report is a fixed 8-byte frame
//! of two little-endian `i32` fields, `(processed, faults)`. A processed value
//! of `-1` marks the worker as dead; such a frame always carries `-1` in both
//! halves. The reader only consumes a frame once all 8 bytes have arrived, so
//! a report is never split across monitor ticks.

use crate::error::ChannelError;
use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender, TryRecvError};
use std::collections::VecDeque;
use std::time::Duration;

/// Size of one encoded frame in bytes.
pub const FRAME_LEN: usize = 2 * std::mem::size_of::<i32>();

/// Sentinel value of both frame halves for a dead worker.
pub const DEAD_SENTINEL: i32 = -1;

/// Default number of chunks the channel buffers before writes block.
pub const DEFAULT_CAPACITY: usize = 512;

/// Longest a writer waits on a full channel before dropping a report.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Raw two-field frame as it travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportFrame {
    pub processed: i32,
    pub faults: i32,
}

impl ReportFrame {
    pub fn to_bytes(self) -> [u8; FRAME_LEN] {
        let mut bytes = [0u8; FRAME_LEN];
        bytes[..4].copy_from_slice(&self.processed.to_le_bytes());
        bytes[4..].copy_from_slice(&self.faults.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; FRAME_LEN]) -> Self {
        Self {
            processed: i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            faults: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// A decoded report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    /// Products completed and faults seen since the previous report.
    Progress { processed: u32, faults: u32 },
    /// The worker failed to start or crashed.
    Dead,
}

impl Report {
    /// Builds a progress report, saturating counts that do not fit the wire.
    pub fn progress(processed: u64, faults: u64) -> Self {
        Report::Progress {
            processed: processed.min(i32::MAX as u64) as u32,
            faults: faults.min(i32::MAX as u64) as u32,
        }
    }
}

impl From<Report> for ReportFrame {
    fn from(report: Report) -> Self {
        match report {
            Report::Progress { processed, faults } => ReportFrame {
                processed: processed.min(i32::MAX as u32) as i32,
                faults: faults.min(i32::MAX as u32) as i32,
            },
            Report::Dead => ReportFrame {
                processed: DEAD_SENTINEL,
                faults: DEAD_SENTINEL,
            },
        }
    }
}

impl From<ReportFrame> for Report {
    fn from(frame: ReportFrame) -> Self {
        if frame.processed == DEAD_SENTINEL {
            Report::Dead
        } else {
            Report::Progress {
                processed: frame.processed.max(0) as u32,
                faults: frame.faults.max(0) as u32,
            }
        }
    }
}

/// Creates a report channel holding up to `capacity` pending writes.
pub fn report_channel(capacity: usize) -> (ReportWriter, ReportReader) {
    let (tx, rx) = channel::bounded(capacity);
    (
        ReportWriter {
            tx,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        },
        ReportReader {
            rx,
            pending: VecDeque::with_capacity(FRAME_LEN * 4),
            writer_closed: false,
        },
    )
}

/// Write end, owned by exactly one worker. Dropping it closes the channel.
#[derive(Debug)]
pub struct ReportWriter {
    tx: Sender<Vec<u8>>,
    write_timeout: Duration,
}

impl ReportWriter {
    /// Sets how long a write may wait on a full channel.
    #[cfg(test)]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sends one report as a single 8-byte write.
    ///
    /// Returns `ChannelError::Closed` once the reader is gone and
    /// `ChannelError::Full` if the channel stayed full for the write timeout.
    pub fn send(&self, report: Report) -> Result<(), ChannelError> {
        self.write_bytes(&ReportFrame::from(report).to_bytes())
    }

    /// Writes raw bytes as one chunk. Frames are normally written whole;
    /// this is also what lets tests produce a partial frame.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        match self.tx.send_timeout(bytes.to_vec(), self.write_timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Disconnected(_)) => Err(ChannelError::Closed),
            Err(SendTimeoutError::Timeout(_)) => Err(ChannelError::Full),
        }
    }
}

/// Read end, owned by the monitor.
#[derive(Debug)]
pub struct ReportReader {
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    writer_closed: bool,
}

impl ReportReader {
    /// Moves everything the writer has sent so far into the local buffer.
    fn fill(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(chunk) => self.pending.extend(chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.writer_closed = true;
                    break;
                }
            }
        }
    }

    /// Reports how many bytes can be read without blocking.
    ///
    /// Fails with `ChannelError::Broken` when the writer is gone and no
    /// complete frame remains, which is distinct from `Ok(0)` (no data yet).
    pub fn peek(&mut self) -> Result<usize, ChannelError> {
        self.fill();
        if self.writer_closed && self.pending.len() < FRAME_LEN {
            return Err(ChannelError::Broken);
        }
        Ok(self.pending.len())
    }

    /// Reads one whole frame. Only call after `peek` confirmed `FRAME_LEN`
    /// bytes; anything less is a protocol error and nothing is consumed.
    pub fn read_frame(&mut self) -> Result<ReportFrame, ChannelError> {
        if self.pending.len() < FRAME_LEN {
            return Err(ChannelError::ShortRead {
                available: self.pending.len(),
            });
        }
        let mut bytes = [0u8; FRAME_LEN];
        for byte in bytes.iter_mut() {
            // Length checked above.
            *byte = self.pending.pop_front().unwrap_or_default();
        }
        Ok(ReportFrame::from_bytes(bytes))
    }
}
