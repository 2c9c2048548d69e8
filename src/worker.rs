//! Burn worker: one thread per device.
//!
//! A worker opens a session on its device, sizes the result buffers from
//! the memory budget and then loops compute, verify and report until the
//! shared stop signal is lowered. It never touches monitor state; everything
//! it has to say goes through its report channel.

use crate::channel::{Report, ReportWriter};
use crate::config::{MemoryBudget, Precision};
use crate::error::{ChannelError, EngineError};
use crate::matrices::InputMatrices;
use crate::traits::{ComputeEngine, DeviceSession, COMPLETION_SLOTS};
use bytesize::ByteSize;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Iterations run before the first report is sent.
pub const WARMUP_ITERATIONS: u64 = 2;

/// Sleep between completion checks.
const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Cooperative stop flag shared by the monitor and all workers.
///
/// Starts raised; the monitor lowers it once to ask every worker to stop.
#[derive(Debug, Clone)]
pub struct StopSignal {
    running: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Returns true while workers should keep burning.
    pub fn should_run(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Asks every worker holding this signal to stop.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// How a worker thread ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stopped on request or because the monitor went away.
    Stopped,
    /// The device could not be set up.
    InitFailed,
    /// An engine call failed while burning.
    ComputeFailed,
}

impl WorkerExit {
    /// Thread exit status (ECONNREFUSED for compute failures, EMEDIUMTYPE for init).
    pub fn code(&self) -> i32 {
        match self {
            WorkerExit::Stopped => 0,
            WorkerExit::InitFailed => 124,
            WorkerExit::ComputeFailed => 111,
        }
    }
}

/// Per-worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Device index within the engine.
    pub device: usize,
    pub precision: Precision,
    /// Hint to use a tensor-core style path if the engine has one.
    pub use_tensor_path: bool,
    pub memory: MemoryBudget,
    /// Longest wait for one iteration's completion. Unbounded when `None`,
    /// since an iteration's length grows with the memory budget.
    pub completion_timeout: Option<Duration>,
}

/// Number of result matrices that fit `budget` next to the two inputs.
///
/// Needs room for at least three matrices of `result_size` bytes.
pub fn result_buffer_count(budget: u64, result_size: u64) -> Result<usize, EngineError> {
    let needed = result_size.saturating_mul(3);
    if result_size == 0 || budget < needed {
        return Err(EngineError::InsufficientMemory { budget, needed });
    }
    Ok(((budget - 2 * result_size) / result_size) as usize)
}

/// Runs a worker to completion. This is the body of a worker thread.
///
/// Construction and steady-state failures are logged and turned into a
/// dead report; the writer is dropped on return, closing the channel.
pub fn run(
    engine: &dyn ComputeEngine,
    inputs: &InputMatrices,
    config: WorkerConfig,
    writer: ReportWriter,
    stop: StopSignal,
) -> WorkerExit {
    let device = config.device;
    let mut worker = match Worker::new(engine, inputs, config, stop) {
        Ok(worker) => worker,
        Err(e) => {
            error!("Couldn't init a burn test on device {}: {}", device, e);
            if let Err(e) = writer.send(Report::Dead) {
                debug!("Device {}: dead report not delivered: {}", device, e);
            }
            return WorkerExit::InitFailed;
        }
    };

    match worker.burn(&writer) {
        Ok(()) => {
            info!("Device {}: burn stopped", device);
            WorkerExit::Stopped
        }
        Err(e) => {
            error!("Failure during compute on device {}: {}", device, e);
            if let Err(e) = writer.send(Report::Dead) {
                debug!("Device {}: dead report not delivered: {}", device, e);
            }
            WorkerExit::ComputeFailed
        }
    }
}

/// A device session sized and loaded for burning.
pub struct Worker {
    config: WorkerConfig,
    session: Box<dyn DeviceSession>,
    result_count: usize,
    stop: StopSignal,
}

impl Worker {
    /// Opens the device, resolves the memory budget and uploads the inputs.
    pub fn new(
        engine: &dyn ComputeEngine,
        inputs: &InputMatrices,
        config: WorkerConfig,
        stop: StopSignal,
    ) -> Result<Self, EngineError> {
        let mut session =
            engine.initialize(config.device, config.precision, config.use_tensor_path)?;

        let available = session.available_memory()?;
        let budget = config.memory.resolve(available);
        let result_size = inputs.matrix_bytes();
        let result_count = result_buffer_count(budget, result_size)?;

        info!(
            "Initialized device {} with {} of memory ({} available, using {}), using {}{}",
            config.device,
            ByteSize::b(session.total_memory()?),
            ByteSize::b(available),
            ByteSize::b(budget),
            config.precision.label(),
            if config.use_tensor_path {
                ", using Tensor Cores"
            } else {
                ""
            }
        );
        info!(
            "Device {}: results are {} bytes each, thus performing {} products per iteration",
            config.device, result_size, result_count
        );

        session.upload(inputs, result_count)?;

        Ok(Self {
            config,
            session,
            result_count,
            stop,
        })
    }

    /// Matrix products per iteration.
    #[cfg(test)]
    pub fn result_count(&self) -> usize {
        self.result_count
    }

    /// Burns until the stop signal is lowered or the reader disappears.
    ///
    /// Two completion slots keep one iteration in flight while the previous
    /// one is confirmed, so compute and verify overlap across iterations.
    pub fn burn(&mut self, writer: &ReportWriter) -> Result<(), EngineError> {
        let mut in_flight = [false; COMPLETION_SLOTS];
        let mut slot = 0;
        let mut iterations = 0u64;
        let mut unreported_products = 0u64;
        let mut unreported_faults = 0u64;

        while self.stop.should_run() {
            self.session.submit(slot)?;
            in_flight[slot] = true;
            slot = (slot + 1) % COMPLETION_SLOTS;

            if in_flight[slot] {
                let faults = self.await_slot(slot)?;
                in_flight[slot] = false;
                unreported_products += self.result_count as u64;
                unreported_faults += faults;
            }

            iterations += 1;
            if iterations <= WARMUP_ITERATIONS {
                continue;
            }

            match writer.send(Report::progress(unreported_products, unreported_faults)) {
                Ok(()) => {
                    unreported_products = 0;
                    unreported_faults = 0;
                }
                Err(ChannelError::Closed) => {
                    debug!(
                        "Device {}: monitor closed the report channel",
                        self.config.device
                    );
                    break;
                }
                Err(e) => {
                    warn!(
                        "Device {}: failed to write report: {}",
                        self.config.device, e
                    );
                }
            }
        }

        for (slot, busy) in in_flight.iter().enumerate() {
            if *busy {
                self.await_slot(slot)?;
            }
        }
        Ok(())
    }

    /// Waits for the iteration on `slot` and returns its fault count.
    fn await_slot(&mut self, slot: usize) -> Result<u64, EngineError> {
        let start = Instant::now();
        loop {
            if let Some(faults) = self.session.poll_completion(slot)? {
                return Ok(faults);
            }
            if let Some(limit) = self.config.completion_timeout {
                if start.elapsed() > limit {
                    return Err(EngineError::Timeout(limit));
                }
            }
            std::thread::sleep(COMPLETION_POLL_INTERVAL);
        }
    }
}
