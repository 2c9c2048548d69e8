//! Error types for GPU burn runs.
//!
//! Worker-local failures never unwind into the monitor: they are turned into
//! sentinel reports. The types here cover the paths that do propagate.

use std::time::Duration;
use thiserror::Error;

/// Process exit codes.
pub mod exit_code {
    /// Normal completion.
    pub const OK: i32 = 0;
    /// Generic failure.
    pub const FAILURE: i32 = 1;
    /// No device could be burned (ENODEV).
    pub const NO_WORKERS: i32 = 19;
    /// Command line could not be parsed, or combines options that cannot
    /// work together such as `--compare-kernel` with `--cpu` (EINVAL).
    pub const SYNTAX: i32 = 22;
    /// Every worker died before the run budget elapsed (ENOMEDIUM).
    pub const ALL_DEAD: i32 = 123;
}

/// Unified error type for gpuburn operations.
#[derive(Error, Debug)]
pub enum BurnError {
    /// Options that parse but cannot be combined. Exits like a syntax error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Compute engine error outside of a worker.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Not a single worker could be spawned.
    #[error("Failed to start any burn workers")]
    NoWorkers,

    /// All workers died before the time budget elapsed.
    #[error("No clients are alive! Aborting")]
    AllWorkersDead,
}

impl BurnError {
    /// Returns the process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            BurnError::NoWorkers | BurnError::Engine(EngineError::NoDevices) => {
                exit_code::NO_WORKERS
            }
            BurnError::AllWorkersDead => exit_code::ALL_DEAD,
            BurnError::Config(_) => exit_code::SYNTAX,
            _ => exit_code::FAILURE,
        }
    }
}

/// Compute engine errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No compute device found.
    #[error("No compute devices found")]
    NoDevices,

    /// Specified device not found.
    #[error("Device {index} not found (available: {available:?})")]
    DeviceNotFound {
        index: usize,
        available: Vec<String>,
    },

    /// Failed to open the device.
    #[error("Failed to request device: {0}")]
    DeviceRequest(String),

    /// Device cannot run the requested precision.
    #[error("Device {device} does not support {precision} precision")]
    UnsupportedPrecision { device: usize, precision: String },

    /// Memory budget cannot hold the inputs plus one result.
    #[error("Low memory for results: budget {budget} bytes, need at least {needed} bytes")]
    InsufficientMemory { budget: u64, needed: u64 },

    /// Buffer allocation failed.
    #[error("Buffer allocation failed: {0}")]
    BufferAllocation(String),

    /// Shader compilation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Comparison kernel file could not be read.
    #[error("Couldn't read compare kernel {path}: {reason}")]
    KernelFile { path: String, reason: String },

    /// Buffer mapping failed.
    #[error("Buffer mapping failed: {0}")]
    BufferMapping(String),

    /// Work could not be encoded or submitted.
    #[error("Command submission failed: {0}")]
    Submission(String),

    /// Device lost during the run.
    #[error("Device lost during burn (possible driver crash or timeout)")]
    DeviceLost,

    /// Completion confirmation took too long.
    #[error("Iteration did not complete within {0:?}")]
    Timeout(Duration),

    /// Completion was polled on a slot with nothing in flight.
    #[error("Completion slot {0} has no work in flight")]
    NotSubmitted(usize),
}

/// Report channel errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// The reader side is gone; the worker should stop.
    #[error("Report channel closed by reader")]
    Closed,

    /// The bounded channel stayed full for the whole write timeout.
    #[error("Report channel full")]
    Full,

    /// The writer side is gone and no complete frame is pending.
    #[error("Report channel broken")]
    Broken,

    /// A frame read was issued without a complete frame available.
    #[error("Short read: {available} bytes available")]
    ShortRead { available: usize },
}
