//! Core traits for compute engines.
//!
//! The supervisor never talks to a GPU API directly. Each backend (wgpu,
//! the CPU reference engine, the scripted test engine) implements
//! `ComputeEngine`, and every worker owns one `DeviceSession` for its device.

use crate::config::Precision;
use crate::error::EngineError;
use crate::matrices::InputMatrices;
use bytesize::ByteSize;
use std::fmt;

/// Number of completion slots a worker cycles through.
pub const COMPLETION_SLOTS: usize = 2;

/// Information about one burnable device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Index used with `--device`.
    pub index: usize,
    /// Device name (e.g., "NVIDIA GeForce RTX 4090").
    pub name: String,
    /// Total device memory, if the backend can tell.
    pub total_memory: Option<u64>,
    /// Backend specific detail (API, device type).
    pub detail: String,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID {}: {}", self.index, self.name)?;
        if let Some(total) = self.total_memory {
            write!(f, ", {}", ByteSize::b(total))?;
        }
        if !self.detail.is_empty() {
            write!(f, " ({})", self.detail)?;
        }
        Ok(())
    }
}

/// A backend able to open burn sessions on its devices.
///
/// Engines are shared by all worker threads; sessions are created inside
/// the worker thread that uses them.
pub trait ComputeEngine: Send + Sync {
    /// Returns the name of this engine (e.g., "wgpu", "cpu").
    fn name(&self) -> &'static str;

    /// Lists the devices this engine can burn.
    fn devices(&self) -> Result<Vec<DeviceInfo>, EngineError>;

    /// Number of devices, used when burning all of them.
    fn device_count(&self) -> Result<usize, EngineError> {
        Ok(self.devices()?.len())
    }

    /// Side length of the square matrices this engine multiplies.
    fn matrix_size(&self) -> usize;

    /// Position of `device` in the temperature source's rotation.
    ///
    /// `None` for devices the source does not report on.
    fn temperature_slot(&self, _device: usize) -> Option<usize> {
        None
    }

    /// Floating point operations performed by one matrix product.
    fn ops_per_product(&self) -> f64 {
        let n = self.matrix_size() as f64;
        2.0 * n * n * n
    }

    /// Opens a session on `device`.
    ///
    /// `use_tensor_path` is a hint; engines without such a path ignore it.
    fn initialize(
        &self,
        device: usize,
        precision: Precision,
        use_tensor_path: bool,
    ) -> Result<Box<dyn DeviceSession>, EngineError>;
}

/// One device opened for burning.
///
/// A session runs iterations of `result_count` matrix products followed by a
/// comparison pass that counts faulty elements. Completion is tracked per
/// slot so the caller can keep one iteration in flight while confirming the
/// previous one.
pub trait DeviceSession {
    /// Total memory of the device in bytes.
    fn total_memory(&self) -> Result<u64, EngineError>;

    /// Memory currently available on the device in bytes.
    fn available_memory(&self) -> Result<u64, EngineError>;

    /// Uploads the inputs and allocates `result_count` result matrices.
    fn upload(&mut self, inputs: &InputMatrices, result_count: usize) -> Result<(), EngineError>;

    /// Enqueues one compute iteration plus its comparison pass.
    fn submit(&mut self, slot: usize) -> Result<(), EngineError>;

    /// Checks whether the iteration submitted on `slot` has completed.
    ///
    /// Returns `Ok(None)` while it is still running and `Ok(Some(faults))`
    /// once, when it has finished.
    fn poll_completion(&mut self, slot: usize) -> Result<Option<u64>, EngineError>;
}
