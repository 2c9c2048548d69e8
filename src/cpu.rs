//! Host CPU reference engine.
//!
//! Treats every logical core as a burnable device. Products are computed
//! with a plain triple loop on the worker's own thread, so completion is
//! immediate once `submit` returns. Useful on machines without a GPU and
//! for exercising the whole supervisor end to end.

use crate::config::Precision;
use crate::error::EngineError;
use crate::matrices::{InputMatrices, MatrixData};
use crate::traits::{ComputeEngine, DeviceInfo, DeviceSession, COMPLETION_SLOTS};
use log::debug;

/// Side length of the matrices multiplied on the host.
pub const CPU_MATRIX_SIZE: usize = 256;

/// Memory each core pretends to have (8 MiB).
pub const CPU_DEVICE_MEMORY: u64 = 8 * 1024 * 1024;

/// CPU engine configuration.
#[derive(Debug, Clone)]
pub struct CpuEngine {
    devices: usize,
    matrix_size: usize,
    memory: u64,
}

impl Default for CpuEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuEngine {
    /// One device per logical core.
    pub fn new() -> Self {
        Self {
            devices: num_cpus::get(),
            matrix_size: CPU_MATRIX_SIZE,
            memory: CPU_DEVICE_MEMORY,
        }
    }

    #[cfg(test)]
    pub fn with_devices(mut self, devices: usize) -> Self {
        self.devices = devices;
        self
    }

    #[cfg(test)]
    pub fn with_matrix_size(mut self, size: usize) -> Self {
        self.matrix_size = size;
        self
    }

    #[cfg(test)]
    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory = bytes;
        self
    }
}

impl ComputeEngine for CpuEngine {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>, EngineError> {
        Ok((0..self.devices)
            .map(|index| DeviceInfo {
                index,
                name: format!("CPU core {}", index),
                total_memory: Some(self.memory),
                detail: "host reference".to_string(),
            })
            .collect())
    }

    fn device_count(&self) -> Result<usize, EngineError> {
        Ok(self.devices)
    }

    fn matrix_size(&self) -> usize {
        self.matrix_size
    }

    fn initialize(
        &self,
        device: usize,
        precision: Precision,
        use_tensor_path: bool,
    ) -> Result<Box<dyn DeviceSession>, EngineError> {
        if device >= self.devices {
            return Err(EngineError::DeviceNotFound {
                index: device,
                available: (0..self.devices).map(|i| format!("CPU core {}", i)).collect(),
            });
        }
        if use_tensor_path {
            debug!("CPU core {}: no tensor path, ignoring hint", device);
        }
        let session: Box<dyn DeviceSession> = match precision {
            Precision::Single => Box::new(CpuSession::<f32>::new(device, self.memory, precision)),
            Precision::Double => Box::new(CpuSession::<f64>::new(device, self.memory, precision)),
        };
        Ok(session)
    }
}

/// Element type the host session can burn.
trait Scalar: Copy + Default + Send + 'static {
    fn operands(data: &MatrixData) -> Option<(&[Self], &[Self])>;
    fn accumulate(self, a: Self, b: Self) -> Self;
    fn distance(self, other: Self) -> f64;
}

impl Scalar for f32 {
    fn operands(data: &MatrixData) -> Option<(&[Self], &[Self])> {
        match data {
            MatrixData::Single { a, b } => Some((a.as_slice(), b.as_slice())),
            MatrixData::Double { .. } => None,
        }
    }

    fn accumulate(self, a: Self, b: Self) -> Self {
        self + a * b
    }

    fn distance(self, other: Self) -> f64 {
        (self - other).abs() as f64
    }
}

impl Scalar for f64 {
    fn operands(data: &MatrixData) -> Option<(&[Self], &[Self])> {
        match data {
            MatrixData::Double { a, b } => Some((a.as_slice(), b.as_slice())),
            MatrixData::Single { .. } => None,
        }
    }

    fn accumulate(self, a: Self, b: Self) -> Self {
        self + a * b
    }

    fn distance(self, other: Self) -> f64 {
        (self - other).abs()
    }
}

/// `c = a * b` for row-major `n x n` matrices.
fn multiply<T: Scalar>(n: usize, a: &[T], b: &[T], c: &mut [T]) {
    c.fill(T::default());
    for i in 0..n {
        let row = &mut c[i * n..(i + 1) * n];
        for k in 0..n {
            let aik = a[i * n + k];
            let b_row = &b[k * n..(k + 1) * n];
            for (cij, &bkj) in row.iter_mut().zip(b_row) {
                *cij = cij.accumulate(aik, bkj);
            }
        }
    }
}

/// Counts elements of every result after the first that differ from the
/// first result by more than `tolerance`.
fn count_faults<T: Scalar>(results: &[Vec<T>], tolerance: f64) -> u64 {
    let Some((reference, rest)) = results.split_first() else {
        return 0;
    };
    rest.iter()
        .map(|result| {
            result
                .iter()
                .zip(reference)
                .filter(|(x, r)| x.distance(**r) > tolerance)
                .count() as u64
        })
        .sum()
}

struct CpuSession<T> {
    device: usize,
    memory: u64,
    precision: Precision,
    size: usize,
    a: Vec<T>,
    b: Vec<T>,
    results: Vec<Vec<T>>,
    slots: [Option<u64>; COMPLETION_SLOTS],
}

impl<T: Scalar> CpuSession<T> {
    fn new(device: usize, memory: u64, precision: Precision) -> Self {
        Self {
            device,
            memory,
            precision,
            size: 0,
            a: Vec::new(),
            b: Vec::new(),
            results: Vec::new(),
            slots: [None; COMPLETION_SLOTS],
        }
    }
}

impl<T: Scalar> DeviceSession for CpuSession<T> {
    fn total_memory(&self) -> Result<u64, EngineError> {
        Ok(self.memory)
    }

    fn available_memory(&self) -> Result<u64, EngineError> {
        Ok(self.memory)
    }

    fn upload(&mut self, inputs: &InputMatrices, result_count: usize) -> Result<(), EngineError> {
        let (a, b) =
            T::operands(inputs.data()).ok_or_else(|| EngineError::UnsupportedPrecision {
                device: self.device,
                precision: inputs.precision().to_string(),
            })?;
        let size = inputs.size();
        self.size = size;
        self.a = a.to_vec();
        self.b = b.to_vec();
        self.results = vec![vec![T::default(); size * size]; result_count];
        Ok(())
    }

    fn submit(&mut self, slot: usize) -> Result<(), EngineError> {
        if self.results.is_empty() {
            return Err(EngineError::BufferAllocation(
                "submit before upload".to_string(),
            ));
        }
        for result in &mut self.results {
            multiply(self.size, &self.a, &self.b, result);
        }
        let faults = count_faults(&self.results, self.precision.tolerance());
        self.slots[slot] = Some(faults);
        Ok(())
    }

    fn poll_completion(&mut self, slot: usize) -> Result<Option<u64>, EngineError> {
        self.slots[slot]
            .take()
            .map(Some)
            .ok_or(EngineError::NotSubmitted(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let engine = CpuEngine::new();
        assert_eq!(engine.name(), "cpu");
        assert_eq!(engine.matrix_size(), CPU_MATRIX_SIZE);
        assert!(engine.device_count().unwrap() > 0);
    }

    #[test]
    fn test_devices_listing() {
        let engine = CpuEngine::new().with_devices(3);
        let devices = engine.devices().unwrap();
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[2].index, 2);
        assert!(devices[2].to_string().starts_with("ID 2: CPU core 2, "));
    }

    #[test]
    fn test_unknown_device() {
        let engine = CpuEngine::new().with_devices(2);
        assert!(matches!(
            engine.initialize(5, Precision::Single, false),
            Err(EngineError::DeviceNotFound { index: 5, .. })
        ));
    }

    #[test]
    fn test_multiply_small() {
        // [1 2; 3 4] * [5 6; 7 8]
        let a = [1.0f64, 2.0, 3.0, 4.0];
        let b = [5.0f64, 6.0, 7.0, 8.0];
        let mut c = [0.0f64; 4];
        multiply(2, &a, &b, &mut c);
        assert_eq!(c, [19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_count_faults() {
        let good = vec![1.0f32; 16];
        let mut bad = good.clone();
        bad[3] += 0.5;
        bad[7] += 0.0001;
        assert_eq!(count_faults(&[good.clone(), good.clone()], 1e-3), 0);
        assert_eq!(count_faults(&[good.clone(), bad.clone(), bad], 1e-3), 2);
        assert_eq!(count_faults::<f32>(&[], 1e-3), 0);
    }

    #[test]
    fn test_session_iteration_is_clean() {
        let engine = CpuEngine::new().with_devices(1).with_matrix_size(16);
        for precision in [Precision::Single, Precision::Double] {
            let inputs = InputMatrices::generate(16, precision);
            let mut session = engine.initialize(0, precision, true).unwrap();
            session.upload(&inputs, 4).unwrap();

            session.submit(0).unwrap();
            assert_eq!(session.poll_completion(0).unwrap(), Some(0));
            assert!(matches!(
                session.poll_completion(0),
                Err(EngineError::NotSubmitted(0))
            ));
        }
    }

    #[test]
    fn test_precision_mismatch() {
        let engine = CpuEngine::new().with_devices(1).with_matrix_size(8);
        let inputs = InputMatrices::generate(8, Precision::Double);
        let mut session = engine.initialize(0, Precision::Single, false).unwrap();
        assert!(matches!(
            session.upload(&inputs, 2),
            Err(EngineError::UnsupportedPrecision { .. })
        ));
    }

    #[test]
    fn test_submit_before_upload() {
        let engine = CpuEngine::new().with_devices(1);
        let mut session = engine.initialize(0, Precision::Single, false).unwrap();
        assert!(session.submit(0).is_err());
    }
}
