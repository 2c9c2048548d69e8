//! GPU buffers for one burn session.
//!
//! Holds the two input matrices, one buffer per result matrix, the shared
//! parameter uniform and, for each completion slot, a fault counter plus a
//! staging buffer it is copied to for readback.

use crate::error::EngineError;
use crate::matrices::{InputMatrices, MatrixData};
use crate::traits::COMPLETION_SLOTS;
use pollster::block_on;
use wgpu::util::{BufferInitDescriptor, DeviceExt};
use wgpu::{Buffer, BufferUsages, Device};

/// Parameters structure for shader uniforms.
/// Must match the Params struct in both WGSL shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BurnParams {
    /// Side length of the square matrices.
    pub n: u32,
    /// Elements per matrix (`n * n`).
    pub elements: u32,
    /// Padding for 16-byte alignment.
    pub _padding: [u32; 2],
}

impl BurnParams {
    pub fn new(n: usize) -> Self {
        Self {
            n: n as u32,
            elements: (n * n) as u32,
            _padding: [0; 2],
        }
    }
}

/// Size of one fault counter.
pub const FAULT_COUNTER_SIZE: u64 = std::mem::size_of::<u32>() as u64;

/// All device memory a session burns.
pub struct BurnBuffers {
    params: Buffer,
    a: Buffer,
    b: Buffer,
    results: Vec<Buffer>,
    faults: [Buffer; COMPLETION_SLOTS],
    staging: [Buffer; COMPLETION_SLOTS],
    matrix_bytes: u64,
}

impl BurnBuffers {
    /// Uploads the inputs and allocates `result_count` result matrices.
    ///
    /// Allocation runs inside error scopes so an out-of-memory or oversized
    /// buffer comes back as `EngineError::BufferAllocation` instead of
    /// aborting the process.
    pub fn new(
        device: &Device,
        inputs: &InputMatrices,
        result_count: usize,
    ) -> Result<Self, EngineError> {
        let matrix_bytes = inputs.matrix_bytes();

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);

        let params = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("burn_params"),
            contents: bytemuck::bytes_of(&BurnParams::new(inputs.size())),
            usage: BufferUsages::UNIFORM,
        });

        let (a_bytes, b_bytes): (&[u8], &[u8]) = match inputs.data() {
            MatrixData::Single { a, b } => (bytemuck::cast_slice(a), bytemuck::cast_slice(b)),
            MatrixData::Double { a, b } => (bytemuck::cast_slice(a), bytemuck::cast_slice(b)),
        };
        let a = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("matrix_a"),
            contents: a_bytes,
            usage: BufferUsages::STORAGE,
        });
        let b = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("matrix_b"),
            contents: b_bytes,
            usage: BufferUsages::STORAGE,
        });

        let results = (0..result_count)
            .map(|i| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("result_{}", i)),
                    size: matrix_bytes,
                    usage: BufferUsages::STORAGE,
                    mapped_at_creation: false,
                })
            })
            .collect();

        let faults = std::array::from_fn(|slot| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&format!("faults_{}", slot)),
                size: FAULT_COUNTER_SIZE,
                usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });
        let staging = std::array::from_fn(|slot| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&format!("faults_staging_{}", slot)),
                size: FAULT_COUNTER_SIZE,
                usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });

        let oom = block_on(device.pop_error_scope());
        let invalid = block_on(device.pop_error_scope());
        if let Some(e) = oom.or(invalid) {
            return Err(EngineError::BufferAllocation(e.to_string()));
        }

        Ok(Self {
            params,
            a,
            b,
            results,
            faults,
            staging,
            matrix_bytes,
        })
    }

    pub fn params(&self) -> &Buffer {
        &self.params
    }

    pub fn a(&self) -> &Buffer {
        &self.a
    }

    pub fn b(&self) -> &Buffer {
        &self.b
    }

    pub fn results(&self) -> &[Buffer] {
        &self.results
    }

    /// Fault counter written by the compare passes of `slot`.
    pub fn faults(&self, slot: usize) -> &Buffer {
        &self.faults[slot]
    }

    /// CPU-readable copy of the fault counter of `slot`.
    pub fn staging(&self, slot: usize) -> &Buffer {
        &self.staging[slot]
    }

    /// Bytes held by the inputs and results.
    pub fn total_bytes(&self) -> u64 {
        self.matrix_bytes * (2 + self.results.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Precision;
    use crate::gpu::device::enumerate_adapters;
    use wgpu::{Instance, InstanceDescriptor};

    fn setup_device() -> Option<Device> {
        let instance = Instance::new(&InstanceDescriptor::default());
        let adapter = enumerate_adapters(&instance).into_iter().next()?;

        let (device, _queue) = block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("test device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::Off,
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
        }))
        .ok()?;

        Some(device)
    }

    #[test]
    fn test_burn_params_size() {
        // Must be 16 bytes for uniform alignment
        assert_eq!(std::mem::size_of::<BurnParams>(), 16);
    }

    #[test]
    fn test_burn_params_values() {
        let params = BurnParams::new(2048);
        assert_eq!(params.n, 2048);
        assert_eq!(params.elements, 2048 * 2048);
    }

    #[test]
    fn test_buffer_allocation() {
        let Some(device) = setup_device() else {
            println!("No GPU available, skipping buffer allocation test");
            return;
        };

        let inputs = InputMatrices::generate(64, Precision::Single);
        let buffers = BurnBuffers::new(&device, &inputs, 3).unwrap();
        assert_eq!(buffers.results().len(), 3);
        assert_eq!(buffers.total_bytes(), 5 * 64 * 64 * 4);
    }

    #[test]
    fn test_oversized_buffer_is_caught_by_scope() {
        let Some(device) = setup_device() else {
            println!("No GPU available, skipping oversized buffer test");
            return;
        };

        // Far beyond the default max_buffer_size.
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let _huge = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("huge"),
            size: 1 << 40,
            usage: BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        assert!(block_on(device.pop_error_scope()).is_some());
    }
}
