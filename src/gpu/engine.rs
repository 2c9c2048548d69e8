//! wgpu compute engine.
//!
//! Each session owns its own `Device` and `Queue` on one adapter. An
//! iteration is a single command buffer: `result_count` matmul dispatches,
//! one compare dispatch per result after the first, and a copy of the slot's
//! fault counter into its staging buffer. Completion is detected by mapping
//! that staging buffer without blocking.

use crate::config::Precision;
use crate::error::EngineError;
use crate::gpu::buffers::{BurnBuffers, FAULT_COUNTER_SIZE};
use crate::gpu::device::{
    describe, enumerate_adapters, nvidia_ordinals, query_nvidia_memory, MemoryInfo,
};
use crate::gpu::shaders::{BurnPipelines, COMPARE_WGSL, COMPARE_WORKGROUP_SIZE, MATMUL_TILE};
use crate::matrices::InputMatrices;
use crate::traits::{ComputeEngine, DeviceInfo, DeviceSession, COMPLETION_SLOTS};
use log::{debug, info, warn};
use pollster::block_on;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use wgpu::{Adapter, BindGroup, BufferAsyncError, Device, Instance, InstanceDescriptor, Queue};

/// Side length of the matrices multiplied on the GPU.
pub const GPU_MATRIX_SIZE: usize = 2048;

/// Most workgroups one compare dispatch may use in x.
const MAX_COMPARE_WORKGROUPS: u32 = 65_535;

/// Burns the GPUs wgpu can see.
pub struct GpuEngine {
    _instance: Instance,
    adapters: Vec<Adapter>,
    nvidia: Vec<Option<usize>>,
    matrix_size: usize,
    compare_source: String,
}

impl Default for GpuEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuEngine {
    /// Enumerates the adapters once; device indices refer to this list.
    pub fn new() -> Self {
        let instance = Instance::new(&InstanceDescriptor::default());
        let adapters = enumerate_adapters(&instance);
        let vendors: Vec<u32> = adapters.iter().map(|a| a.get_info().vendor).collect();
        Self {
            nvidia: nvidia_ordinals(&vendors),
            _instance: instance,
            adapters,
            matrix_size: GPU_MATRIX_SIZE,
            compare_source: COMPARE_WGSL.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_matrix_size(mut self, size: usize) -> Self {
        self.matrix_size = size;
        self
    }

    /// Replaces the built-in comparison kernel with the WGSL file at `path`.
    ///
    /// The kernel must use the same bindings and a `compare` entry point.
    pub fn with_compare_kernel(mut self, path: &Path) -> Result<Self, EngineError> {
        self.compare_source =
            std::fs::read_to_string(path).map_err(|e| EngineError::KernelFile {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(self)
    }

    fn memory(&self, device: usize) -> Option<MemoryInfo> {
        self.nvidia
            .get(device)
            .copied()
            .flatten()
            .and_then(query_nvidia_memory)
    }
}

impl ComputeEngine for GpuEngine {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>, EngineError> {
        Ok(self
            .adapters
            .iter()
            .enumerate()
            .map(|(index, adapter)| describe(index, &adapter.get_info(), self.memory(index)))
            .collect())
    }

    fn device_count(&self) -> Result<usize, EngineError> {
        Ok(self.adapters.len())
    }

    fn matrix_size(&self) -> usize {
        self.matrix_size
    }

    /// nvidia-smi only rotates over NVIDIA GPUs, in their own order.
    fn temperature_slot(&self, device: usize) -> Option<usize> {
        self.nvidia.get(device).copied().flatten()
    }

    fn initialize(
        &self,
        device: usize,
        precision: Precision,
        use_tensor_path: bool,
    ) -> Result<Box<dyn DeviceSession>, EngineError> {
        let adapter = self
            .adapters
            .get(device)
            .ok_or_else(|| EngineError::DeviceNotFound {
                index: device,
                available: self.adapters.iter().map(|a| a.get_info().name).collect(),
            })?;

        let mut required_features = wgpu::Features::empty();
        if precision == Precision::Double {
            if !adapter.features().contains(wgpu::Features::SHADER_F64) {
                return Err(EngineError::UnsupportedPrecision {
                    device,
                    precision: precision.to_string(),
                });
            }
            required_features |= wgpu::Features::SHADER_F64;
        }
        if use_tensor_path {
            info!("Device {}: no tensor core path under wgpu, ignoring", device);
        }

        let (gpu, queue) = block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("gpuburn"),
            required_features,
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
        }))
        .map_err(|e| EngineError::DeviceRequest(e.to_string()))?;

        let pipelines = BurnPipelines::new(&gpu, precision, &self.compare_source)?;

        let memory = self.memory(device).unwrap_or_else(|| {
            debug!(
                "Device {}: memory not queryable, assuming {}",
                device,
                bytesize::ByteSize::b(MemoryInfo::fallback().total)
            );
            MemoryInfo::fallback()
        });

        Ok(Box::new(GpuSession {
            index: device,
            device: gpu,
            queue,
            pipelines,
            memory,
            state: None,
            slots: std::array::from_fn(|_| None),
        }))
    }
}

/// Buffers plus the bind groups that reference them.
struct Loaded {
    buffers: BurnBuffers,
    matmul_groups: Vec<BindGroup>,
    /// Per slot, one group per result after the first.
    compare_groups: [Vec<BindGroup>; COMPLETION_SLOTS],
    matmul_workgroups: u32,
    compare_workgroups: u32,
}

type MapResult = Result<(), BufferAsyncError>;

struct GpuSession {
    index: usize,
    device: Device,
    queue: Queue,
    pipelines: BurnPipelines,
    memory: MemoryInfo,
    state: Option<Loaded>,
    slots: [Option<Receiver<MapResult>>; COMPLETION_SLOTS],
}

impl GpuSession {
    fn loaded(&self) -> Result<&Loaded, EngineError> {
        self.state.as_ref().ok_or_else(|| {
            EngineError::Submission(format!("device {}: nothing uploaded", self.index))
        })
    }

    fn read_faults(&self, slot: usize) -> Result<u64, EngineError> {
        let staging = self.loaded()?.buffers.staging(slot);
        let data = staging.slice(..).get_mapped_range();
        let faults: u32 = bytemuck::pod_read_unaligned(&data[..FAULT_COUNTER_SIZE as usize]);
        drop(data);
        staging.unmap();
        Ok(faults as u64)
    }
}

impl DeviceSession for GpuSession {
    fn total_memory(&self) -> Result<u64, EngineError> {
        Ok(self.memory.total)
    }

    fn available_memory(&self) -> Result<u64, EngineError> {
        Ok(self.memory.free)
    }

    fn upload(&mut self, inputs: &InputMatrices, result_count: usize) -> Result<(), EngineError> {
        let buffers = BurnBuffers::new(&self.device, inputs, result_count)?;
        debug!(
            "Device {}: allocated {} for {} results",
            self.index,
            bytesize::ByteSize::b(buffers.total_bytes()),
            result_count
        );

        let matmul_groups = buffers
            .results()
            .iter()
            .map(|result| {
                self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("matmul_bind_group"),
                    layout: self.pipelines.matmul_bind_group_layout(),
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: buffers.params().as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: buffers.a().as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: buffers.b().as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 3,
                            resource: result.as_entire_binding(),
                        },
                    ],
                })
            })
            .collect();

        let compare_groups = std::array::from_fn(|slot| {
            let (reference, rest) = match buffers.results().split_first() {
                Some(split) => split,
                None => return Vec::new(),
            };
            rest.iter()
                .map(|candidate| {
                    self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                        label: Some("compare_bind_group"),
                        layout: self.pipelines.compare_bind_group_layout(),
                        entries: &[
                            wgpu::BindGroupEntry {
                                binding: 0,
                                resource: buffers.params().as_entire_binding(),
                            },
                            wgpu::BindGroupEntry {
                                binding: 1,
                                resource: reference.as_entire_binding(),
                            },
                            wgpu::BindGroupEntry {
                                binding: 2,
                                resource: candidate.as_entire_binding(),
                            },
                            wgpu::BindGroupEntry {
                                binding: 3,
                                resource: buffers.faults(slot).as_entire_binding(),
                            },
                        ],
                    })
                })
                .collect()
        });

        let n = inputs.size() as u32;
        let elements = (inputs.size() * inputs.size()) as u32;
        self.state = Some(Loaded {
            matmul_groups,
            compare_groups,
            matmul_workgroups: n.div_ceil(MATMUL_TILE),
            compare_workgroups: elements
                .div_ceil(COMPARE_WORKGROUP_SIZE)
                .clamp(1, MAX_COMPARE_WORKGROUPS),
            buffers,
        });
        debug!(
            "Device {}: uploaded {} matrices",
            self.index,
            result_count + 2
        );
        Ok(())
    }

    fn submit(&mut self, slot: usize) -> Result<(), EngineError> {
        if self.slots[slot].is_some() {
            return Err(EngineError::Submission(format!(
                "device {}: slot {} still in flight",
                self.index, slot
            )));
        }
        let loaded = self.loaded()?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("burn_encoder"),
            });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("matmul_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(self.pipelines.matmul_pipeline());
            for group in &loaded.matmul_groups {
                pass.set_bind_group(0, group, &[]);
                pass.dispatch_workgroups(loaded.matmul_workgroups, loaded.matmul_workgroups, 1);
            }
        }

        encoder.clear_buffer(loaded.buffers.faults(slot), 0, None);

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("compare_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(self.pipelines.compare_pipeline());
            for group in &loaded.compare_groups[slot] {
                pass.set_bind_group(0, group, &[]);
                pass.dispatch_workgroups(loaded.compare_workgroups, 1, 1);
            }
        }

        encoder.copy_buffer_to_buffer(
            loaded.buffers.faults(slot),
            0,
            loaded.buffers.staging(slot),
            0,
            FAULT_COUNTER_SIZE,
        );

        self.queue.submit(Some(encoder.finish()));

        let (tx, rx) = mpsc::channel();
        loaded
            .buffers
            .staging(slot)
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                tx.send(result).ok();
            });

        if let Some(e) = block_on(self.device.pop_error_scope()) {
            return Err(EngineError::Submission(e.to_string()));
        }

        self.slots[slot] = Some(rx);
        Ok(())
    }

    fn poll_completion(&mut self, slot: usize) -> Result<Option<u64>, EngineError> {
        let rx = self.slots[slot]
            .as_ref()
            .ok_or(EngineError::NotSubmitted(slot))?;

        if let Err(e) = self.device.poll(wgpu::PollType::Poll) {
            warn!("Device {}: poll failed: {}", self.index, e);
            return Err(EngineError::DeviceLost);
        }

        match rx.try_recv() {
            Ok(Ok(())) => {
                self.slots[slot] = None;
                self.read_faults(slot).map(Some)
            }
            Ok(Err(e)) => {
                self.slots[slot] = None;
                Err(EngineError::BufferMapping(e.to_string()))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.slots[slot] = None;
                Err(EngineError::DeviceLost)
            }
        }
    }
}
