//! GPU compute engine built on wgpu.
//!
//! Runs the burn workload as WGSL compute shaders on any adapter wgpu can
//! drive (Vulkan, Metal, DX12).

pub mod buffers;
pub mod device;
pub mod engine;
pub mod shaders;

pub use engine::{GpuEngine, GPU_MATRIX_SIZE};
