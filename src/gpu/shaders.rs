//! WGSL kernels and compute pipelines for the burn workload.
//!
//! Both kernels are written against a `Scalar` alias so one source serves
//! single and double precision.

use crate::config::Precision;
use crate::error::EngineError;
use pollster::block_on;
use wgpu::{BindGroupLayout, ComputePipeline, Device};

/// WGSL source for the tiled matrix product.
pub const MATMUL_WGSL: &str = include_str!("../shaders/matmul.wgsl");

/// WGSL source for the built-in result comparison.
pub const COMPARE_WGSL: &str = include_str!("../shaders/compare.wgsl");

/// Side of the square matmul workgroup.
/// Must match the @workgroup_size in matmul.wgsl.
pub const MATMUL_TILE: u32 = 16;

/// Workgroup size of the compare kernel.
/// Must match the @workgroup_size in compare.wgsl.
pub const COMPARE_WORKGROUP_SIZE: u32 = 256;

/// Rewrites the `Scalar` alias and the comparison tolerance for `precision`.
///
/// Sources without these declarations are returned unchanged.
pub fn specialize(source: &str, precision: Precision) -> String {
    let scalar = match precision {
        Precision::Single => "f32",
        Precision::Double => "f64",
    };
    source
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with("alias Scalar") {
                format!("alias Scalar = {};", scalar)
            } else if trimmed.starts_with("const TOLERANCE") {
                format!("const TOLERANCE: Scalar = {:?};", precision.tolerance())
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Compiled pipelines for one device.
pub struct BurnPipelines {
    matmul_pipeline: ComputePipeline,
    compare_pipeline: ComputePipeline,
    matmul_bind_group_layout: BindGroupLayout,
    compare_bind_group_layout: BindGroupLayout,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl BurnPipelines {
    /// Compiles the matmul kernel and `compare_source` for `precision`.
    ///
    /// Compilation runs inside a validation error scope, so a broken
    /// comparison kernel is reported as `EngineError::ShaderCompilation`.
    pub fn new(
        device: &Device,
        precision: Precision,
        compare_source: &str,
    ) -> Result<Self, EngineError> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let matmul_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("matmul"),
            source: wgpu::ShaderSource::Wgsl(specialize(MATMUL_WGSL, precision).into()),
        });
        let compare_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("compare"),
            source: wgpu::ShaderSource::Wgsl(specialize(compare_source, precision).into()),
        });

        // @binding(0) params, (1) a, (2) b, (3) result
        let matmul_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("matmul_bind_group_layout"),
                entries: &[
                    uniform_entry(0),
                    storage_entry(1, true),
                    storage_entry(2, true),
                    storage_entry(3, false),
                ],
            });

        // @binding(0) params, (1) reference, (2) candidate, (3) faults
        let compare_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("compare_bind_group_layout"),
                entries: &[
                    uniform_entry(0),
                    storage_entry(1, true),
                    storage_entry(2, true),
                    storage_entry(3, false),
                ],
            });

        let matmul_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("matmul_pipeline_layout"),
                bind_group_layouts: &[&matmul_bind_group_layout],
                push_constant_ranges: &[],
            });

        let compare_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("compare_pipeline_layout"),
                bind_group_layouts: &[&compare_bind_group_layout],
                push_constant_ranges: &[],
            });

        let matmul_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("matmul_pipeline"),
            layout: Some(&matmul_pipeline_layout),
            module: &matmul_module,
            entry_point: Some("matmul"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        let compare_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("compare_pipeline"),
            layout: Some(&compare_pipeline_layout),
            module: &compare_module,
            entry_point: Some("compare"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        if let Some(e) = block_on(device.pop_error_scope()) {
            return Err(EngineError::ShaderCompilation(e.to_string()));
        }

        Ok(Self {
            matmul_pipeline,
            compare_pipeline,
            matmul_bind_group_layout,
            compare_bind_group_layout,
        })
    }

    pub fn matmul_pipeline(&self) -> &ComputePipeline {
        &self.matmul_pipeline
    }

    pub fn compare_pipeline(&self) -> &ComputePipeline {
        &self.compare_pipeline
    }

    pub fn matmul_bind_group_layout(&self) -> &BindGroupLayout {
        &self.matmul_bind_group_layout
    }

    pub fn compare_bind_group_layout(&self) -> &BindGroupLayout {
        &self.compare_bind_group_layout
    }
}
