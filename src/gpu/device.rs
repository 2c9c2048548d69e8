//! GPU adapter enumeration and device memory queries.
//!
//! wgpu does not expose how much memory a device has, so totals and free
//! memory come from `nvidia-smi` for NVIDIA adapters. Everything else falls
//! back to a fixed assumption.

use crate::traits::DeviceInfo;
use log::debug;
use std::process::Command;
use wgpu::{Adapter, AdapterInfo, Backend, Backends, DeviceType, Instance};

/// Memory assumed when the driver cannot be asked (1 GiB).
pub const FALLBACK_MEMORY: u64 = 1024 * 1024 * 1024;

const NVIDIA_VENDOR: u32 = 0x10DE;

/// Total and free memory of one device, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total: u64,
    pub free: u64,
}

impl MemoryInfo {
    pub fn fallback() -> Self {
        Self {
            total: FALLBACK_MEMORY,
            free: FALLBACK_MEMORY,
        }
    }
}

/// Lists the burnable adapters on the primary backends.
///
/// Software adapters are skipped, and an adapter exposed by several
/// backends is kept only once.
pub fn enumerate_adapters(instance: &Instance) -> Vec<Adapter> {
    let mut seen: Vec<(String, u32, u32)> = Vec::new();
    instance
        .enumerate_adapters(Backends::PRIMARY)
        .into_iter()
        .filter(|adapter| {
            let info = adapter.get_info();
            if info.device_type == DeviceType::Cpu {
                debug!("Skipping software adapter {}", info.name);
                return false;
            }
            let key = (info.name.clone(), info.vendor, info.device);
            if seen.contains(&key) {
                debug!("Skipping {} on {:?}, already listed", info.name, info.backend);
                return false;
            }
            seen.push(key);
            true
        })
        .collect()
}

/// Describes adapter `index` of the enumerated list.
pub fn describe(index: usize, info: &AdapterInfo, memory: Option<MemoryInfo>) -> DeviceInfo {
    device_info(
        index,
        &info.name,
        info.vendor,
        info.backend,
        info.device_type,
        memory,
    )
}

fn device_info(
    index: usize,
    name: &str,
    vendor: u32,
    backend: Backend,
    device_type: DeviceType,
    memory: Option<MemoryInfo>,
) -> DeviceInfo {
    DeviceInfo {
        index,
        name: name.to_string(),
        total_memory: memory.map(|m| m.total),
        detail: format!("{}, {:?}, {:?}", vendor_name(vendor), backend, device_type),
    }
}

/// Position of each adapter among the NVIDIA adapters, which is the index
/// `nvidia-smi` knows it by.
pub fn nvidia_ordinals(vendors: &[u32]) -> Vec<Option<usize>> {
    let mut next = 0;
    vendors
        .iter()
        .map(|&vendor| {
            if vendor == NVIDIA_VENDOR {
                next += 1;
                Some(next - 1)
            } else {
                None
            }
        })
        .collect()
}

/// Asks `nvidia-smi` for the memory of GPU `ordinal`.
pub fn query_nvidia_memory(ordinal: usize) -> Option<MemoryInfo> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=memory.total,memory.free",
            "--format=csv,noheader,nounits",
            "-i",
            &ordinal.to_string(),
        ])
        .output()
        .ok()?;
    if !output.status.success() {
        debug!("nvidia-smi memory query for GPU {} failed", ordinal);
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout.lines().find_map(parse_memory_line)
}

/// Parses one `total, free` line in MiB.
pub fn parse_memory_line(line: &str) -> Option<MemoryInfo> {
    let mut fields = line.split(',').map(str::trim);
    let total: u64 = fields.next()?.parse().ok()?;
    let free: u64 = fields.next()?.parse().ok()?;
    Some(MemoryInfo {
        total: total * 1024 * 1024,
        free: free * 1024 * 1024,
    })
}

/// Convert vendor ID to human-readable name.
fn vendor_name(vendor_id: u32) -> String {
    match vendor_id {
        0x1002 => "AMD".to_string(),
        0x1010 => "ImgTec".to_string(),
        NVIDIA_VENDOR => "NVIDIA".to_string(),
        0x13B5 => "ARM".to_string(),
        0x5143 => "Qualcomm".to_string(),
        0x8086 => "Intel".to_string(),
        0x106B => "Apple".to_string(),
        _ => format!("Unknown (0x{:04X})", vendor_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgpu::InstanceDescriptor;

    #[test]
    fn test_enumerate_adapters_skips_software() {
        // May be empty in CI without GPU, just verify it doesn't panic
        let instance = Instance::new(&InstanceDescriptor::default());
        for adapter in enumerate_adapters(&instance) {
            let info = adapter.get_info();
            assert!(!info.name.is_empty());
            assert_ne!(info.device_type, DeviceType::Cpu);
        }
    }

    #[test]
    fn test_parse_memory_line() {
        assert_eq!(
            parse_memory_line("24564, 23010"),
            Some(MemoryInfo {
                total: 24564 * 1024 * 1024,
                free: 23010 * 1024 * 1024,
            })
        );
        assert_eq!(parse_memory_line("[N/A], 12"), None);
        assert_eq!(parse_memory_line("100"), None);
        assert_eq!(parse_memory_line(""), None);
    }

    #[test]
    fn test_nvidia_ordinals() {
        let vendors = [NVIDIA_VENDOR, 0x1002, NVIDIA_VENDOR];
        assert_eq!(nvidia_ordinals(&vendors), vec![Some(0), None, Some(1)]);
    }

    #[test]
    fn test_describe() {
        let device = device_info(
            2,
            "GeForce RTX 4090",
            NVIDIA_VENDOR,
            Backend::Vulkan,
            DeviceType::DiscreteGpu,
            Some(MemoryInfo {
                total: 24 * 1024 * 1024 * 1024,
                free: 0,
            }),
        );
        assert_eq!(device.index, 2);
        assert_eq!(device.total_memory, Some(24 * 1024 * 1024 * 1024));
        let display = device.to_string();
        assert!(display.starts_with("ID 2: GeForce RTX 4090, "));
        assert!(display.contains("NVIDIA"));
        assert!(display.contains("Vulkan"));
    }

    #[test]
    fn test_vendor_names() {
        assert_eq!(vendor_name(0x10DE), "NVIDIA");
        assert_eq!(vendor_name(0x1002), "AMD");
        assert_eq!(vendor_name(0x8086), "Intel");
        assert_eq!(vendor_name(0x106B), "Apple");
        assert!(vendor_name(0x0000).contains("Unknown"));
    }
}
