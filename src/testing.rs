//! Scripted compute engine for tests.
//!
//! Each device follows a `Script` describing when it fails, how many faults
//! each iteration reports and when it pulls the stop signal. Counters are
//! shared with the engine so tests can inspect what the worker did.

use crate::config::Precision;
use crate::error::EngineError;
use crate::matrices::InputMatrices;
use crate::traits::{ComputeEngine, DeviceInfo, DeviceSession, COMPLETION_SLOTS};
use crate::worker::StopSignal;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Memory every scripted device reports as available unless overridden.
pub const SCRIPTED_MEMORY: u64 = 1024 * 1024;

/// Behaviour of one scripted device.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// `initialize` fails.
    pub fail_init: bool,
    /// Faults reported by the n-th submitted iteration; missing entries are 0.
    pub faults: Vec<u64>,
    /// The n-th submission (1-based) fails.
    pub fail_submit_at: Option<u64>,
    /// Lower the stop signal during the n-th submission.
    pub stop_after: Option<(u64, StopSignal)>,
    /// Iterations never report completion.
    pub never_complete: bool,
    /// Sleep inside every submission.
    pub delay: Duration,
    /// Iterations complete this long after their submission.
    pub completion_time: Duration,
    /// Available memory override.
    pub memory: Option<u64>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    submitted: u64,
    completed: u64,
    uploaded: Option<usize>,
}

pub struct ScriptedEngine {
    matrix_size: usize,
    scripts: Vec<Script>,
    temperature_slots: Vec<Option<usize>>,
    counters: Arc<Mutex<Vec<Counters>>>,
}

impl ScriptedEngine {
    pub fn new(matrix_size: usize, scripts: Vec<Script>) -> Self {
        let counters = vec![Counters::default(); scripts.len()];
        Self {
            matrix_size,
            scripts,
            temperature_slots: Vec::new(),
            counters: Arc::new(Mutex::new(counters)),
        }
    }

    /// Temperature slot of each device, by device index.
    pub fn with_temperature_slots(mut self, slots: Vec<Option<usize>>) -> Self {
        self.temperature_slots = slots;
        self
    }

    pub fn submitted(&self, device: usize) -> u64 {
        self.counters.lock().unwrap()[device].submitted
    }

    pub fn completed(&self, device: usize) -> u64 {
        self.counters.lock().unwrap()[device].completed
    }

    pub fn uploaded_results(&self, device: usize) -> Option<usize> {
        self.counters.lock().unwrap()[device].uploaded
    }
}

impl ComputeEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>, EngineError> {
        Ok((0..self.scripts.len())
            .map(|index| DeviceInfo {
                index,
                name: format!("Scripted device {}", index),
                total_memory: Some(SCRIPTED_MEMORY),
                detail: String::new(),
            })
            .collect())
    }

    fn matrix_size(&self) -> usize {
        self.matrix_size
    }

    fn temperature_slot(&self, device: usize) -> Option<usize> {
        self.temperature_slots.get(device).copied().flatten()
    }

    fn initialize(
        &self,
        device: usize,
        _precision: Precision,
        _use_tensor_path: bool,
    ) -> Result<Box<dyn DeviceSession>, EngineError> {
        let script = self
            .scripts
            .get(device)
            .cloned()
            .ok_or(EngineError::DeviceNotFound {
                index: device,
                available: vec![],
            })?;
        if script.fail_init {
            return Err(EngineError::DeviceRequest("scripted init failure".into()));
        }
        Ok(Box::new(ScriptedSession {
            device,
            script,
            counters: Arc::clone(&self.counters),
            slots: [None; COMPLETION_SLOTS],
        }))
    }
}

struct ScriptedSession {
    device: usize,
    script: Script,
    counters: Arc<Mutex<Vec<Counters>>>,
    slots: [Option<(u64, Instant)>; COMPLETION_SLOTS],
}

impl DeviceSession for ScriptedSession {
    fn total_memory(&self) -> Result<u64, EngineError> {
        Ok(self.script.memory.unwrap_or(SCRIPTED_MEMORY))
    }

    fn available_memory(&self) -> Result<u64, EngineError> {
        self.total_memory()
    }

    fn upload(&mut self, _inputs: &InputMatrices, result_count: usize) -> Result<(), EngineError> {
        self.counters.lock().unwrap()[self.device].uploaded = Some(result_count);
        Ok(())
    }

    fn submit(&mut self, slot: usize) -> Result<(), EngineError> {
        if !self.script.delay.is_zero() {
            std::thread::sleep(self.script.delay);
        }
        let n = {
            let mut counters = self.counters.lock().unwrap();
            counters[self.device].submitted += 1;
            counters[self.device].submitted
        };
        if self.script.fail_submit_at == Some(n) {
            return Err(EngineError::DeviceLost);
        }
        if let Some((at, stop)) = &self.script.stop_after {
            if *at == n {
                stop.request_stop();
            }
        }
        let faults = self.script.faults.get(n as usize - 1).copied().unwrap_or(0);
        self.slots[slot] = Some((faults, Instant::now()));
        Ok(())
    }

    fn poll_completion(&mut self, slot: usize) -> Result<Option<u64>, EngineError> {
        if self.script.never_complete {
            return Ok(None);
        }
        let (faults, submitted) = self.slots[slot].ok_or(EngineError::NotSubmitted(slot))?;
        if submitted.elapsed() < self.script.completion_time {
            return Ok(None);
        }
        self.slots[slot] = None;
        self.counters.lock().unwrap()[self.device].completed += 1;
        Ok(Some(faults))
    }
}
