//! Run setup: shared inputs, worker threads, temperature source and monitor.

use crate::channel::{report_channel, DEFAULT_CAPACITY};
use crate::config::{MemoryBudget, Precision, DEFAULT_RUN_SECS, DEFAULT_STOP_TIMEOUT_SECS};
use crate::error::{BurnError, EngineError};
use crate::matrices::InputMatrices;
use crate::monitor::{Monitor, MonitorConfig, RunBudget, RunSummary, WorkerHandle, DEFAULT_TICK};
use crate::temperature::{TemperatureCommand, TemperaturePoller};
use crate::traits::ComputeEngine;
use crate::worker::{self, StopSignal, WorkerConfig};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Everything a run needs besides the engine.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub duration: Duration,
    pub precision: Precision,
    pub use_tensor_path: bool,
    pub memory: MemoryBudget,
    /// Burn only this device; `None` burns all of them.
    pub device: Option<usize>,
    pub stop_timeout: Duration,
    /// Longest wait for one iteration; `None` waits as long as it takes.
    pub completion_timeout: Option<Duration>,
    /// Temperature source, or `None` to run without one.
    pub temperatures: Option<TemperatureCommand>,
    pub tick: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(DEFAULT_RUN_SECS),
            precision: Precision::default(),
            use_tensor_path: false,
            memory: MemoryBudget::default(),
            device: None,
            stop_timeout: Duration::from_secs(DEFAULT_STOP_TIMEOUT_SECS),
            completion_timeout: None,
            temperatures: Some(TemperatureCommand::default()),
            tick: DEFAULT_TICK,
        }
    }
}

/// Starts one worker per device and hands them to the monitor.
pub struct Launcher {
    engine: Arc<dyn ComputeEngine>,
    config: LaunchConfig,
    progress: ProgressBar,
}

impl Launcher {
    pub fn new(engine: Arc<dyn ComputeEngine>, config: LaunchConfig) -> Self {
        let progress = ProgressBar::new_spinner();
        progress.set_style(
            ProgressStyle::with_template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        Self {
            engine,
            config,
            progress,
        }
    }

    /// Replaces the progress display.
    #[cfg(test)]
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Runs the whole burn and returns the per-device verdicts.
    ///
    /// `interrupt`, when raised, ends the running phase early.
    pub fn run(self, interrupt: Option<Arc<AtomicBool>>) -> Result<RunSummary, BurnError> {
        let device_count = self.engine.device_count()?;
        if device_count == 0 {
            return Err(EngineError::NoDevices.into());
        }

        let targets = match self.config.device {
            Some(index) if index >= device_count => {
                return Err(EngineError::DeviceNotFound {
                    index,
                    available: self
                        .engine
                        .devices()?
                        .into_iter()
                        .map(|d| d.name)
                        .collect(),
                }
                .into());
            }
            Some(index) => vec![index],
            None => (0..device_count).collect(),
        };

        println!(
            "Burning for {} on {} device(s) with the {} engine, using {}, memory {}",
            humantime::format_duration(self.config.duration),
            targets.len(),
            self.engine.name(),
            self.config.precision.label(),
            self.config.memory
        );

        let inputs = Arc::new(InputMatrices::generate(
            self.engine.matrix_size(),
            self.config.precision,
        ));
        let stop = StopSignal::new();

        let workers = collect_workers(&targets, self.config.device.is_none(), |device| {
            self.spawn_worker(device, &inputs, &stop)
                .map(|handle| handle.with_temperature_slot(self.engine.temperature_slot(device)))
        })?;
        info!("Started {} burn workers", workers.len());

        let slots = temperature_slot_count(self.engine.as_ref(), device_count);
        let poller = match &self.config.temperatures {
            Some(command) if slots > 0 => TemperaturePoller::spawn(command, slots),
            Some(_) => {
                info!("No device is covered by the temperature source");
                TemperaturePoller::unavailable(slots)
            }
            None => TemperaturePoller::unavailable(slots),
        };

        let budget = RunBudget::new(self.config.duration, self.config.stop_timeout);
        let monitor_config = MonitorConfig {
            tick: self.config.tick,
            ops_per_product: self.engine.ops_per_product(),
            ..MonitorConfig::default()
        };
        let mut monitor = Monitor::new(
            workers,
            poller,
            budget,
            stop,
            self.progress.clone(),
            monitor_config,
        );
        if let Some(flag) = interrupt {
            monitor = monitor.with_interrupt(flag);
        }
        monitor.run()
    }

    fn spawn_worker(
        &self,
        device: usize,
        inputs: &Arc<InputMatrices>,
        stop: &StopSignal,
    ) -> Result<WorkerHandle, BurnError> {
        let (writer, reader) = report_channel(DEFAULT_CAPACITY);
        let engine = Arc::clone(&self.engine);
        let inputs = Arc::clone(inputs);
        let stop = stop.clone();
        let config = WorkerConfig {
            device,
            precision: self.config.precision,
            use_tensor_path: self.config.use_tensor_path,
            memory: self.config.memory,
            completion_timeout: self.config.completion_timeout,
        };

        let handle = thread::Builder::new()
            .name(format!("burn-{}", device))
            .spawn(move || worker::run(engine.as_ref(), &inputs, config, writer, stop))?;
        Ok(WorkerHandle::new(device, reader, handle))
    }
}

/// Size of the temperature table: the source reports on every covered
/// device, burned or not.
pub fn temperature_slot_count(engine: &dyn ComputeEngine, device_count: usize) -> usize {
    (0..device_count)
        .filter_map(|device| engine.temperature_slot(device))
        .max()
        .map_or(0, |slot| slot + 1)
}

/// Spawns a worker for every device in `devices`.
///
/// When burning all devices a failed spawn is logged and skipped; when a
/// single device was requested the failure is returned. Fails with
/// `BurnError::NoWorkers` if nothing could be started.
pub fn collect_workers<F>(
    devices: &[usize],
    all_devices: bool,
    mut spawn: F,
) -> Result<Vec<WorkerHandle>, BurnError>
where
    F: FnMut(usize) -> Result<WorkerHandle, BurnError>,
{
    let mut workers = Vec::with_capacity(devices.len());
    for &device in devices {
        match spawn(device) {
            Ok(handle) => workers.push(handle),
            Err(e) if all_devices => {
                error!("Couldn't start a worker for device {}: {}", device, e);
            }
            Err(e) => return Err(e),
        }
    }
    if workers.is_empty() {
        return Err(BurnError::NoWorkers);
    }
    Ok(workers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuEngine;
    use crate::error::exit_code;
    use crate::testing::{Script, ScriptedEngine};
    use crate::worker::WorkerExit;

    fn quick_config() -> LaunchConfig {
        LaunchConfig {
            duration: Duration::from_millis(300),
            stop_timeout: Duration::from_secs(2),
            completion_timeout: Some(Duration::from_secs(5)),
            temperatures: None,
            tick: Duration::from_millis(5),
            ..LaunchConfig::default()
        }
    }

    fn launch(engine: Arc<dyn ComputeEngine>, config: LaunchConfig) -> Result<RunSummary, BurnError> {
        Launcher::new(engine, config)
            .with_progress(ProgressBar::hidden())
            .run(None)
    }

    fn paced() -> Script {
        Script {
            delay: Duration::from_millis(20),
            ..Script::default()
        }
    }

    fn idle_handle(index: usize) -> WorkerHandle {
        let (_writer, reader) = report_channel(1);
        let handle = thread::spawn(|| WorkerExit::Stopped);
        WorkerHandle::new(index, reader, handle)
    }

    #[test]
    fn test_collect_skips_failures_for_all_devices() {
        let workers = collect_workers(&[0, 1, 2], true, |device| {
            if device == 1 {
                Err(BurnError::Config("spawn failed".into()))
            } else {
                Ok(idle_handle(device))
            }
        })
        .unwrap();
        let indices: Vec<usize> = workers.iter().map(WorkerHandle::index).collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn test_collect_without_workers() {
        let result = collect_workers(&[0, 1], true, |_| Err(BurnError::Config("nope".into())));
        assert!(matches!(result, Err(BurnError::NoWorkers)));
        assert_eq!(BurnError::NoWorkers.exit_code(), exit_code::NO_WORKERS);
    }

    #[test]
    fn test_collect_single_device_failure_propagates() {
        let result = collect_workers(&[3], false, |_| Err(BurnError::Config("nope".into())));
        assert!(matches!(result, Err(BurnError::Config(_))));
    }

    #[test]
    fn test_temperature_slots_cover_mixed_vendors() {
        let engine = ScriptedEngine::new(4, vec![paced(), paced(), paced()])
            .with_temperature_slots(vec![None, Some(0), Some(1)]);
        assert_eq!(temperature_slot_count(&engine, 3), 2);
        // Covered devices count even when only one is burned.
        assert_eq!(temperature_slot_count(&engine, 2), 1);

        let uncovered = ScriptedEngine::new(4, vec![paced(), paced()]);
        assert_eq!(temperature_slot_count(&uncovered, 2), 0);
    }

    #[test]
    fn test_slow_iterations_without_deadline() {
        let engine = Arc::new(ScriptedEngine::new(
            4,
            vec![Script {
                completion_time: Duration::from_millis(150),
                ..Script::default()
            }],
        ));
        let config = LaunchConfig {
            duration: Duration::from_millis(600),
            completion_timeout: None,
            ..quick_config()
        };

        let summary = launch(engine, config).unwrap();

        assert!(!summary.verdicts[0].died);
        assert_eq!(summary.verdicts[0].exit, Some(WorkerExit::Stopped));
    }

    #[test]
    fn test_run_with_one_broken_device() {
        let engine = Arc::new(ScriptedEngine::new(
            4,
            vec![
                paced(),
                Script {
                    fail_init: true,
                    ..Script::default()
                },
            ],
        ));

        let summary = launch(engine.clone(), quick_config()).unwrap();

        assert_eq!(summary.verdicts.len(), 2);
        let healthy = &summary.verdicts[0];
        assert!(!healthy.died && !healthy.faulty);
        assert!(healthy.processed > 0);
        assert_eq!(healthy.exit, Some(WorkerExit::Stopped));
        assert!(summary.verdicts[1].died);
        assert_eq!(summary.verdicts[1].exit, Some(WorkerExit::InitFailed));
        assert_eq!(engine.submitted(1), 0);
    }

    #[test]
    fn test_faults_make_device_faulty() {
        let engine = Arc::new(ScriptedEngine::new(
            4,
            vec![
                paced(),
                Script {
                    faults: vec![0, 0, 0, 5],
                    ..paced()
                },
            ],
        ));

        let summary = launch(engine, quick_config()).unwrap();

        assert!(!summary.verdicts[0].faulty);
        assert!(summary.verdicts[1].faulty);
        assert!(summary.any_faulty());
        assert_eq!(summary.verdicts[1].to_string(), "GPU 1: FAULTY");
    }

    #[test]
    fn test_single_device_selection() {
        let engine = Arc::new(ScriptedEngine::new(4, vec![paced(), paced(), paced()]));
        let config = LaunchConfig {
            device: Some(2),
            ..quick_config()
        };

        let summary = launch(engine.clone(), config).unwrap();

        assert_eq!(summary.verdicts.len(), 1);
        assert_eq!(summary.verdicts[0].index, 2);
        assert_eq!(engine.submitted(0), 0);
        assert!(engine.submitted(2) > 0);
    }

    #[test]
    fn test_unknown_device_is_rejected() {
        let engine = Arc::new(ScriptedEngine::new(4, vec![paced()]));
        let config = LaunchConfig {
            device: Some(7),
            ..quick_config()
        };

        let err = launch(engine, config).unwrap_err();
        assert!(matches!(
            err,
            BurnError::Engine(EngineError::DeviceNotFound { index: 7, .. })
        ));
        assert_eq!(err.exit_code(), exit_code::FAILURE);
    }

    #[test]
    fn test_no_devices() {
        let engine = Arc::new(ScriptedEngine::new(4, vec![]));
        let err = launch(engine, quick_config()).unwrap_err();
        assert_eq!(err.exit_code(), exit_code::NO_WORKERS);
    }

    #[test]
    fn test_every_worker_dying_aborts() {
        let broken = Script {
            fail_init: true,
            ..Script::default()
        };
        let engine = Arc::new(ScriptedEngine::new(4, vec![broken.clone(), broken]));
        let config = LaunchConfig {
            duration: Duration::from_secs(30),
            ..quick_config()
        };

        let err = launch(engine, config).unwrap_err();
        assert!(matches!(err, BurnError::AllWorkersDead));
        assert_eq!(err.exit_code(), exit_code::ALL_DEAD);
    }

    #[test]
    fn test_cpu_engine_end_to_end() {
        let engine = Arc::new(
            CpuEngine::new()
                .with_devices(2)
                .with_matrix_size(16)
                .with_memory(64 * 1024),
        );
        let config = LaunchConfig {
            precision: Precision::Double,
            ..quick_config()
        };

        let summary = launch(engine, config).unwrap();

        assert_eq!(summary.verdicts.len(), 2);
        for verdict in &summary.verdicts {
            assert!(!verdict.faulty && !verdict.died && !verdict.abandoned);
            assert!(verdict.processed > 0);
        }
    }
}
