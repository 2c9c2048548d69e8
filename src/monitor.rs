//! Supervisor loop.
//!
//! The monitor owns every report channel, the temperature poller and the
//! per-worker aggregates. It polls all of them from a single thread on a
//! fixed tick, renders progress, and runs the staged shutdown:
//! `Running -> Draining -> Terminated`.

use crate::channel::{Report, ReportReader, FRAME_LEN};
use crate::error::{BurnError, ChannelError};
use crate::temperature::TemperaturePoller;
use crate::worker::{StopSignal, WorkerExit};
use indicatif::ProgressBar;
use log::{debug, error, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

/// Default sleep between monitor ticks.
pub const DEFAULT_TICK: Duration = Duration::from_millis(50);

/// A summary is printed every time this share of the run elapses.
pub const SUMMARY_INTERVAL_PERCENT: f64 = 10.0;

/// Time limits of one run. Fixed once the run starts.
#[derive(Debug, Clone, Copy)]
pub struct RunBudget {
    pub start: Instant,
    pub duration: Duration,
    pub graceful_stop_timeout: Duration,
}

impl RunBudget {
    pub fn new(duration: Duration, graceful_stop_timeout: Duration) -> Self {
        Self {
            start: Instant::now(),
            duration,
            graceful_stop_timeout,
        }
    }

    /// True once the run length has been used up.
    pub fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.start) >= self.duration
    }

    /// Elapsed share of the run, 0 to 100.
    pub fn elapsed_percent(&self, now: Instant) -> f64 {
        if self.duration.is_zero() {
            return 100.0;
        }
        let elapsed = now.saturating_duration_since(self.start).as_secs_f64();
        (elapsed / self.duration.as_secs_f64() * 100.0).min(100.0)
    }
}

/// Monitor-side handle of one worker.
pub struct WorkerHandle {
    index: usize,
    channel: ReportReader,
    control: Option<JoinHandle<WorkerExit>>,
    temperature_slot: Option<usize>,
}

impl WorkerHandle {
    pub fn new(index: usize, channel: ReportReader, control: JoinHandle<WorkerExit>) -> Self {
        Self {
            index,
            channel,
            control: Some(control),
            temperature_slot: None,
        }
    }

    /// Reads this worker's temperature from `slot` of the temperature table.
    pub fn with_temperature_slot(mut self, slot: Option<usize>) -> Self {
        self.temperature_slot = slot;
        self
    }

    /// Device index this worker burns.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_running(&self) -> bool {
        self.control.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Gives up on a worker that ignored the stop signal.
    ///
    /// Threads cannot be killed, so the worker is detached; process exit
    /// reclaims it. Returns false if it had already finished.
    fn force_terminate(&mut self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.control.take();
        true
    }

    /// Collects the exit status of a finished worker.
    fn reap(&mut self) -> Option<WorkerExit> {
        if self.is_running() {
            return None;
        }
        match self.control.take()?.join() {
            Ok(exit) => Some(exit),
            Err(_) => {
                error!("Worker for device {} panicked", self.index);
                Some(WorkerExit::ComputeFailed)
            }
        }
    }
}

/// Everything the monitor knows about one worker.
#[derive(Debug, Clone)]
pub struct WorkerAggregate {
    /// Matrix products reported so far.
    pub total_processed: u64,
    /// Faults since the last periodic summary.
    pub errors_since_summary: u64,
    pub last_report: Instant,
    /// Floating point operations per second over the last report interval.
    pub throughput: f64,
    pub temperature: Option<i32>,
    pub saw_first_report: bool,
    pub ever_faulty: bool,
    dead: bool,
    abandoned: bool,
}

impl WorkerAggregate {
    pub fn new(now: Instant) -> Self {
        Self {
            total_processed: 0,
            errors_since_summary: 0,
            last_report: now,
            throughput: 0.0,
            temperature: None,
            saw_first_report: false,
            ever_faulty: false,
            dead: false,
            abandoned: false,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Marks the worker dead. Returns true only the first time.
    pub fn mark_dead(&mut self) -> bool {
        !std::mem::replace(&mut self.dead, true)
    }

    /// Folds one report into the aggregate. Dead workers ignore reports.
    pub fn apply(&mut self, report: Report, now: Instant, ops_per_product: f64) {
        if self.dead {
            return;
        }
        match report {
            Report::Dead => {
                self.dead = true;
            }
            Report::Progress { processed, faults } => {
                let elapsed = now.saturating_duration_since(self.last_report).as_secs_f64();
                self.last_report = now;
                if self.saw_first_report && elapsed > 0.0 {
                    self.throughput = processed as f64 * ops_per_product / elapsed;
                } else {
                    self.throughput = 0.0;
                    self.saw_first_report = true;
                }
                self.total_processed += processed as u64;
                self.errors_since_summary += faults as u64;
                if faults > 0 {
                    self.ever_faulty = true;
                }
            }
        }
    }
}

/// Final result for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuVerdict {
    pub index: usize,
    pub faulty: bool,
    pub died: bool,
    pub abandoned: bool,
    pub processed: u64,
    pub exit: Option<WorkerExit>,
}

impl fmt::Display for GpuVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GPU {}: {}",
            self.index,
            if self.faulty { "FAULTY" } else { "OK" }
        )?;
        if self.died {
            write!(f, " (died)")?;
        }
        if self.abandoned {
            write!(f, " (abandoned)")?;
        }
        Ok(())
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub verdicts: Vec<GpuVerdict>,
    pub elapsed: Duration,
}

impl RunSummary {
    #[cfg(test)]
    pub fn any_faulty(&self) -> bool {
        self.verdicts.iter().any(|v| v.faulty)
    }
}

/// Monitor tuning.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub tick: Duration,
    /// Floating point operations in one reported product.
    pub ops_per_product: f64,
    pub summary_interval_percent: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            ops_per_product: 0.0,
            summary_interval_percent: SUMMARY_INTERVAL_PERCENT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Running,
    Draining,
    Terminated,
}

/// Single-threaded supervisor over all workers of a run.
pub struct Monitor {
    workers: Vec<WorkerHandle>,
    aggregates: Vec<WorkerAggregate>,
    poller: TemperaturePoller,
    budget: RunBudget,
    stop: StopSignal,
    interrupt: Option<Arc<AtomicBool>>,
    progress: ProgressBar,
    config: MonitorConfig,
    state: MonitorState,
    next_summary_percent: f64,
    summaries: usize,
}

impl Monitor {
    pub fn new(
        workers: Vec<WorkerHandle>,
        poller: TemperaturePoller,
        budget: RunBudget,
        stop: StopSignal,
        progress: ProgressBar,
        config: MonitorConfig,
    ) -> Self {
        let aggregates = workers
            .iter()
            .map(|_| WorkerAggregate::new(budget.start))
            .collect();
        Self {
            workers,
            aggregates,
            poller,
            budget,
            stop,
            interrupt: None,
            progress,
            next_summary_percent: config.summary_interval_percent,
            config,
            state: MonitorState::Running,
            summaries: 0,
        }
    }

    /// Ends the running phase early when `flag` is raised (e.g. on Ctrl-C).
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn aggregates(&self) -> &[WorkerAggregate] {
        &self.aggregates
    }

    /// Number of periodic summaries printed so far.
    pub fn summaries(&self) -> usize {
        self.summaries
    }

    /// Drives the run through all states.
    ///
    /// Fails with `BurnError::AllWorkersDead` as soon as no worker is alive.
    pub fn run(mut self) -> Result<RunSummary, BurnError> {
        loop {
            let state = self.state;
            match state {
                MonitorState::Running => {
                    let now = Instant::now();
                    if self.budget.expired(now) || self.interrupted() {
                        self.state = MonitorState::Draining;
                        continue;
                    }
                    if let Err(e) = self.tick(now) {
                        self.abort();
                        return Err(e);
                    }
                    thread::sleep(self.config.tick);
                }
                MonitorState::Draining => {
                    self.drain();
                    self.collect_backlog();
                    self.state = MonitorState::Terminated;
                }
                MonitorState::Terminated => return Ok(self.terminate()),
            }
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// One polling pass over every channel and the temperature source.
    pub fn tick(&mut self, now: Instant) -> Result<(), BurnError> {
        let mut reported = false;

        for (handle, aggregate) in self.workers.iter_mut().zip(self.aggregates.iter_mut()) {
            if aggregate.is_dead() {
                continue;
            }
            match handle.channel.peek() {
                Ok(available) if available >= FRAME_LEN => match handle.channel.read_frame() {
                    Ok(frame) => {
                        aggregate.apply(Report::from(frame), now, self.config.ops_per_product);
                        if aggregate.is_dead() {
                            warn!("Worker for device {} reported failure", handle.index);
                        }
                        reported = true;
                    }
                    Err(e) => warn!("Device {}: skipping report: {}", handle.index, e),
                },
                Ok(_) => {}
                Err(ChannelError::Broken) => {
                    if aggregate.mark_dead() {
                        warn!("Device {}: report channel broken", handle.index);
                    }
                }
                Err(e) => warn!("Device {}: channel error: {}", handle.index, e),
            }
        }

        if self.poller.poll() {
            for (handle, aggregate) in self.workers.iter().zip(self.aggregates.iter_mut()) {
                aggregate.temperature = handle
                    .temperature_slot
                    .and_then(|slot| self.poller.temperature(slot));
            }
        }

        if reported {
            self.render(now);
        }

        if self.aggregates.iter().all(WorkerAggregate::is_dead) {
            return Err(BurnError::AllWorkersDead);
        }
        Ok(())
    }

    fn render(&mut self, now: Instant) {
        let percent = self.budget.elapsed_percent(now);
        self.progress.set_message(self.progress_line(percent));

        if self.next_summary_percent < percent {
            self.next_summary_percent = percent + self.config.summary_interval_percent;
            let stamp = humantime::format_rfc3339_seconds(SystemTime::now());
            self.progress
                .suspend(|| println!("\tSummary at:   {}", stamp));
            for aggregate in &mut self.aggregates {
                aggregate.errors_since_summary = 0;
            }
            self.summaries += 1;
        }
    }

    /// Formats the progress line for `percent` elapsed.
    pub fn progress_line(&self, percent: f64) -> String {
        let processed: Vec<String> = self
            .aggregates
            .iter()
            .map(|a| format!("{} ({:.0} Gflop/s)", a.total_processed, a.throughput / 1e9))
            .collect();
        let errors: Vec<String> = self
            .aggregates
            .iter()
            .map(|a| {
                if a.is_dead() {
                    format!("{} (DIED!)", a.errors_since_summary)
                } else if a.errors_since_summary > 0 {
                    format!("{} (WARNING!)", a.errors_since_summary)
                } else {
                    a.errors_since_summary.to_string()
                }
            })
            .collect();
        let temps: Vec<String> = self
            .aggregates
            .iter()
            .map(|a| match a.temperature {
                Some(t) => format!("{} C", t),
                None => "--".to_string(),
            })
            .collect();

        format!(
            "{:.1}%  proc'd: {}  errors: {}  temps: {}",
            percent,
            processed.join(" - "),
            errors.join(" - "),
            temps.join(" - ")
        )
    }

    /// Lowers the stop signal and waits up to the grace period, then gives
    /// up on workers that are still running.
    fn drain(&mut self) {
        self.progress.suspend(|| println!("\nTerminating workers"));
        self.stop.request_stop();

        let deadline = Instant::now() + self.budget.graceful_stop_timeout;
        while self.workers.iter().any(WorkerHandle::is_running) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(self.config.tick.min(deadline - now));
        }

        for (handle, aggregate) in self.workers.iter_mut().zip(self.aggregates.iter_mut()) {
            if handle.force_terminate() {
                warn!(
                    "Worker for device {} ignored the stop request for {:?}; abandoning it",
                    handle.index, self.budget.graceful_stop_timeout
                );
                aggregate.abandoned = true;
            }
        }
    }

    /// Folds every complete report still queued into the aggregates.
    ///
    /// Runs once the workers have stopped, so reports written after the
    /// last tick still count towards the verdicts. Abandoned workers may
    /// keep writing; only frames already queued are read.
    fn collect_backlog(&mut self) {
        let now = Instant::now();
        for (handle, aggregate) in self.workers.iter_mut().zip(self.aggregates.iter_mut()) {
            let queued = match handle.channel.peek() {
                Ok(available) => available / FRAME_LEN,
                Err(_) => 0,
            };
            for _ in 0..queued {
                match handle.channel.read_frame() {
                    Ok(frame) => {
                        aggregate.apply(Report::from(frame), now, self.config.ops_per_product)
                    }
                    Err(e) => {
                        debug!("Device {}: backlog ends early: {}", handle.index, e);
                        break;
                    }
                }
            }
        }
    }

    /// Releases the temperature source and all channels, and builds the
    /// per-device verdicts.
    fn terminate(mut self) -> RunSummary {
        self.poller.shutdown();
        self.progress.finish_and_clear();

        let verdicts = self
            .workers
            .iter_mut()
            .zip(&self.aggregates)
            .map(|(handle, aggregate)| {
                let exit = handle.reap();
                if let Some(exit) = exit {
                    debug!("Worker for device {} exited with {}", handle.index, exit.code());
                }
                GpuVerdict {
                    index: handle.index,
                    faulty: aggregate.ever_faulty,
                    died: aggregate.is_dead(),
                    abandoned: aggregate.abandoned,
                    processed: aggregate.total_processed,
                    exit,
                }
            })
            .collect();

        RunSummary {
            verdicts,
            elapsed: self.budget.start.elapsed(),
        }
    }

    /// Immediate shutdown after every worker died.
    fn abort(&mut self) {
        error!("No workers are alive, aborting");
        self.stop.request_stop();
        self.poller.shutdown();
        self.progress.finish_and_clear();
    }
}
