mod channel;
mod config;
mod cpu;
mod error;
#[cfg(feature = "gpu")]
mod gpu;
mod launcher;
mod matrices;
mod monitor;
mod temperature;
#[cfg(test)]
mod testing;
mod traits;
mod worker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::Parser;
use config::{
    parse_memory_budget, parse_run_duration, MemoryBudget, Precision, DEFAULT_STOP_TIMEOUT_SECS,
};
use cpu::CpuEngine;
use error::{exit_code, BurnError, EngineError};
use launcher::{LaunchConfig, Launcher};
use log::warn;
use monitor::RunSummary;
use temperature::TemperatureCommand;
use traits::ComputeEngine;

#[cfg(feature = "gpu")]
use gpu::GpuEngine;

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-GPU stress tester", long_about = None)]
struct Args {
    /// Run length: seconds, or a duration such as '5m' or '1h'
    #[arg(value_parser = parse_run_duration, default_value = "10")]
    duration: Duration,

    /// Memory per device: 'NNN' MiB, 'NN%' of available, or a size like '4GiB'
    #[arg(short, long, value_parser = parse_memory_budget)]
    memory: Option<MemoryBudget>,

    /// Burn with double precision
    #[arg(short, long, default_value_t = false)]
    doubles: bool,

    /// Try to use tensor cores
    #[arg(long = "tc", visible_alias = "tensor-cores", default_value_t = false)]
    tensor_cores: bool,

    /// List available devices and exit
    #[arg(short, long, default_value_t = false)]
    list: bool,

    /// Burn only the device with this index (see --list)
    #[arg(short = 'i', long)]
    device: Option<usize>,

    /// WGSL comparison kernel replacing the built-in one
    #[arg(short = 'c', long)]
    compare_kernel: Option<PathBuf>,

    /// Seconds workers get to stop before they are abandoned
    #[arg(long, default_value_t = DEFAULT_STOP_TIMEOUT_SECS)]
    stop_timeout: u64,

    /// Fail a device when one iteration takes longer than this many seconds
    #[arg(long)]
    gpu_timeout: Option<u64>,

    /// Burn CPU cores with the host reference engine instead of GPUs
    #[arg(long, default_value_t = false)]
    cpu: bool,

    /// Do not launch nvidia-smi for temperatures
    #[arg(long, default_value_t = false)]
    no_temps: bool,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

impl Args {
    fn launch_config(&self) -> LaunchConfig {
        LaunchConfig {
            duration: self.duration,
            precision: if self.doubles {
                Precision::Double
            } else {
                Precision::Single
            },
            use_tensor_path: self.tensor_cores,
            memory: self.memory.unwrap_or_default(),
            device: self.device,
            stop_timeout: Duration::from_secs(self.stop_timeout),
            completion_timeout: self.gpu_timeout.map(Duration::from_secs),
            temperatures: if self.no_temps || self.cpu {
                None
            } else {
                Some(TemperatureCommand::default())
            },
            ..LaunchConfig::default()
        }
    }
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => e.exit(),
            _ => {
                let _ = e.print();
                std::process::exit(exit_code::SYNTAX);
            }
        },
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if args.verbose { "debug" } else { "warn" }),
    )
    .init();

    let code = match run(args) {
        Ok(()) => exit_code::OK,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(args: Args) -> Result<(), BurnError> {
    let engine = build_engine(&args)?;

    if args.list {
        let devices = engine.devices()?;
        if devices.is_empty() {
            return Err(EngineError::NoDevices.into());
        }
        for device in devices {
            println!("{}", device);
        }
        return Ok(());
    }

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupt);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
        warn!("Couldn't install the Ctrl-C handler: {}", e);
    }

    let summary = Launcher::new(engine, args.launch_config()).run(Some(interrupt))?;
    print_verdicts(&summary);
    Ok(())
}

fn build_engine(args: &Args) -> Result<Arc<dyn ComputeEngine>, BurnError> {
    if args.cpu {
        if args.compare_kernel.is_some() {
            return Err(BurnError::Config(
                "--compare-kernel needs the GPU engine".to_string(),
            ));
        }
        return Ok(Arc::new(CpuEngine::new()));
    }
    gpu_engine(args)
}

#[cfg(feature = "gpu")]
fn gpu_engine(args: &Args) -> Result<Arc<dyn ComputeEngine>, BurnError> {
    let mut engine = GpuEngine::new();
    if let Some(path) = &args.compare_kernel {
        engine = engine.with_compare_kernel(path)?;
        println!("Using compare file: {}", path.display());
    }
    Ok(Arc::new(engine))
}

#[cfg(not(feature = "gpu"))]
fn gpu_engine(_args: &Args) -> Result<Arc<dyn ComputeEngine>, BurnError> {
    warn!("GPU support not compiled. Build with: cargo build --features gpu, or use --cpu");
    Err(EngineError::NoDevices.into())
}

fn print_verdicts(summary: &RunSummary) {
    println!();
    println!("Tested {} GPUs:", summary.verdicts.len());
    for verdict in &summary.verdicts {
        println!("\t{}", verdict);
    }
}
