//! ServeSim CLI: drive an LLM serving co-simulation against a timing engine.

use clap::{Parser, Subcommand};
use servesim_core::config::SimConfig;
use servesim_core::driver::Driver;
use servesim_core::metrics;
use servesim_core::trace::{self, SyntheticSpec};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "servesim",
    about = "Co-simulate LLM serving against an external timing engine",
    version
)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a co-simulation.
    Run {
        /// Path to TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
        /// Dataset file, overriding the config (batch mode only).
        #[arg(short, long)]
        dataset: Option<PathBuf>,
        /// Write the run report as JSON.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Write the completed-request log as JSONL.
        #[arg(long)]
        request_log: Option<PathBuf>,
        /// Keep serving after the queues drain.
        #[arg(long)]
        idle: bool,
        /// JSON request file admitted while the run is in progress.
        #[arg(long)]
        inject: Option<PathBuf>,
    },
    /// Generate a synthetic JSONL dataset.
    GenTrace {
        /// Number of requests.
        #[arg(short = 'n', long, default_value = "100")]
        count: usize,
        /// Poisson arrival rate (requests/sec); omit for no arrival times.
        #[arg(long)]
        rate: Option<f64>,
        /// Mean prompt tokens.
        #[arg(long, default_value = "128")]
        input_mean: f64,
        /// Spread of prompt tokens.
        #[arg(long, default_value = "32")]
        input_std: f64,
        /// Mean generated tokens.
        #[arg(long, default_value = "64")]
        output_mean: f64,
        /// Spread of generated tokens.
        #[arg(long, default_value = "16")]
        output_std: f64,
        #[arg(long, default_value = "42")]
        seed: u64,
        /// Output file path.
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            config,
            dataset,
            output,
            request_log,
            idle,
            inject,
        } => {
            let mut sim_config = SimConfig::from_file(&config).unwrap_or_else(|e| {
                eprintln!("Error loading config: {}", e);
                std::process::exit(1);
            });
            if idle {
                sim_config.simulation.idle_mode = true;
            }
            run(&sim_config, dataset.as_deref(), output, request_log, inject);
        }
        Commands::GenTrace {
            count,
            rate,
            input_mean,
            input_std,
            output_mean,
            output_std,
            seed,
            output,
        } => {
            let records = trace::generate_synthetic(&SyntheticSpec {
                count,
                rate,
                input_mean,
                input_std,
                output_mean,
                output_std,
                seed,
            });
            trace::write_jsonl(&records, &output).unwrap_or_else(|e| {
                eprintln!("Error writing trace: {}", e);
                std::process::exit(1);
            });
            println!("Generated {} requests to {}", records.len(), output.display());
        }
    }
}

fn run(
    sim_config: &SimConfig,
    dataset: Option<&Path>,
    output: Option<PathBuf>,
    request_log: Option<PathBuf>,
    inject: Option<PathBuf>,
) {
    let mut driver = Driver::from_sim_config(sim_config).unwrap_or_else(|e| {
        eprintln!("Error preparing simulation: {}", e);
        std::process::exit(1);
    });

    // Idle-mode runs start empty and are fed through the request API.
    if !sim_config.simulation.idle_mode {
        let requests = servesim_core::load_requests(sim_config, dataset).unwrap_or_else(|e| {
            eprintln!("Error loading dataset: {}", e);
            std::process::exit(1);
        });
        servesim_core::admit_all(&mut driver.scheduler().lock(), &requests).unwrap_or_else(
            |e| {
                eprintln!("Error admitting requests: {}", e);
                std::process::exit(1);
            },
        );
        info!(requests = requests.len(), "requests queued");
    }

    if let Some(path) = inject {
        spawn_injector(&driver, path, sim_config.simulation.idle_mode);
    }

    let result = driver.run();
    let report = driver.report();
    println!("{}", metrics::format_table(&report));

    if let Some(output_path) = output {
        let json = serde_json::to_string_pretty(&report).unwrap_or_else(|e| {
            eprintln!("Error serializing report: {}", e);
            std::process::exit(1);
        });
        std::fs::write(&output_path, json).unwrap_or_else(|e| {
            eprintln!("Error writing output: {}", e);
            std::process::exit(1);
        });
        println!("Results written to {}", output_path.display());
    }
    if let Some(log_path) = request_log {
        trace::write_request_log(&report.requests, &log_path).unwrap_or_else(|e| {
            eprintln!("Error writing request log: {}", e);
            std::process::exit(1);
        });
    }

    if let Err(e) = result {
        eprintln!("Simulation failed: {}", e);
        std::process::exit(1);
    }
}

/// Admit the requests in `path` from a background thread. In idle mode the
/// run is stopped once everything injected has completed.
fn spawn_injector(driver: &Driver, path: PathBuf, idle_mode: bool) {
    let api = driver.request_api();
    let stop = driver.stop_handle();
    std::thread::spawn(move || {
        let ids = match api.load_requests_from_file(&path) {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, path = %path.display(), "request injection failed");
                stop.store(true, Ordering::Release);
                return;
            }
        };
        if !idle_mode {
            return;
        }
        loop {
            let status = api.status();
            if status.pending_requests == 0
                && status.inflight_requests == 0
                && status.completed_requests >= ids.len()
            {
                stop.store(true, Ordering::Release);
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    });
}
