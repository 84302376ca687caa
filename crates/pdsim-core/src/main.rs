//! PDSim CLI: simulate continuous batching on an accelerator grid.

use clap::{Parser, Subcommand};
use pdsim_core::config::SimConfig;
use pdsim_core::request::TraceRequest;
use pdsim_core::trace::{self, SyntheticTrace};
use pdsim_core::{metrics, run_simulation};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "pdsim",
    about = "Simulate continuous prefill/decode batching on an accelerator grid",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation.
    Run {
        /// Path to TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
        /// Path to trace file; overrides `trace.path`.
        #[arg(short, long)]
        trace: Option<PathBuf>,
        /// Write the report as JSON.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate a synthetic compact JSONL trace.
    GenTrace {
        /// Number of requests.
        #[arg(long, default_value = "100")]
        count: usize,
        /// Request rate (requests per simulated second).
        #[arg(long, default_value = "10000")]
        rate: f64,
        /// Mean sequence length in tokens.
        #[arg(long, default_value = "64")]
        seq_mean: f64,
        /// Spread of the sequence length.
        #[arg(long, default_value = "32")]
        seq_std: f64,
        #[arg(long, default_value = "42")]
        seed: u64,
        /// Output file path.
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Check a configuration file and print the grid partitioning.
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "pdsim=info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            trace: trace_path,
            output,
        } => {
            let sim_config = load_config(&config);
            let requests = load_requests(&sim_config, trace_path.as_deref());

            let report = run_simulation(sim_config, requests)
                .await
                .unwrap_or_else(|e| {
                    eprintln!("Simulation failed: {}", e);
                    std::process::exit(1);
                });
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
        }
        Commands::GenTrace {
            count,
            rate,
            seq_mean,
            seq_std,
            seed,
            output,
        } => {
            let requests = SyntheticTrace {
                count,
                rate,
                seq_len_mean: seq_mean,
                seq_len_std: seq_std,
                seed,
            }
            .generate();
            trace::write_compact_jsonl_file(&requests, &output).unwrap_or_else(|e| {
                eprintln!("Error writing trace: {}", e);
                std::process::exit(1);
            });
            println!(
                "Generated {} requests to {}",
                requests.len(),
                output.display()
            );
        }
        Commands::Validate { config } => {
            let sim_config = load_config(&config);
            println!("Configuration OK: {}", sim_config.simulation.name);
            println!(
                "  credit={} pd_ratio={} decode_cap={}",
                sim_config.scheduler.core_credit,
                sim_config.scheduler.pd_ratio,
                sim_config.decode_cap()
            );
            for layout in sim_config.group_layouts() {
                println!(
                    "  {:?}: workers {}..{} in rings of {}",
                    layout.kind, layout.workers.start, layout.workers.end, layout.stages
                );
            }
        }
    }
}

fn load_config(path: &Path) -> SimConfig {
    SimConfig::from_file(path).unwrap_or_else(|e| {
        eprintln!("Error loading config: {}", e);
        std::process::exit(1);
    })
}

fn load_requests(config: &SimConfig, trace_path: Option<&Path>) -> Vec<TraceRequest> {
    let path = trace_path
        .map(PathBuf::from)
        .or_else(|| config.trace.path.as_ref().map(PathBuf::from));

    match path {
        Some(p) => trace::load_trace(&p, &config.trace.format).unwrap_or_else(|e| {
            eprintln!("Error loading trace: {}", e);
            std::process::exit(1);
        }),
        None => {
            eprintln!("No trace file specified. Use --trace or set trace.path in config.");
            std::process::exit(1);
        }
    }
}
