//! # Circuit CLI
//!
//! Command-line runner for declarative circuit simulations.

use anyhow::Context;
use circuit_assembly::{run_simulation, validate, SimulationRequest, SimulatorConfig};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "circuit")]
#[command(version = "0.1.0")]
#[command(about = "Declarative neural circuit assembly and simulation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and run a circuit description, writing response JSON
    Run {
        /// Request file (JSON)
        request: PathBuf,
        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Seed for reproducible sampling and noisy event trains
        #[arg(short, long)]
        seed: Option<u64>,
        /// Integration timestep override (ms)
        #[arg(long)]
        dt: Option<f64>,
    },

    /// Check a circuit description without running it
    Validate {
        /// Request file (JSON)
        request: PathBuf,
    },
}

fn load_request(path: &Path) -> anyhow::Result<SimulationRequest> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading request file '{}'", path.display()))?;
    let req: SimulationRequest =
        serde_json::from_str(&text).with_context(|| format!("parsing '{}'", path.display()))?;
    Ok(req)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            request,
            output,
            seed,
            dt,
        } => {
            let req = load_request(&request)?;
            let mut config = SimulatorConfig {
                seed,
                ..Default::default()
            };
            if let Some(dt) = dt {
                config.dt = dt;
            }

            println!(
                "{} {} ({:?} mode, tstop {} ms)",
                "Running:".green().bold(),
                request.display(),
                req.mode,
                req.tstop
            );

            let report = run_simulation(&req, &config)?;

            for warning in &report.diagnostics.warnings {
                eprintln!("{} {}", "warning:".yellow().bold(), warning);
            }

            let json = serde_json::to_string_pretty(&report.response)?;
            match output {
                Some(path) => {
                    fs::write(&path, json)
                        .with_context(|| format!("writing '{}'", path.display()))?;
                    println!(
                        "{} {} traces -> {}",
                        "Done:".green().bold(),
                        report.response.traces.len(),
                        path.display()
                    );
                }
                None => println!("{json}"),
            }
        }

        Commands::Validate { request } => {
            let req = load_request(&request)?;
            validate(&req)?;
            println!("{} {}", "Valid:".green().bold(), request.display());
        }
    }

    Ok(())
}
