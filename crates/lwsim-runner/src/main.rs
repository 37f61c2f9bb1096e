//! # lwsim
//!
//! CLI runner for the lwsim LoRaWAN network simulator.

use lwsim_runner::{RunnerError, SimTime, SimulationStats, Simulator};

use clap::{Parser, Subcommand};
use lwsim_model::{load_model, load_models, Model};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Duration Parsing
// ============================================================================

/// Parse a duration string with units into seconds.
///
/// Accepts plain seconds (`90`, `2.5`) or unit suffixes `s`, `m`, `h`, `d`,
/// optionally combined (`1h30m`).
fn parse_duration(s: &str) -> Result<f64, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        return if secs > 0.0 {
            Ok(secs)
        } else {
            Err(format!("Invalid duration: '{}'", s))
        };
    }

    let mut total_seconds = 0.0;
    let mut current_number = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() || c == '.' {
            current_number.push(c);
            continue;
        }
        if current_number.is_empty() {
            return Err(format!("Invalid duration format: unexpected '{}' in '{}'", c, s));
        }
        let value: f64 = current_number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", current_number, s))?;
        let multiplier = match c {
            's' => 1.0,
            'm' => 60.0,
            'h' => 3600.0,
            'd' => 86400.0,
            _ => {
                return Err(format!(
                    "Unknown duration unit '{}' in '{}'. Use s, m, h, or d.",
                    c, s
                ))
            }
        };
        total_seconds += value * multiplier;
        current_number.clear();
    }
    if !current_number.is_empty() {
        let value: f64 = current_number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", current_number, s))?;
        total_seconds += value;
    }

    if total_seconds <= 0.0 {
        return Err(format!("Invalid duration: '{}'", s));
    }
    Ok(total_seconds)
}

// ============================================================================
// CLI Configuration
// ============================================================================

/// lwsim - LoRaWAN Network Simulator
#[derive(Parser, Debug)]
#[command(name = "lwsim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a simulation from YAML model files
    Run(RunConfig),
    /// List all available metrics with descriptions and labels
    Metrics,
    /// Load and validate YAML model files without running them
    Validate(ValidateConfig),
}

/// Configuration for a simulation run
#[derive(Parser, Debug)]
pub struct RunConfig {
    /// Path(s) to YAML model file(s). Multiple files are merged in order (later overrides earlier).
    #[arg(required = true)]
    pub models: Vec<PathBuf>,

    /// Random seed (overrides the model's seed)
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Simulated duration (overrides the model's duration).
    /// Accepts plain seconds or units: 60, 60s, 10m, 2h, 1d, 1h30m
    #[arg(short, long, value_parser = parse_duration)]
    pub duration: Option<f64>,

    /// Write the per-transmission event log to this file (JSON)
    #[arg(long, value_name = "PATH")]
    pub event_log: Option<PathBuf>,

    /// Print only the statistics JSON
    #[arg(long)]
    pub stats_only: bool,
}

/// Configuration for model validation
#[derive(Parser, Debug)]
pub struct ValidateConfig {
    /// Path(s) to YAML model file(s), merged in order.
    #[arg(required = true)]
    pub models: Vec<PathBuf>,
}

// ============================================================================
// Commands
// ============================================================================

fn load(paths: &[PathBuf]) -> Result<Model, RunnerError> {
    let model = if paths.len() == 1 {
        load_model(&paths[0])?
    } else {
        let paths: Vec<&Path> = paths.iter().map(|p| p.as_path()).collect();
        load_models(&paths)?
    };
    Ok(model)
}

fn run_simulation(config: &RunConfig) -> Result<SimulationStats, RunnerError> {
    let mut model = load(&config.models)?;
    if let Some(seed) = config.seed {
        model.simulation.seed = seed;
    }
    if let Some(duration) = config.duration {
        model.simulation.duration_s = duration;
    }
    info!(
        files = config.models.len(),
        nodes = model.nodes.len(),
        gateways = model.gateways.len(),
        seed = model.simulation.seed,
        "model loaded"
    );

    let mut sim = Simulator::new(&model)?;
    if config.event_log.is_some() {
        sim.enable_event_log();
    }

    // Set up Ctrl+C handler for graceful shutdown
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::Relaxed);
    })
    .map_err(|e| RunnerError::ConfigError(format!("Error setting Ctrl+C handler: {}", e)))?;

    let until = SimTime::from_secs(model.simulation.duration_s);
    let stats = sim.run_with_stop_flag(until, Some(stop_flag))?;

    if let (Some(path), Some(log)) = (&config.event_log, sim.event_log()) {
        let writer = BufWriter::new(File::create(path)?);
        log.write_json(writer)?;
        info!(path = %path.display(), rows = log.len(), "event log written");
    }
    Ok(stats)
}

fn print_summary(stats: &SimulationStats) {
    eprintln!("Simulated {:.3} s in {} events", stats.simulation_time_s, stats.total_events);
    eprintln!(
        "  Uplinks:   {} sent, {} delivered, {} collision losses, {} no coverage (PDR {:.1}%)",
        stats.uplinks_sent,
        stats.uplinks_delivered,
        stats.collision_losses,
        stats.no_coverage,
        stats.pdr() * 100.0
    );
    eprintln!(
        "  Downlinks: {} scheduled, {} delivered, {} undelivered, {} dropped",
        stats.downlinks_scheduled,
        stats.downlinks_delivered,
        stats.downlinks_undelivered,
        stats.downlinks_dropped
    );
    eprintln!(
        "  Server:    {} packets, {} duplicates, {} ADR commands, {} join accepts, {} beacons",
        stats.server_packets_received,
        stats.duplicates,
        stats.adr_commands,
        stats.join_accepts,
        stats.beacons_sent
    );
}

fn validate_models(config: &ValidateConfig) -> Result<(), RunnerError> {
    let model = load(&config.models)?;
    Simulator::new(&model)?;
    println!(
        "OK: {} node(s), {} gateway(s), {} s simulated",
        model.nodes.len(),
        model.gateways.len(),
        model.simulation.duration_s
    );
    Ok(())
}

/// Print information about all available metrics
fn print_metrics_info() {
    use lwsim_metrics::metric_defs;

    println!("lwsim Available Metrics");
    println!("=======================\n");

    println!("Per-node metrics carry the following labels:");
    println!("  - node: Node identifier");
    println!("  - node_class: Device class (class_a, class_b, class_c)");
    println!();

    let categories = [
        ("Uplinks", "lwsim.uplink."),
        ("Gateways", "lwsim.gateway."),
        ("Downlinks", "lwsim.downlink."),
        ("Network Server", "lwsim.server."),
        ("ADR", "lwsim.adr."),
        ("Simulation", "lwsim.simulation."),
    ];

    for (category_name, prefix) in categories {
        println!("## {}\n", category_name);
        for metric in metric_defs::ALL {
            if !metric.name.starts_with(prefix) {
                continue;
            }
            println!("  {}", metric.name);
            println!("    Type: {}", metric.kind);
            let unit_str = metric.unit_str();
            if !unit_str.is_empty() {
                println!("    Unit: {}", unit_str);
            }
            if !metric.description.is_empty() {
                println!("    Description: {}", metric.description);
            }
            if !metric.labels.is_empty() {
                println!("    Labels: {}", metric.labels.join(", "));
            }
            println!();
        }
    }
}

fn main() -> Result<(), RunnerError> {
    // Default to "warn" level if RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(config) => {
            let stats = run_simulation(&config)?;
            if !config.stats_only {
                print_summary(&stats);
            }
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Metrics => {
            print_metrics_info();
        }
        Commands::Validate(config) => {
            validate_models(&config)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90"), Ok(90.0));
        assert_eq!(parse_duration("2.5"), Ok(2.5));
        assert_eq!(parse_duration("10m"), Ok(600.0));
        assert_eq!(parse_duration("1h30m"), Ok(5400.0));
        assert_eq!(parse_duration("1d"), Ok(86400.0));
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("0").is_err());
        assert!(parse_duration("m").is_err());
    }
}
