//! `perftrack` command-line tool: configuration helpers and a synthetic
//! workload demo that prints the tracker's views.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand, ValueEnum};
use rand::Rng;
use tracing::{info, warn};

use perftrack::{
    init_logging, AlertSeverity, ExportFormat, PerformanceTracker, Threshold, TrackOptions, TrackerConfig,
    ENGINE_NAME, ENGINE_VERSION,
};

// ----------------------------------------------------------------------------
// CLI Argument Parser
// ----------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "perftrack",
    author = "AIOps Team",
    version,
    about = "In-process performance tracking: timing, windowed stats, threshold alerts and export"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "perftrack.toml", env = "PERFTRACK_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "PERFTRACK_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a configuration file
    Validate {
        /// Print the fully resolved configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Write the default configuration
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Drive a synthetic concurrent workload and print a view of the result
    Demo {
        /// Number of tracked invocations
        #[arg(short = 'n', long, default_value_t = 200)]
        operations: usize,

        /// View to print once the workload settles
        #[arg(short = 'o', long, value_enum, default_value_t = DemoView::Dashboard)]
        format: DemoView,
    },

    /// Show version and build info
    Version,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DemoView {
    Json,
    Prometheus,
    Dashboard,
}

// ----------------------------------------------------------------------------
// CLI Handler Functions
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = TrackerConfig::load(config_path)
        .with_context(|| format!("Configuration {} is invalid", config_path.display()))?;
    println!("Configuration is valid");

    if verbose {
        println!("{}", "=".repeat(60));
        println!("{}", toml::to_string_pretty(&config).context("Failed to render configuration")?);
    }

    println!("Summary:");
    println!("  window per operation: {}", config.retention.max_measurements_per_operation);
    println!("  alert history:        {}", config.retention.max_alerts);
    println!("  stale after:          {}", humantime::format_duration(config.tracking.stale_after));
    println!("  default sample rate:  {}", config.tracking.default_sample_rate);
    println!("  thresholds:           {}", config.thresholds.len());
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let rendered = TrackerConfig::generate_default_config().context("Failed to render default configuration")?;
    match output {
        Some(path) => {
            fs::write(path, &rendered).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

fn handle_version() {
    println!("{} v{}", ENGINE_NAME, ENGINE_VERSION);
    println!("  target: {}-{}", std::env::consts::ARCH, std::env::consts::OS);
}

// ----------------------------------------------------------------------------
// Demo Workload
// ----------------------------------------------------------------------------

const DEMO_OPERATIONS: [&str; 4] = ["api.getUserData", "api.listOrders", "db.query", "slow.report"];

async fn handle_demo(config: TrackerConfig, operations: usize, view: DemoView) -> AnyhowResult<()> {
    let tracker = Arc::new(PerformanceTracker::new(config).context("Failed to build tracker")?);
    tracker.set_threshold(Threshold::new("slow.*").max_duration_ms(50.0))?;
    tracker.set_threshold(
        Threshold::new("api.*")
            .max_duration_ms(25.0)
            .severity(AlertSeverity::Error),
    )?;

    info!(target: "perftrack::tracker", operations, "Starting demo workload");

    // ThreadRng is not Send, so every draw happens before spawning.
    let plan: Vec<(&'static str, u64, bool)> = {
        let mut rng = rand::thread_rng();
        (0..operations)
            .map(|_| {
                let operation = DEMO_OPERATIONS[rng.gen_range(0..DEMO_OPERATIONS.len())];
                let delay_ms = if operation.starts_with("slow.") {
                    rng.gen_range(20..120)
                } else {
                    rng.gen_range(1..30)
                };
                (operation, delay_ms, rng.gen_bool(0.05))
            })
            .collect()
    };

    let tasks = plan.into_iter().map(|(operation, delay_ms, fails)| {
        let tracker = tracker.clone();
        tokio::spawn(async move {
            let options = TrackOptions::new()
                .include_memory_usage(true)
                .tag("demo")
                .custom_metric("delay_ms", move || Ok(delay_ms as f64));
            tracker
                .track_async(operation, options, async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    if fails {
                        Err(format!("{operation} failed after {delay_ms}ms"))
                    } else {
                        Ok(delay_ms)
                    }
                })
                .await
        })
    });

    for joined in futures::future::join_all(tasks).await {
        match joined.context("Demo task panicked")? {
            Ok(_) => {}
            Err(e) => warn!(target: "perftrack::tracker", error = %e, "Demo invocation rejected"),
        }
    }

    let report = tracker.cleanup();
    info!(target: "perftrack::cleanup", %report, "Demo workload finished");

    let rendered = match view {
        DemoView::Json => tracker.export_metrics(ExportFormat::Json)?,
        DemoView::Prometheus => tracker.export_metrics(ExportFormat::Prometheus)?,
        DemoView::Dashboard => serde_json::to_string_pretty(&tracker.get_dashboard_data())
            .context("Failed to render dashboard")?,
    };
    println!("{}", rendered);

    tracker.dispose();
    Ok(())
}

// ----------------------------------------------------------------------------
// Main Entry Point
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that need neither configuration nor logging
    match &cli.command {
        Commands::Version => {
            handle_version();
            return Ok(());
        }
        Commands::GenerateConfig { output } => return handle_generate_config(output.as_deref()),
        Commands::Validate { verbose } => return handle_validate(&cli.config, *verbose),
        Commands::Demo { .. } => {}
    }

    let config = if cli.config.exists() {
        TrackerConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        TrackerConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    let _guard = init_logging(&logging_config).context("Failed to initialize logging")?;

    if !cli.config.exists() {
        warn!(
            target: "perftrack::config",
            "Config file not found at {}, using defaults",
            cli.config.display()
        );
    }

    if let Commands::Demo { operations, format } = cli.command {
        handle_demo(config, operations, format).await?;
    }
    Ok(())
}
