//! CLI Entry Point for experiment-driver
//!
//! Provides a command-line interface for:
//! - Running a simulated plan against the mock apparatus (`demo`)
//! - Validating a configuration file (`check-config`)
//!
//! # Usage
//!
//! Run the demo plan:
//! ```bash
//! experiment-driver demo --config config/driver.toml
//! ```
//!
//! Simulate a vacuum failure 300 ms into the run:
//! ```bash
//! experiment-driver demo --leak-after-ms 300
//! ```
//!
//! Stream plan events as JSON lines:
//! ```bash
//! experiment-driver demo --events
//! ```

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use experiment_driver::config::{DriverConfig, DEFAULT_CONFIG_PATH};
use experiment_driver::experiment::{
    BroadcastRecorder, ExperimentDriver, ExperimentPlan, LimitCondition,
};
use experiment_driver::hardware::{MockApparatus, MockTriggerable};
use experiment_driver::logging;
use experiment_driver::signal::{LinearSignal, ObservableSignal, SignalRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

#[derive(Parser)]
#[command(name = "experiment-driver")]
#[command(about = "Signal-bounded experiment plan execution", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated two-segment plan against the mock apparatus
    Demo {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Override the configured log level
        #[arg(long)]
        log_level: Option<String>,

        /// Override the configured log format (pretty, compact, json)
        #[arg(long)]
        format: Option<String>,

        /// Drop the chamber pressure below zero after this many milliseconds
        #[arg(long)]
        leak_after_ms: Option<u64>,

        /// Print every plan event as a JSON line
        #[arg(long)]
        events: bool,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            config,
            log_level,
            format,
            leak_after_ms,
            events,
        } => {
            let mut config = load_config(&config)?;
            if let Some(level) = log_level {
                config.application.log_level = level;
            }
            if let Some(format) = format {
                config.application.log_format = format;
            }
            config.validate().map_err(|e| anyhow!(e))?;
            logging::init_from_config(&config).map_err(|e| anyhow!(e))?;
            run_demo(&config, leak_after_ms.map(Duration::from_millis), events).await
        }
        Commands::CheckConfig { config } => check_config(&config),
    }
}

fn load_config(path: &Path) -> Result<DriverConfig> {
    Ok(DriverConfig::load_from(path)?)
}

fn check_config(path: &Path) -> Result<()> {
    println!("🔍 Checking configuration: {}", path.display());
    let config = load_config(path)?;
    match config.validate() {
        Ok(()) => {
            println!("✅ Configuration is valid");
            println!();
            println!("{}", config.to_toml()?);
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Invalid configuration: {}", e);
            Err(anyhow!(e))
        }
    }
}

async fn run_demo(config: &DriverConfig, leak_after: Option<Duration>, events: bool) -> Result<()> {
    println!("🚀 {}", config.application.name);
    println!();

    println!("🔧 Initializing simulated furnace...");
    let temperature = LinearSignal::new("T", 20.0, 4.0);
    let pressure = ObservableSignal::new("P", 1.0);
    let signals = SignalRegistry::new()
        .with(Arc::new(temperature))
        .with(Arc::new(pressure.clone()));

    let furnace = MockApparatus::new("furnace");
    let detector = MockTriggerable::new();

    let plan = ExperimentPlan::builder("heat and hold")
        .description("Ramp to 100 and hold for one second")
        .driver("furnace")
        .signal("T")
        .segment("ramp", LimitCondition::at_least(100.0))
        .enable("snapshot")
        .timed_segment("hold", Duration::from_secs(1))
        .position_trigger("snapshot", 20.0)
        .abort_condition("vacuum lost", "P", LimitCondition::below(0.0))
        .build()?;

    let mut builder = ExperimentDriver::builder(furnace.clone(), signals)
        .config(config)
        .trigger_action("snapshot", detector.clone());
    let printer = if events {
        let recorder = BroadcastRecorder::new(config.engine.recorder_channel_capacity);
        let printer = print_events(&recorder);
        builder = builder.recorder(recorder);
        Some(printer)
    } else {
        None
    };
    let driver = builder.build();

    driver.load_plan(plan).await?;
    driver.zero().await?;

    println!("▶️  Starting plan...");
    driver.start().await?;

    if let Some(delay) = leak_after {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pressure.set(-1.0);
        });
    }

    driver.wait_for_idle().await;
    let record = driver.last_record().await;
    drop(driver);
    if let Some(printer) = printer {
        // The printer ends once the recorder is dropped with the driver
        let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
    }
    println!();

    match record {
        Some(record) => {
            println!("{}", record.summary());
            println!("📸 Detector snapshots: {}", detector.count());
            println!("🔁 Apparatus hooks: {:?}", furnace.calls());
            Ok(())
        }
        None => Err(anyhow!("plan finished without a record")),
    }
}

/// Print events published by `recorder` as JSON lines until it is dropped.
fn print_events(recorder: &BroadcastRecorder) -> JoinHandle<()> {
    let mut rx = recorder.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!(error = %e, "Cannot serialize plan event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event printer fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
