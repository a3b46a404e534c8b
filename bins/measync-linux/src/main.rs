use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use measync_core::config::default_source_folder;
use measync_core::{Array, ArrayData, ConfigStorage, DataModel, FileConfigStorage, RegistryConfig};
use measync_live::{ControlServer, Publisher, DEFAULT_BIND_ATTEMPTS};
use measync_protocol::{Endpoint, DEFAULT_CONTROL_PORT, DEFAULT_DATA_PORT};
use measync_registry::{ChangeListener, Poller, SourceRegistry};

#[derive(Parser)]
#[command(name = "measync")]
#[command(about = "Measurement data source registry and live demo producer", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the configured sources and log layout changes
    Monitor {
        /// Registry configuration file (JSON); defaults apply when omitted
        config: Option<PathBuf>,
    },

    /// Publish synthetic measurements and answer save requests
    Demo {
        /// Live channel port
        #[arg(default_value_t = DEFAULT_DATA_PORT)]
        data_port: u16,

        /// Control channel port
        #[arg(default_value_t = DEFAULT_CONTROL_PORT)]
        control_port: u16,

        /// File written on every save request [default: ~/plot_data/demo.h5]
        save_path: Option<PathBuf>,
    },
}

/// Interval between demo publishes.
const DEMO_PERIOD: Duration = Duration::from_millis(100);

/// Samples per demo trace.
const DEMO_SAMPLES: usize = 200;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,measync_registry=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Monitor { config } => run_monitor(config).await,
        Commands::Demo {
            data_port,
            control_port,
            save_path,
        } => {
            let save_path = save_path.unwrap_or_else(|| default_source_folder().join("demo.h5"));
            run_demo(data_port, control_port, save_path).await
        }
    }
}

// ============================================================================
// monitor
// ============================================================================

/// Logs registry notifications.
#[derive(Default)]
struct LogListener {
    refreshes: u64,
}

impl ChangeListener for LogListener {
    fn on_layout_changed(&mut self, layout: &BTreeSet<String>) {
        let names: Vec<&str> = layout.iter().map(String::as_str).collect();
        tracing::info!("Layout: [{}]", names.join(", "));
    }

    fn on_data_refreshed(&mut self) {
        self.refreshes += 1;
        if self.refreshes % 10 == 0 {
            tracing::info!("{} refreshes", self.refreshes);
        }
    }

    fn on_config_changed(&mut self, config: &RegistryConfig) {
        tracing::info!("Polling every {} ms", config.poll_interval_ms);
    }
}

async fn run_monitor(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = match &config_path {
        Some(path) => FileConfigStorage::new(path)
            .load_config()
            .with_context(|| format!("loading {}", path.display()))?,
        None => RegistryConfig::default(),
    };

    if config.watch_folder {
        std::fs::create_dir_all(&config.source_folder)
            .with_context(|| format!("creating {}", config.source_folder.display()))?;
    }

    tracing::info!("Watching {}", config.source_folder.display());
    let mut registry = SourceRegistry::init(config)?;
    registry.add_listener(Box::new(LogListener::default()));

    let poller = Poller::spawn(registry);
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl+C, shutting down...");

    let registry = poller.stop().await?;
    for source in registry.sources() {
        tracing::info!("{}: {:?}", source.id(), source.status());
    }
    Ok(())
}

// ============================================================================
// demo
// ============================================================================

async fn run_demo(data_port: u16, control_port: u16, save_path: PathBuf) -> anyhow::Result<()> {
    let publisher = Publisher::bind(&Endpoint::any(data_port), DEFAULT_BIND_ATTEMPTS).await?;
    let control = ControlServer::bind(
        &Endpoint::any(control_port),
        DEFAULT_BIND_ATTEMPTS,
        Arc::new(publisher.save_handler(&save_path)),
    )
    .await?;

    tracing::info!("Demo producer ready");
    tracing::info!("   Data:    {}", publisher.endpoint());
    tracing::info!("   Control: {}", control.endpoint());
    tracing::info!("   Saves:   {}", save_path.display());

    let mut ticker = tokio::time::interval(DEMO_PERIOD);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut iteration: i64 = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Received Ctrl+C, shutting down...");
                break;
            }
            _ = ticker.tick() => {
                iteration += 1;
                publisher.publish(&demo_model(iteration)?)?;
            }
        }
    }

    Ok(())
}

/// Synthetic measurement: two traces, a small 2-D scan and some attributes.
fn demo_model(iteration: i64) -> anyhow::Result<DataModel> {
    let phase = iteration as f64 * 0.1;
    let time: Vec<f64> = (0..DEMO_SAMPLES).map(|i| i as f64 * 0.01).collect();
    let temp: Vec<f64> = time.iter().map(|t| 20.0 + (t * 6.0 + phase).sin()).collect();
    let pressure: Vec<f64> = time
        .iter()
        .map(|t| 1013.0 + 2.0 * (t * 2.0 - phase).cos())
        .collect();

    let counts: Vec<u64> = (0..64u64).map(|i| (i * 7 + iteration as u64) % 100).collect();
    let scan = DataModel::new()
        .with("counts", Array::new(vec![8, 8], ArrayData::U64(counts))?)?
        .with_attr("detector", "demo");

    let model = DataModel::new()
        .with("time", time)?
        .with("temp", temp)?
        .with("pressure", pressure)?
        .with("scan", scan)?
        .with_attr("iteration", iteration)
        .with_attr(
            "timestamp",
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        );
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_demo_defaults() {
        let cli = Cli::try_parse_from(["measync", "demo"]).unwrap();
        match cli.command {
            Commands::Demo {
                data_port,
                control_port,
                save_path,
            } => {
                assert_eq!(data_port, DEFAULT_DATA_PORT);
                assert_eq!(control_port, DEFAULT_CONTROL_PORT);
                assert!(save_path.is_none());
            }
            Commands::Monitor { .. } => panic!("expected demo"),
        }
    }

    #[test]
    fn test_invalid_port_rejected() {
        assert!(Cli::try_parse_from(["measync", "demo", "70000"]).is_err());
        assert!(Cli::try_parse_from(["measync"]).is_err());
    }

    #[test]
    fn test_monitor_config_path() {
        let cli = Cli::try_parse_from(["measync", "monitor", "lab.json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Monitor { config: Some(path) } if path == PathBuf::from("lab.json")
        ));
    }
}
