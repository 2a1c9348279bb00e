use std::path::PathBuf;

use clap::Parser;
use rover_motor_link::config::{DEFAULT_BAUDRATE, MONITOR_HZ};
use rover_motor_link::loader;
use rover_motor_link::motor::{Connector, SerialConnector};
use rover_motor_link::registry::Registry;
use rover_motor_link::runtime::{self, RuntimeOptions};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Serial control plane for dual-motor PID boards
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// JSON file declaring links and initial motor parameters
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Extra port to register (repeatable), after the config's links
    #[arg(short, long = "port")]
    ports: Vec<String>,

    /// Baud rate for links that do not set their own
    #[arg(short, long, default_value_t = DEFAULT_BAUDRATE)]
    baud: u32,

    /// Monitor loop frequency in Hz
    #[arg(short, long, default_value_t = MONITOR_HZ, value_parser = clap::value_parser!(u64).range(1..=1000))]
    rate: u64,

    /// Print one JSON status report per tick on stdout
    #[arg(long)]
    json: bool,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if args.list_ports {
        for port in SerialConnector.available_ports()? {
            println!("{}", port);
        }
        return Ok(());
    }

    let mut registry = Registry::new();

    if let Some(path) = &args.config {
        let mut config = loader::load(path)?;
        config.default_baud = args.baud;
        let report = registry.load_from_config(&config);
        for issue in &report.issues {
            warn!("Config {}: {}", path.display(), issue);
        }
        if report.is_clean() {
            info!("Loaded {} links from {}", report.links.len(), path.display());
        } else {
            warn!(
                "Loaded {} links from {} with {} issues",
                report.links.len(),
                path.display(),
                report.issues.len()
            );
        }
    }

    for port in &args.ports {
        if let Err(e) = registry.add_link(port, args.baud) {
            warn!("{}", e);
        }
    }

    let options = RuntimeOptions {
        rate_hz: args.rate,
        default_baud: args.baud,
        json: args.json,
    };
    runtime::run(registry, options).await
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug); logs go to stderr so --json stays parseable
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Args::parse()).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
