use std::fmt::Display;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::{error, info};
use tokio::sync::watch;

use telemetry_collector::config::{self, ServiceConfig, DEFAULT_SEND_INTERVAL_SECS};
use telemetry_collector::producer::{ProducerClient, SimulatedSensor};
use telemetry_collector::region::SharedRegion;
use telemetry_collector::service::Service;
use telemetry_collector::stop_on_signal;

#[derive(Parser)]
#[command(name = "telemetry-collector", version, about = "Sensor reading collector with shared-memory stats")]
struct Cli {
    /// JSON file overriding the default service settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the collector
    Server,
    /// Send simulated readings to a running collector
    Producer {
        /// Seconds between readings (fractions allowed)
        interval: Option<f64>,
    },
    /// Print the published summary once
    Monitor,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = ServiceConfig::load(cli.config.as_deref()).unwrap_or_else(|e| fatal(e));

    match cli.command {
        Command::Server => run_server(config).await,
        Command::Producer { interval } => run_producer(config, interval).await,
        Command::Monitor => run_monitor(config),
    }
}

async fn run_server(config: ServiceConfig) {
    info!("starting collector '{}'", config.service_name);

    // ── 1. Window, region, endpoint ──────────────────────────────
    let service = Service::start(config).unwrap_or_else(|e| fatal(e));

    // ── 2. Ctrl-C flips the shutdown flag ────────────────────────
    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(stop_on_signal(tokio::signal::ctrl_c(), stop));

    // ── 3. Serve ─────────────────────────────────────────────────
    service.run(shutdown).await;
}

async fn run_producer(config: ServiceConfig, interval: Option<f64>) {
    let interval = config::send_interval(interval.unwrap_or(DEFAULT_SEND_INTERVAL_SECS))
        .unwrap_or_else(|e| fatal(e));

    let pid = std::process::id();
    let socket_path = config.socket_path();
    let client = ProducerClient::connect(&socket_path, pid as i32)
        .await
        .unwrap_or_else(|e| {
            fatal(format!(
                "{e} (make sure the server is running and '{}' exists)",
                config.service_name
            ))
        });

    info!(
        "producer {pid} started, sending every {:.2}s",
        interval.as_secs_f64()
    );

    let seed = chrono::Utc::now().timestamp() as u64 ^ pid as u64;
    let mut sensor = SimulatedSensor::new(seed);
    if client.run(&mut sensor, interval, None).await.is_err() {
        std::process::exit(1);
    }
}

fn run_monitor(config: ServiceConfig) {
    let region = SharedRegion::open(&config.region_name).unwrap_or_else(|e| {
        fatal(format!("cannot open region '{}': {e}", config.region_name))
    });
    let summary = region.read().unwrap_or_else(|e| fatal(e));

    match serde_json::to_string_pretty(&summary) {
        Ok(json) => println!("{json}"),
        Err(e) => fatal(e),
    }
}

fn fatal(err: impl Display) -> ! {
    error!("{err}");
    std::process::exit(1);
}
