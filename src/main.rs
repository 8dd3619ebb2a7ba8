//! DORA Metrics Collector Binary

use clap::Parser;
use dora_collector::cli::Cli;
use dora_collector::server::{self, AppState};
use dora_collector::{Config, DoraEngine, EngineSettings, GitHubEventSource, PrometheusRegistry, Scheduler};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // Initialize tracing
    initialize_tracing();

    info!("Starting DORA metrics collector v{}", env!("CARGO_PKG_VERSION"));

    // Load and validate configuration
    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    info!(
        "Collector configuration - Repositories: {}, Window: {} days, Interval: {}s, Mode: {:?}",
        config.repositories.len(),
        config.window_days,
        config.collection_interval.as_secs(),
        config.event_mode
    );
    for repository in &config.repositories {
        info!("  - {}", repository);
    }

    let source = match GitHubEventSource::from_config(&config) {
        Ok(source) => Arc::new(source),
        Err(e) => {
            error!("Failed to create GitHub client: {}", e);
            std::process::exit(1);
        }
    };

    if !cli.skip_access_check && !source.test_connectivity().await {
        error!("Failed to authenticate with GitHub. Please check your token and permissions.");
        std::process::exit(1);
    }

    let registry = Arc::new(PrometheusRegistry::new());
    let engine = Arc::new(DoraEngine::new(
        source,
        registry.clone(),
        EngineSettings::from_config(&config),
    ));
    let scheduler = Scheduler::new(
        engine,
        config.repositories.clone(),
        config.collection_interval,
    );

    if cli.once {
        let results = scheduler.run_once().await;
        print!("{}", registry.render());
        if results.iter().any(|(_, ok)| !ok) {
            std::process::exit(2);
        }
        return Ok(());
    }

    let tasks = scheduler.spawn();

    let state = AppState {
        registry,
        repositories: config.repositories.len(),
    };
    let served = server::serve(state, config.port).await;

    info!("Shutting down DORA metrics collector");
    for task in tasks {
        task.abort();
    }
    served
}

/// Initialize structured logging
fn initialize_tracing() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
