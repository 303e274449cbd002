use std::sync::Arc;

use clap::Parser;
use monolith::{
    api::{ApiConfig, ApiState, spawn_api_server},
    config::read_config_file,
    services::supervisor::Supervisor,
};
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init(log_file_name: &str) -> anyhow::Result<()> {
    let filter = filter::Targets::new().with_targets(vec![
        ("monolith", LevelFilter::TRACE),
        ("tower_http", LevelFilter::DEBUG),
    ]);

    let log_file = std::fs::File::create(log_file_name)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(log_file)),
        )
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = read_config_file(&args.file)?;

    init(&config.monolith.log_file_name)?;
    trace!("started with args: {args:?}");

    info!(
        "starting monolith instance '{}'",
        config.monolith.instance_name
    );

    let supervisor = Supervisor::build(&config)?;
    supervisor.start().await?;

    let state = ApiState {
        registrar: supervisor.registrar.clone(),
        stream: supervisor.stream.clone(),
        ingest: supervisor.ingest.clone(),
        heartbeats: supervisor.heartbeats.clone(),
        metrics: supervisor.metrics.clone(),
    };

    let bind_addr = format!(
        "{}:{}",
        config.networking.ipv4_address, config.networking.http_port
    )
    .parse()?;

    spawn_api_server(ApiConfig { bind_addr }, state).await?;

    info!("monolith active, press Ctrl+C to shut down gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("received shutdown signal, stopping services...");
        }
        Err(err) => {
            error!("unable to listen for shutdown signal: {err}");
        }
    }

    supervisor.stop().await;

    info!("all services stopped, exiting");
    Ok(())
}
