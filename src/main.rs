// src/main.rs

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, sync::Arc, time::Duration as StdDuration};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

mod calendar;
mod config;
mod model;
mod reconcile;
mod report;
mod server;
mod store;

use config::AppConfig;
use reconcile::{ReconcileEngine, SystemClock};
use server::AppState;
use store::ScheduleStore;

#[derive(Parser, Debug)]
#[command(name = "trainerlog", about = "Club course schedule and trainer hours ledger")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API (default).
    Serve,
    /// Run one bulk resync pass over all assignments and exit.
    Resync,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Setting tracing subscriber failed")?;

    let cli = Cli::parse();
    let app_config = config::load_app_config()?;
    info!(
        "Configuration loaded (activation date {}, port {})",
        app_config.activation_date, app_config.port
    );

    let store = Arc::new(ScheduleStore::new());
    let clock = Arc::new(SystemClock);
    let engine = Arc::new(ReconcileEngine::new(
        store.clone(),
        clock.clone(),
        app_config.activation_date,
    ));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Resync => {
            let summary = engine.resync_past_days();
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Serve => serve(app_config, store, engine, clock).await,
    }
}

async fn serve(
    app_config: AppConfig,
    store: Arc<ScheduleStore>,
    engine: Arc<ReconcileEngine>,
    clock: Arc<SystemClock>,
) -> Result<()> {
    // Periodic resync so training days that pass without any edit still get
    // their hours posted.
    let periodic_engine = engine.clone();
    let interval = app_config.resync_interval_secs;
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(StdDuration::from_secs(interval)).await;
            info!("Starting periodic training session resync...");
            let summary = periodic_engine.resync_past_days();
            if summary.failed > 0 {
                error!(
                    "Periodic resync finished with {} failed tuple(s)",
                    summary.failed
                );
            }
        }
    });

    let state = AppState {
        store,
        engine,
        clock,
    };

    let cors = match &app_config.cors_origin {
        Some(origin) => {
            let origin = origin
                .parse::<HeaderValue>()
                .context("Invalid CORS_ORIGIN value")?;
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods(Any)
                .allow_headers(Any)
        }
        None => CorsLayer::permissive(),
    };

    let app = server::build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], app_config.port));
    info!("Starting server on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind server address")?;
    axum::serve(listener, app)
        .await
        .context("HTTP server failed")?;

    Ok(())
}
