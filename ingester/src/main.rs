use std::sync::Arc;

use axum::{routing::get, Router};
use common_metrics::{serve, setup_metrics_routes};
use ingester::{app_context::AppContext, config::Config, consumer::start_consumer};
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

common_alloc::used!();

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse().unwrap()),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "event ingester"
}

#[tokio::main]
async fn main() {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_with_defaults().expect("failed to load configuration");
    let context = Arc::new(
        AppContext::new(&config)
            .await
            .expect("failed to build app context"),
    );

    // Health and metrics server
    let bind = format!("{}:{}", config.host, config.port);
    let health_registry = context.health_registry.clone();
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || std::future::ready(health_registry.get_status())),
        );
    let router = setup_metrics_routes(router);

    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start health server");
    });

    // Graceful drain on ctrl-c: the in-flight batch completes, producers
    // flush, offsets commit
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    start_consumer(context, shutdown_rx).await;

    info!("Ingester shut down");
}
