use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use users_outbox::config::AppConfig;
use users_outbox::messaging::KafkaBroker;
use users_outbox::metrics::{self, RelayMetrics};
use users_outbox::relay::{Relay, RelayLane};
use users_outbox::scheduler::Scheduler;
use users_outbox::store::PgStore;
use users_outbox::utils::{retry_with_backoff, RetryConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default filter
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,users_outbox=debug"))
        )
        .init();

    let config = AppConfig::load()?;
    tracing::info!(
        kafka_brokers = %config.kafka_brokers,
        poll_interval_ms = config.relay.poll_interval.as_millis() as u64,
        batch_size = config.relay.batch_size,
        "Starting users outbox relay"
    );

    // === 1. PostgreSQL ===
    let store = retry_with_backoff("connect postgres", &RetryConfig::startup(), |_| {
        PgStore::connect(&config.database_url, config.database_max_connections)
    })
    .await?;
    store.migrate().await?;
    let store = Arc::new(store);

    // === 2. Metrics ===
    let metrics = Arc::new(RelayMetrics::new()?);
    let registry = metrics.registry().clone();
    let metrics_port = config.metrics_port;
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Runtime::new() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build metrics runtime");
                return;
            }
        };
        runtime.block_on(async {
            if let Err(e) = metrics::start_metrics_server(registry, metrics_port).await {
                tracing::error!(error = %e, "Metrics server error");
            }
        });
    });

    // === 3. Kafka ===
    let broker = Arc::new(
        KafkaBroker::new(&config.kafka_brokers, config.kafka_message_timeout)?.with_metrics(metrics.clone()),
    );

    // === 4. Relay ===
    let relay = Arc::new(Relay::new(store, broker, config.relay.clone()).with_metrics(metrics));
    let lanes = RelayLane::for_mode(config.relay.lanes);

    let mut scheduler = Scheduler::new();
    relay.schedule(&mut scheduler, &lanes);
    scheduler.start();
    tracing::info!(instance_id = %relay.instance_id(), lanes = lanes.len(), "Relay running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, waiting for in-flight cycles");

    scheduler.shutdown().await;
    for lane in &lanes {
        if let Err(e) = relay.release(lane).await {
            tracing::warn!(lane = lane.name(), error = %e, "Failed to release relay lane");
        }
    }

    tracing::info!("Relay stopped");
    Ok(())
}
