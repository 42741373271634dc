use std::sync::Arc;

use envconfig::Envconfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use transform::config::Config;
use transform::consumer::{create_consumer, run_consumer};
use transform::dedup::DedupGate;
use transform::store::ClickHouseEventStore;

async fn shutdown(token: CancellationToken) {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
    token.cancel();
}

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("invalid configuration:");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = ClickHouseEventStore::new(
        &config.clickhouse_url,
        &config.clickhouse_database,
        &config.clickhouse_user,
        &config.clickhouse_password,
    );
    store
        .prepare()
        .await
        .expect("failed to prepare events table");

    let consumer = create_consumer(
        &config.kafka_hosts,
        &config.kafka_group_id,
        &config.kafka_topic,
    )
    .expect("failed to create Kafka consumer");

    tracing::info!(
        topic = %config.kafka_topic,
        group = %config.kafka_group_id,
        "starting transform consumer"
    );

    let gate = DedupGate::new(Arc::new(store));
    let token = CancellationToken::new();

    tokio::spawn(shutdown(token.clone()));
    run_consumer(consumer, gate, token).await;
}
