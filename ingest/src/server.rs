use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use health::{ComponentStatus, HealthRegistry};
use tokio::net::TcpListener;

use crate::auth::AdmissionGate;
use crate::config::Config;
use crate::keys::PgKeyStore;
use crate::redis::{CounterClient, RedisClient};
use crate::router;
use crate::sink::PrintSink;
use crate::sinks::kafka::KafkaSink;
use crate::time::SystemTime;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let liveness = HealthRegistry::new("liveness");

    let key_store = PgKeyStore::new(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to connect to the key store");
    key_store
        .prepare()
        .await
        .expect("failed to prepare key store schema");

    let redis_client = Arc::new(
        RedisClient::new(config.redis_url.clone()).expect("failed to create redis client"),
    );

    // The counter store has no background loop of its own, so keep its
    // liveness fresh with a periodic ping.
    let redis_liveness = liveness
        .register("redis".to_string(), Duration::from_secs(30))
        .await;
    tokio::spawn({
        let client = redis_client.clone();
        async move {
            loop {
                match client.ping().await {
                    Ok(()) => redis_liveness.report_healthy().await,
                    Err(err) => {
                        tracing::error!("redis ping failed: {}", err);
                        redis_liveness.report_status(ComponentStatus::Unhealthy).await;
                    }
                }
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        }
    });

    let gate = AdmissionGate::new(Arc::new(key_store), redis_client);

    let app = if config.print_sink {
        // Print sink is only used for local debug, don't allow a container
        // with it to report healthy.
        liveness
            .register("print_sink".to_string(), Duration::from_secs(30))
            .await
            .report_status(ComponentStatus::Unhealthy)
            .await;

        router::router(
            SystemTime {},
            liveness,
            PrintSink {},
            gate,
            config.export_prometheus,
        )
    } else {
        let sink_liveness = liveness
            .register("rdkafka".to_string(), Duration::from_secs(30))
            .await;

        let sink = KafkaSink::new(
            config.kafka_topic.clone(),
            config.kafka_hosts.clone(),
            config.kafka_tls,
            sink_liveness,
        )
        .expect("failed to start Kafka sink");

        router::router(
            SystemTime {},
            liveness,
            sink,
            gate,
            config.export_prometheus,
        )
    };

    tracing::info!("listening on {:?}", listener.local_addr().unwrap());

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .unwrap()
}
