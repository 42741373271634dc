use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use metrics::{counter, gauge, histogram};
use rdkafka::config::ClientConfig;
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::producer::future_producer::{FutureProducer, FutureRecord};
use rdkafka::producer::{DeliveryFuture, Producer};
use rdkafka::util::Timeout;
use tracing::info;

use crate::api::IngestError;
use crate::event::ProcessedEvent;
use crate::sink::Event;

struct IngestContext {
    liveness: HealthHandle,
}

impl rdkafka::ClientContext for IngestContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Stats callbacks only fire while librdkafka's main loop is alive,
        // so they double as the producer's liveness report.
        self.liveness.report_healthy_blocking();

        gauge!("ingest_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("ingest_kafka_producer_queue_bytes").set(stats.msg_size as f64);
    }
}

pub struct KafkaSink {
    producer: FutureProducer<IngestContext>,
    topic: String,
}

impl KafkaSink {
    pub fn new(
        topic: String,
        brokers: String,
        tls: bool,
        liveness: HealthHandle,
    ) -> anyhow::Result<KafkaSink> {
        info!("connecting to Kafka brokers at {}...", brokers);

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &brokers)
            .set("statistics.interval.ms", "10000")
            .set("message.timeout.ms", "10000");

        if tls {
            config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        let producer: FutureProducer<IngestContext> =
            config.create_with_context(IngestContext { liveness })?;

        // Ping the cluster to make sure we can reach brokers before
        // accepting traffic.
        let _metadata = producer.client().fetch_metadata(
            Some("__consumer_offsets"),
            Timeout::After(Duration::new(10, 0)),
        )?;
        info!("connected to Kafka brokers");

        Ok(KafkaSink { producer, topic })
    }

    /// Enqueue one event, keyed by its id so replays of the same id land
    /// on the same partition for the downstream duplicate filter.
    fn enqueue(&self, event: &ProcessedEvent) -> Result<DeliveryFuture, IngestError> {
        match self.producer.send_result(FutureRecord {
            topic: self.topic.as_str(),
            payload: Some(&event.data),
            partition: None,
            key: Some(event.key()),
            timestamp: None,
            headers: None,
        }) {
            Ok(ack) => Ok(ack),
            Err((err, _)) => match err.rdkafka_error_code() {
                Some(RDKafkaErrorCode::MessageSizeTooLarge) => {
                    counter!("ingest_events_dropped_total", "cause" => "too_big").increment(1);
                    Err(IngestError::EventTooBig)
                }
                _ => {
                    tracing::error!("failed to enqueue event: {}", err);
                    counter!("ingest_events_dropped_total", "cause" => "enqueue_failed")
                        .increment(1);
                    Err(IngestError::Unavailable("broker"))
                }
            },
        }
    }

    /// Wait for the broker to confirm a delivery. Any failure means the
    /// caller must retry the whole submission.
    async fn confirm(ack: DeliveryFuture) -> Result<(), IngestError> {
        match ack.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((err, _))) => {
                tracing::error!("kafka delivery failed: {}", err);
                counter!("ingest_events_dropped_total", "cause" => "delivery_failed").increment(1);
                Err(IngestError::Unavailable("broker"))
            }
            Err(_) => {
                // Cancelled by the producer being dropped mid-flight.
                tracing::error!("kafka delivery confirmation cancelled");
                Err(IngestError::Unavailable("broker"))
            }
        }
    }
}

#[async_trait]
impl Event for KafkaSink {
    async fn send(&self, event: ProcessedEvent) -> Result<(), IngestError> {
        let ack = self.enqueue(&event)?;
        Self::confirm(ack).await?;
        counter!("ingest_events_published_total").increment(1);
        Ok(())
    }

    async fn send_batch(&self, events: Vec<ProcessedEvent>) -> Result<(), IngestError> {
        histogram!("ingest_event_batch_size").record(events.len() as f64);

        // Enqueue the full batch before waiting on any confirmation, then
        // require every delivery to succeed. A single failure reports the
        // whole batch as retryable; no partial success is surfaced.
        let mut acks = Vec::with_capacity(events.len());
        for event in &events {
            acks.push(self.enqueue(event)?);
        }
        for ack in acks {
            Self::confirm(ack).await?;
        }

        counter!("ingest_events_published_total").increment(events.len() as u64);
        Ok(())
    }
}
