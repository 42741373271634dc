use std::time::Duration;

use metrics::counter;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::ClientConfig;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::dedup::DedupGate;
use crate::error::{Result, TransformError};
use crate::store::EventRow;

const METRIC_MESSAGE_FAILURES: &str = "transform_message_failures_total";

pub fn create_consumer(brokers: &str, group_id: &str, topic: &str) -> Result<StreamConsumer> {
    // Offsets are committed by hand, only after a message is acknowledged.
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("group.id", group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("session.timeout.ms", "10000")
        .create()
        .map_err(|e| TransformError::Kafka(e.to_string()))?;

    consumer
        .subscribe(&[topic])
        .map_err(|e| TransformError::Kafka(e.to_string()))?;

    Ok(consumer)
}

pub async fn run_consumer(consumer: StreamConsumer, gate: DedupGate, shutdown: CancellationToken) {
    use futures::StreamExt;

    let mut stream = consumer.stream();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Kafka consumer shutting down");
                break;
            }
            result = stream.next() => {
                let Some(result) = result else {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                };

                let msg = match result {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::error!(error = %e, "Kafka consumer error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                // A bad message is logged with enough context to replay it
                // and the stream moves on; one poisoned event must not
                // stall its partition.
                match handle_message(&gate, &msg).await {
                    Ok(()) => {
                        if let Err(e) = consumer.commit_message(&msg, CommitMode::Async) {
                            tracing::error!(error = %e, "failed to commit offset");
                        }
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            topic = msg.topic(),
                            partition = msg.partition(),
                            offset = msg.offset(),
                            payload = %String::from_utf8_lossy(msg.payload().unwrap_or_default()),
                            "failed to process message"
                        );
                        counter!(METRIC_MESSAGE_FAILURES, "cause" => failure_cause(&e))
                            .increment(1);
                    }
                }
            }
        }
    }
}

async fn handle_message(gate: &DedupGate, msg: &BorrowedMessage<'_>) -> Result<()> {
    let payload = msg
        .payload()
        .ok_or(TransformError::MissingField("payload"))?;

    let row = EventRow::from_payload(payload, OffsetDateTime::now_utc())?;
    gate.process(&row).await?;
    Ok(())
}

fn failure_cause(error: &TransformError) -> &'static str {
    match error {
        TransformError::ClickHouse(_) => "clickhouse",
        TransformError::Kafka(_) => "kafka",
        TransformError::Serialization(_) => "deserialize",
        TransformError::MissingField(_) => "missing_field",
        TransformError::InvalidTimestamp(_) => "invalid_timestamp",
        TransformError::Internal(_) => "internal",
    }
}
