use async_trait::async_trait;
use metrics::{counter, histogram};

use crate::api::IngestError;
use crate::event::ProcessedEvent;

/// Hand-off of validated events to the broker. A batch is one logical
/// send: it either fully reaches the broker or the caller gets told to
/// retry the whole thing, never a partial success.
#[async_trait]
pub trait Event {
    async fn send(&self, event: ProcessedEvent) -> Result<(), IngestError>;
    async fn send_batch(&self, events: Vec<ProcessedEvent>) -> Result<(), IngestError>;
}

/// Stdout sink for local development.
pub struct PrintSink {}

#[async_trait]
impl Event for PrintSink {
    async fn send(&self, event: ProcessedEvent) -> Result<(), IngestError> {
        tracing::info!("single event: {:?}", event);
        counter!("ingest_events_published_total").increment(1);
        Ok(())
    }

    async fn send_batch(&self, events: Vec<ProcessedEvent>) -> Result<(), IngestError> {
        histogram!("ingest_event_batch_size").record(events.len() as f64);
        counter!("ingest_events_published_total").increment(events.len() as u64);
        for event in events {
            tracing::info!("event: {:?}", event);
        }
        Ok(())
    }
}
