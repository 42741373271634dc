use std::sync::Arc;

use axum::extract::State;
use axum::{Extension, Json};
use bytes::Bytes;
use metrics::counter;
use tracing::instrument;

use crate::api::{IngestError, IngestResponse, IngestResponseStatus};
use crate::auth::AuthedKey;
use crate::event::{process_event, BatchEnvelope, ProcessedEvent, ProcessingContext, RawEvent};
use crate::prometheus::report_dropped_events;
use crate::validation::validate_batch;
use crate::{router, sink};

#[instrument(skip_all, fields(key))]
pub async fn event(
    state: State<router::State>,
    Extension(authed): Extension<AuthedKey>,
    body: Bytes,
) -> Result<Json<IngestResponse>, IngestError> {
    tracing::Span::current().record("key", authed.name.as_str());

    let raw = RawEvent::from_bytes(body)?;
    let batch = BatchEnvelope::wrap_single(raw);
    validate_batch(&batch).map_err(IngestError::InvalidInput)?;

    counter!("ingest_events_received_total").increment(1);

    // Single submissions carry no envelope of their own, only the
    // ingestion timestamp is attached.
    let context = ProcessingContext {
        ingested_at: state.timesource.current_time(),
        batch_id: None,
        batch_sent_at: None,
        client_info: None,
    };

    let processed = process_event(&batch.events[0], &context)?;
    let event_id = processed.event_id.clone();

    if let Err(err) = state.sink.send(processed).await {
        report_dropped_events("sink_error", 1);
        tracing::warn!("failed to hand event off to the sink: {}", err);
        return Err(err);
    }

    Ok(Json(IngestResponse {
        status: IngestResponseStatus::Success,
        event_id: Some(event_id),
        batch_id: None,
        events_processed: None,
    }))
}

#[instrument(skip_all, fields(key, batch_size))]
pub async fn batch(
    state: State<router::State>,
    Extension(authed): Extension<AuthedKey>,
    body: Bytes,
) -> Result<Json<IngestResponse>, IngestError> {
    tracing::Span::current().record("key", authed.name.as_str());

    let envelope = BatchEnvelope::from_bytes(body)?;
    tracing::Span::current().record("batch_size", envelope.events.len());

    validate_batch(&envelope).map_err(IngestError::InvalidInput)?;

    counter!("ingest_events_received_total").increment(envelope.events.len() as u64);

    let context = ProcessingContext {
        ingested_at: state.timesource.current_time(),
        batch_id: envelope.batch_id.clone(),
        batch_sent_at: envelope.sent_at.clone(),
        client_info: envelope.client_info.clone(),
    };

    let events_processed = envelope.events.len();
    if let Err(err) = process_batch(state.sink.clone(), &envelope.events, &context).await {
        report_dropped_events("sink_error", events_processed as u64);
        tracing::warn!("failed to hand batch off to the sink: {}", err);
        return Err(err);
    }

    Ok(Json(IngestResponse {
        status: IngestResponseStatus::Success,
        event_id: None,
        batch_id: envelope.batch_id,
        events_processed: Some(events_processed),
    }))
}

#[instrument(skip_all, fields(events = events.len()))]
async fn process_batch(
    sink: Arc<dyn sink::Event + Send + Sync>,
    events: &[RawEvent],
    context: &ProcessingContext,
) -> Result<(), IngestError> {
    let events: Vec<ProcessedEvent> = events
        .iter()
        .map(|e| process_event(e, context))
        .collect::<Result<Vec<ProcessedEvent>, IngestError>>()?;

    sink.send_batch(events).await
}
