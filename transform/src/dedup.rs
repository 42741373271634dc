use std::sync::Arc;

use metrics::counter;
use tracing::instrument;

use crate::error::Result;
use crate::store::{EventRow, EventStore};

#[derive(Debug, Eq, PartialEq)]
pub enum WriteOutcome {
    Inserted,
    Skipped,
}

/// Fast-path duplicate filter in front of the events table. The check and
/// the insert are not atomic; two consumers can race past the check with
/// the same id and both insert. That is fine: the table's merge policy
/// collapses them into one logical row, so the gate only needs to be
/// right most of the time to save redundant writes.
#[derive(Clone)]
pub struct DedupGate {
    store: Arc<dyn EventStore>,
}

impl DedupGate {
    pub fn new(store: Arc<dyn EventStore>) -> DedupGate {
        DedupGate { store }
    }

    /// Either outcome means the message can be acknowledged; only a store
    /// error leaves it unacknowledged.
    #[instrument(skip_all, fields(event_id = %row.event_id))]
    pub async fn process(&self, row: &EventRow) -> Result<WriteOutcome> {
        if self.store.contains(&row.event_id).await? {
            counter!("transform_events_skipped_total").increment(1);
            tracing::debug!("duplicate event, skipping write");
            return Ok(WriteOutcome::Skipped);
        }

        self.store.insert(row).await?;
        counter!("transform_events_written_total").increment(1);
        Ok(WriteOutcome::Inserted)
    }
}
