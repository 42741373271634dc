use async_trait::async_trait;
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{Result, TransformError};

/// One row in the events table. `payload` carries the full enriched JSON
/// as produced by the gateway; the typed columns are what queries filter
/// and partition on.
#[derive(Row, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub event_id: String,
    pub user_id: String,
    pub event_name: String,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub event_time: OffsetDateTime,
    pub payload: String,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub processed_at: OffsetDateTime,
}

impl EventRow {
    /// Build a row from a raw broker message. The gateway validated the
    /// event before publishing, so missing fields here mean the topic
    /// carries foreign traffic and the message is rejected.
    pub fn from_payload(payload: &[u8], processed_at: OffsetDateTime) -> Result<EventRow> {
        let value: serde_json::Value = serde_json::from_slice(payload)?;

        let field = |name: &'static str| -> Result<String> {
            value
                .get(name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or(TransformError::MissingField(name))
        };

        let event_time_raw = field("event_time")?;
        let event_time = OffsetDateTime::parse(&event_time_raw, &Rfc3339)
            .map_err(|_| TransformError::InvalidTimestamp(event_time_raw))?;

        Ok(EventRow {
            event_id: field("event_id")?,
            user_id: field("user_id")?,
            event_name: field("event_name")?,
            event_time,
            payload: value.to_string(),
            processed_at,
        })
    }
}

/// The merge policy below is what makes the pipeline idempotent: rows
/// sharing an event_id collapse into one logical row on merge, latest
/// processed_at winning. The dedup check in front of the insert is only
/// a fast path that saves rewriting known rows.
const EVENTS_TABLE_DDL: &str = "
    CREATE TABLE IF NOT EXISTS events (
        event_id     String,
        user_id      String,
        event_name   String,
        event_time   DateTime64(3),
        payload      String,
        processed_at DateTime64(3)
    )
    ENGINE = ReplacingMergeTree(processed_at)
    PARTITION BY toYYYYMM(event_time)
    ORDER BY event_id
";

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Has a row for this event id already been written?
    async fn contains(&self, event_id: &str) -> Result<bool>;

    async fn insert(&self, row: &EventRow) -> Result<()>;
}

pub struct ClickHouseEventStore {
    client: Client,
}

impl ClickHouseEventStore {
    pub fn new(url: &str, database: &str, user: &str, password: &str) -> ClickHouseEventStore {
        let client = Client::default()
            .with_url(url)
            .with_database(database)
            .with_user(user)
            .with_password(password);

        ClickHouseEventStore { client }
    }

    /// Provision the events table. Failing here is fatal to the process;
    /// running without the merge policy would break idempotency.
    pub async fn prepare(&self) -> Result<()> {
        self.client.query(EVENTS_TABLE_DDL).execute().await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for ClickHouseEventStore {
    async fn contains(&self, event_id: &str) -> Result<bool> {
        let count = self
            .client
            .query("SELECT count() FROM events WHERE event_id = ?")
            .bind(event_id)
            .fetch_one::<u64>()
            .await?;
        Ok(count > 0)
    }

    async fn insert(&self, row: &EventRow) -> Result<()> {
        let mut insert = self.client.insert("events")?;
        insert.write(row).await?;
        insert.end().await?;
        Ok(())
    }
}

#[cfg(test)]
pub use memory::MemoryEventStore;
