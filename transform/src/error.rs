use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("ClickHouse error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),

    #[error("Kafka error: {0}")]
    Kafka(String),

    #[error("deserialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("event is missing required field {0}")]
    MissingField(&'static str),

    #[error("invalid event_time: {0}")]
    InvalidTimestamp(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, TransformError>;
