use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validation::Violation;

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestResponseStatus {
    Success,
}

/// Body returned to clients on an accepted submission. `batch_id` and
/// `events_processed` are only present on the batch endpoint.
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub status: IngestResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events_processed: Option<usize>,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),

    #[error("invalid event batch")]
    InvalidInput(Vec<Violation>),

    #[error("maximum event size exceeded")]
    EventTooBig,

    #[error("missing or invalid API key")]
    Unauthenticated,
    #[error("IP address not allowed")]
    Forbidden,
    #[error("rate limit exceeded")]
    RateLimited,

    #[error("{0} unavailable, please retry")]
    Unavailable(&'static str),

    #[error("internal error")]
    Internal,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a [Violation]>,
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let (code, error) = match &self {
            IngestError::RequestParsingError(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
            IngestError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "Invalid batch"),
            IngestError::EventTooBig => (StatusCode::BAD_REQUEST, "Bad Request"),
            IngestError::Unauthenticated => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            IngestError::Forbidden => (StatusCode::FORBIDDEN, "Forbidden"),
            IngestError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests"),
            IngestError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "Service unavailable"),
            IngestError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        };

        let details = match &self {
            IngestError::InvalidInput(violations) => Some(violations.as_slice()),
            _ => None,
        };

        let body = ErrorBody {
            error,
            message: self.to_string(),
            details,
        };
        (code, Json(&body)).into_response()
    }
}
