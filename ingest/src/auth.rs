use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum_client_ip::InsecureClientIp;
use metrics::counter;
use sha2::{Digest, Sha256};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::instrument;
use uuid::Uuid;

use crate::api::IngestError;
use crate::keys::{KeyStore, Quota};
use crate::redis::CounterClient;
use crate::router;

/// Header carrying the credential secret.
pub const API_KEY_HEADER: &str = "x-api-key";

/// How often the live window counter is projected into Postgres. A fixed
/// contract, like the hash below, so all gateway pods behave the same.
const PERSIST_EVERY: u64 = 10;

const RATE_LIMIT_KEY_PREFIX: &str = "ratelimit:";

/// The resolved credential, attached to the request context after
/// admission for downstream logging and response metadata.
#[derive(Clone, Debug)]
pub struct AuthedKey {
    pub id: Uuid,
    pub name: String,
    pub quota: Quota,
}

/// The rate-limit key is a one-way hash of the secret: plaintext secrets
/// never land in Redis, and independently deployed gateways derive the
/// same key. SHA-256 here is a fixed algorithm contract, not config.
pub fn rate_limit_key(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    format!("{RATE_LIMIT_KEY_PREFIX}{}", hex::encode(digest))
}

/// The top-of-hour bucket label used for the durable counter projection.
fn window_start_hour(now: OffsetDateTime) -> String {
    let hour = format_description!("[year]-[month]-[day]T[hour]:00:00");
    now.format(&hour)
        .unwrap_or_else(|_| String::from("unknown"))
}

/// The authenticate-then-throttle decision, made once per inbound request.
///
/// Both stores fail closed: an outage on the credential lookup or on the
/// counter increment rejects the request with 503 instead of waving it
/// through unauthenticated or unmetered.
#[derive(Clone)]
pub struct AdmissionGate {
    keys: Arc<dyn KeyStore + Send + Sync>,
    counter: Arc<dyn CounterClient + Send + Sync>,
}

impl AdmissionGate {
    pub fn new(
        keys: Arc<dyn KeyStore + Send + Sync>,
        counter: Arc<dyn CounterClient + Send + Sync>,
    ) -> AdmissionGate {
        AdmissionGate { keys, counter }
    }

    #[instrument(skip_all, fields(client_ip = %client_ip))]
    pub async fn admit(
        &self,
        secret: Option<&str>,
        client_ip: IpAddr,
    ) -> Result<AuthedKey, IngestError> {
        let Some(secret) = secret else {
            counter!("ingest_requests_rejected_total", "cause" => "missing_key").increment(1);
            return Err(IngestError::Unauthenticated);
        };

        let record = match self.keys.lookup(secret).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                counter!("ingest_requests_rejected_total", "cause" => "unknown_key").increment(1);
                return Err(IngestError::Unauthenticated);
            }
            Err(err) => {
                tracing::error!("credential lookup failed: {}", err);
                return Err(IngestError::Unavailable("credential store"));
            }
        };

        if let Some(allowed) = record.allowed_ips() {
            if !allowed.is_empty() && !allowed.iter().any(|ip| ip == &client_ip.to_string()) {
                counter!("ingest_requests_rejected_total", "cause" => "ip_not_allowed")
                    .increment(1);
                return Err(IngestError::Forbidden);
            }
        }

        let quota = record.quota();
        let key = rate_limit_key(secret);
        let count = match self.counter.incr(key.clone()).await {
            Ok(count) => count,
            Err(err) => {
                tracing::error!("rate counter increment failed: {}", err);
                return Err(IngestError::Unavailable("rate counter"));
            }
        };

        // First increment of a fresh window arms its expiry. If this races
        // a concurrent first increment, both observe count == 1 at most
        // once, so the TTL is set exactly when the window starts.
        if count == 1 {
            if let Err(err) = self
                .counter
                .expire(key, u64::from(quota.window_secs))
                .await
            {
                tracing::error!("failed to arm rate window expiry: {}", err);
                return Err(IngestError::Unavailable("rate counter"));
            }
        }

        // Periodic audit projection. The decision below is already made;
        // a bookkeeping failure must not revert it, so errors are logged
        // and swallowed.
        if count % PERSIST_EVERY == 0 {
            let window_start = window_start_hour(OffsetDateTime::now_utc());
            if let Err(err) = self
                .keys
                .record_window(record.id, &window_start, count)
                .await
            {
                tracing::warn!("failed to persist rate counter projection: {}", err);
            }
        }

        // The increment above is not rolled back on rejection: rejected
        // requests still consume quota, so a retry storm cannot reset its
        // own budget.
        if count > u64::from(quota.requests) {
            counter!("ingest_requests_rejected_total", "cause" => "rate_limited").increment(1);
            return Err(IngestError::RateLimited);
        }

        Ok(AuthedKey {
            id: record.id,
            name: record.name,
            quota,
        })
    }
}

/// Route-layer middleware for the ingestion endpoints. Health, index and
/// metrics routes are mounted outside this layer and stay unauthenticated.
pub async fn admission_middleware(
    State(state): State<router::State>,
    InsecureClientIp(client_ip): InsecureClientIp,
    mut request: Request,
    next: Next,
) -> Result<Response, IngestError> {
    let secret = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    let authed = state.gate.admit(secret, client_ip).await?;
    tracing::debug!(key = %authed.name, "request admitted");

    request.extensions_mut().insert(authed);
    Ok(next.run(request).await)
}
