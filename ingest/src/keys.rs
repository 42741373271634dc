use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use thiserror::Error;
use uuid::Uuid;

/// Per-key request quota: `requests` per `window_secs` rolling window.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct Quota {
    pub requests: u32,
    pub window_secs: u32,
}

impl Default for Quota {
    fn default() -> Self {
        Quota {
            requests: 1000,
            window_secs: 3600,
        }
    }
}

/// A durable API key record. Keys are revoked (active = false), never
/// deleted, so the counter projections keep a valid referent.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub key: String,
    pub name: String,
    pub active: bool,
    pub allowed_ips: Option<Json<Vec<String>>>,
    pub rate_limit_requests: i32,
    pub rate_limit_window: i32,
    pub created_at: DateTime<Utc>,
}

impl ApiKeyRecord {
    pub fn quota(&self) -> Quota {
        Quota {
            requests: self.rate_limit_requests.max(0) as u32,
            window_secs: self.rate_limit_window.max(0) as u32,
        }
    }

    pub fn allowed_ips(&self) -> Option<&[String]> {
        self.allowed_ips.as_deref().map(Vec::as_slice)
    }
}

/// Store failures stay distinct from "key not found": an outage must
/// surface as 503 at the gate, never as a mass 401.
#[derive(Error, Debug)]
pub enum KeyStoreError {
    #[error("credential store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Find an active credential by its secret. `Ok(None)` covers both
    /// unknown and revoked keys.
    async fn lookup(&self, secret: &str) -> Result<Option<ApiKeyRecord>, KeyStoreError>;

    async fn create(
        &self,
        name: &str,
        quota: Quota,
        allowed_ips: Option<Vec<String>>,
    ) -> Result<ApiKeyRecord, KeyStoreError>;

    /// Flip a key inactive. Revoking an already-revoked or unknown key is
    /// not an error.
    async fn revoke(&self, secret: &str) -> Result<(), KeyStoreError>;

    /// All records, most recently created first.
    async fn list(&self) -> Result<Vec<ApiKeyRecord>, KeyStoreError>;

    /// Best-effort durable projection of a rate window, for audit only.
    /// The Redis counter stays authoritative; this row may lag or be lost.
    async fn record_window(
        &self,
        key_id: Uuid,
        window_start: &str,
        count: u64,
    ) -> Result<(), KeyStoreError>;
}

/// Generate a fresh secret: 32 random bytes hex-encoded under a stable
/// prefix, 256 bits of entropy.
fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("ak_{}", hex::encode(bytes))
}

pub struct PgKeyStore {
    pool: PgPool,
}

impl PgKeyStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<PgKeyStore, KeyStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(PgKeyStore { pool })
    }

    /// Create the credential tables if needed. Called once at startup;
    /// failure here is fatal to the process.
    pub async fn prepare(&self) -> Result<(), KeyStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                id UUID PRIMARY KEY,
                key TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                allowed_ips JSONB,
                rate_limit_requests INTEGER NOT NULL DEFAULT 1000,
                rate_limit_window INTEGER NOT NULL DEFAULT 3600,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rate_limit_counters (
                api_key_id UUID NOT NULL REFERENCES api_keys (id),
                window_start TEXT NOT NULL,
                request_count BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (api_key_id, window_start)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl KeyStore for PgKeyStore {
    async fn lookup(&self, secret: &str) -> Result<Option<ApiKeyRecord>, KeyStoreError> {
        let record = sqlx::query_as::<_, ApiKeyRecord>(
            "SELECT * FROM api_keys WHERE key = $1 AND active = TRUE",
        )
        .bind(secret)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn create(
        &self,
        name: &str,
        quota: Quota,
        allowed_ips: Option<Vec<String>>,
    ) -> Result<ApiKeyRecord, KeyStoreError> {
        let record = sqlx::query_as::<_, ApiKeyRecord>(
            r#"
            INSERT INTO api_keys (id, key, name, active, allowed_ips, rate_limit_requests, rate_limit_window)
            VALUES ($1, $2, $3, TRUE, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(generate_secret())
        .bind(name)
        .bind(allowed_ips.map(Json))
        .bind(quota.requests as i32)
        .bind(quota.window_secs as i32)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn revoke(&self, secret: &str) -> Result<(), KeyStoreError> {
        sqlx::query("UPDATE api_keys SET active = FALSE WHERE key = $1")
            .bind(secret)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ApiKeyRecord>, KeyStoreError> {
        let records =
            sqlx::query_as::<_, ApiKeyRecord>("SELECT * FROM api_keys ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(records)
    }

    async fn record_window(
        &self,
        key_id: Uuid,
        window_start: &str,
        count: u64,
    ) -> Result<(), KeyStoreError> {
        sqlx::query(
            r#"
            INSERT INTO rate_limit_counters (api_key_id, window_start, request_count)
            VALUES ($1, $2, $3)
            ON CONFLICT (api_key_id, window_start)
            DO UPDATE SET request_count = EXCLUDED.request_count
            "#,
        )
        .bind(key_id)
        .bind(window_start)
        .bind(count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory fake, keyed by secret. Good enough for gate and router tests;
/// `set_failing` turns every call into an outage to verify fail-closed
/// behavior.
#[derive(Clone, Default)]
pub struct MockKeyStore {
    records: Arc<Mutex<HashMap<String, ApiKeyRecord>>>,
    windows: Arc<Mutex<Vec<(Uuid, String, u64)>>>,
    failing: Arc<Mutex<bool>>,
    fail_record_window: Arc<Mutex<bool>>,
}

impl MockKeyStore {
    pub fn new() -> MockKeyStore {
        Default::default()
    }

    pub fn with_key(self, secret: &str, quota: Quota, allowed_ips: Option<Vec<String>>) -> Self {
        let record = ApiKeyRecord {
            id: Uuid::now_v7(),
            key: secret.to_string(),
            name: format!("test key {secret}"),
            active: true,
            allowed_ips: allowed_ips.map(Json),
            rate_limit_requests: quota.requests as i32,
            rate_limit_window: quota.window_secs as i32,
            created_at: Utc::now(),
        };
        self.records
            .lock()
            .unwrap()
            .insert(secret.to_string(), record);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn set_fail_record_window(&self, failing: bool) {
        *self.fail_record_window.lock().unwrap() = failing;
    }

    pub fn recorded_windows(&self) -> Vec<(Uuid, String, u64)> {
        self.windows.lock().unwrap().clone()
    }

    fn check_failing(&self) -> Result<(), KeyStoreError> {
        if *self.failing.lock().unwrap() {
            return Err(KeyStoreError::Unavailable(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyStore for MockKeyStore {
    async fn lookup(&self, secret: &str) -> Result<Option<ApiKeyRecord>, KeyStoreError> {
        self.check_failing()?;
        let records = self.records.lock().unwrap();
        Ok(records.get(secret).filter(|r| r.active).cloned())
    }

    async fn create(
        &self,
        name: &str,
        quota: Quota,
        allowed_ips: Option<Vec<String>>,
    ) -> Result<ApiKeyRecord, KeyStoreError> {
        self.check_failing()?;
        let record = ApiKeyRecord {
            id: Uuid::now_v7(),
            key: generate_secret(),
            name: name.to_string(),
            active: true,
            allowed_ips: allowed_ips.map(Json),
            rate_limit_requests: quota.requests as i32,
            rate_limit_window: quota.window_secs as i32,
            created_at: Utc::now(),
        };
        self.records
            .lock()
            .unwrap()
            .insert(record.key.clone(), record.clone());
        Ok(record)
    }

    async fn revoke(&self, secret: &str) -> Result<(), KeyStoreError> {
        self.check_failing()?;
        if let Some(record) = self.records.lock().unwrap().get_mut(secret) {
            record.active = false;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ApiKeyRecord>, KeyStoreError> {
        self.check_failing()?;
        let mut records: Vec<_> = self.records.lock().unwrap().values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn record_window(
        &self,
        key_id: Uuid,
        window_start: &str,
        count: u64,
    ) -> Result<(), KeyStoreError> {
        if *self.fail_record_window.lock().unwrap() {
            return Err(KeyStoreError::Unavailable(sqlx::Error::PoolTimedOut));
        }
        self.windows
            .lock()
            .unwrap()
            .push((key_id, window_start.to_string(), count));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{generate_secret, KeyStore, MockKeyStore, Quota};

    #[test]
    fn secrets_are_prefixed_and_unique() {
        let first = generate_secret();
        let second = generate_secret();
        assert!(first.starts_with("ak_"));
        // 32 bytes hex-encoded after the prefix.
        assert_eq!(first.len(), 3 + 64);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn revoke_is_idempotent_and_hides_the_key() {
        let store = MockKeyStore::new().with_key("ak_test", Quota::default(), None);
        assert!(store.lookup("ak_test").await.unwrap().is_some());

        store.revoke("ak_test").await.unwrap();
        assert!(store.lookup("ak_test").await.unwrap().is_none());

        // A second revocation is not an error.
        store.revoke("ak_test").await.unwrap();
        // Unknown keys are fine too.
        store.revoke("ak_missing").await.unwrap();
    }
}
