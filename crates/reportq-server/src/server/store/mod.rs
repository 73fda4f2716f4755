//! Key/value status store.
//!
//! [`StatusStore`] is the raw boundary (string keys, string values, expiry).
//! [`ReportStatusStore`] layers the report key scheme on top of it:
//!
//! - every snapshot is written to `report:status:<id>`
//! - terminal snapshots are also written to `report:data:<id>`
//!
//! Each call is bounded by a store timeout, so a hung backend can never stall
//! a worker indefinitely.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use core::time::Duration;
use reportq_core::types::{data_key, status_key};
use reportq_core::{Error, JobResult, Result};
use std::sync::Arc;

/// Key/value store with per-key expiry.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;
}

/// Writes and reads [`JobResult`] snapshots under the report key scheme.
#[derive(Clone)]
pub struct ReportStatusStore {
    store: Arc<dyn StatusStore>,
    ttl: Duration,
    timeout: Duration,
}

impl ReportStatusStore {
    pub fn new(store: Arc<dyn StatusStore>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            store,
            ttl,
            timeout,
        }
    }

    /// Persists a snapshot. Terminal snapshots are written to the status key
    /// first and then to the data key.
    pub async fn record(&self, result: &JobResult) -> Result<()> {
        let value = result.encode()?;
        self.set(&status_key(&result.request_id), &value).await?;
        if result.is_terminal() {
            self.set(&data_key(&result.request_id), &value).await?;
        }
        tracing::debug!(id = %result.request_id, status = %result.status, "recorded status");
        Ok(())
    }

    /// Latest snapshot for `id`, if any.
    pub async fn status(&self, id: &str) -> Result<Option<JobResult>> {
        self.read(&status_key(id)).await
    }

    /// Terminal snapshot for `id`, if the job has finished.
    pub async fn report(&self, id: &str) -> Result<Option<JobResult>> {
        self.read(&data_key(id)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        tokio::time::timeout(
            self.timeout,
            self.store.set_with_expiry(key, value, self.ttl),
        )
        .await
        .map_err(|_| Error::Store {
            context: format!("SET {key} timed out after {:?}", self.timeout),
        })?
    }

    async fn read(&self, key: &str) -> Result<Option<JobResult>> {
        let raw = tokio::time::timeout(self.timeout, self.store.get(key))
            .await
            .map_err(|_| Error::Store {
                context: format!("GET {key} timed out after {:?}", self.timeout),
            })??;
        raw.as_deref().map(JobResult::decode).transpose()
    }
}
