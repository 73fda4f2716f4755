//! # Report Job Types and Constants
//!
//! This module defines the wire and storage contract shared by every stage of
//! the pipeline. Message bodies on the queue are UTF-8 JSON [`JobRequest`]s;
//! status store values are UTF-8 JSON [`JobResult`] snapshots.
//!
//! ## Storage keys
//!
//! - [`status_key`] - `report:status:<id>`, rewritten on every transition.
//! - [`data_key`] - `report:data:<id>`, written only for terminal snapshots so
//!   final results stay queryable after the transient status is overwritten.
//!
//! Both keys expire after [`DEFAULT_STATUS_TTL`] unless configured otherwise.

use crate::common::{
    error::{Error, Result},
    status::Status,
};
use chrono::{DateTime, Utc};
use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Prefix of the key holding the latest status snapshot of a job.
pub const STATUS_KEY_PREFIX: &str = "report:status:";

/// Prefix of the key holding the terminal snapshot of a job.
pub const DATA_KEY_PREFIX: &str = "report:data:";

/// Expiry applied to both key families.
pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Report types the producer cycles through.
pub const REPORT_TYPES: [&str; 4] = ["sales", "inventory", "financial", "user_activity"];

/// Builds `report:status:<id>`.
pub fn status_key(id: &str) -> String {
    format!("{STATUS_KEY_PREFIX}{id}")
}

/// Builds `report:data:<id>`.
pub fn data_key(id: &str) -> String {
    format!("{DATA_KEY_PREFIX}{id}")
}

/// A request to generate a report. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: String,
    pub report_type: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl JobRequest {
    pub fn new(
        id: impl Into<String>,
        report_type: impl Into<String>,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            report_type: report_type.into(),
            parameters,
            created_at: Utc::now(),
        }
    }

    /// Decodes a queue message body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the body is not a JSON `JobRequest` or the
    /// id is empty.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let request: Self = serde_json::from_slice(body).map_err(|e| Error::decode(&e))?;
        if request.id.is_empty() {
            return Err(Error::Decode {
                reason: "job id must not be empty".to_string(),
            });
        }
        Ok(request)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::encode(&e))
    }
}

/// Snapshot of a job's processing state, as written to the status store.
///
/// Each write replaces the previous snapshot (last-write-wins). The state
/// only moves forward through [`JobResult::advance`], which enforces the
/// [`Status`] transition rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub request_id: String,
    pub status: Status,
    pub generated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResult {
    /// The initial snapshot written when a job is pulled off the queue.
    pub fn pending(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: Status::Pending,
            generated_at: Utc::now(),
            report_data: None,
            error: None,
        }
    }

    /// Moves the snapshot to `next`, refreshing `generated_at`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalTransition`] if `next` is not a legal successor
    /// of the current status. The snapshot is left untouched in that case.
    pub fn advance(&mut self, next: Status) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.generated_at = Utc::now();
        Ok(())
    }

    /// `InProgress -> Completed` carrying the generated payload.
    pub fn complete(&mut self, report_data: String) -> Result<()> {
        self.advance(Status::Completed)?;
        self.report_data = Some(report_data);
        self.error = None;
        Ok(())
    }

    /// `InProgress -> Failed` carrying the error text.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.advance(Status::Failed)?;
        self.report_data = None;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::encode(&e))
    }

    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::decode(&e))
    }
}
