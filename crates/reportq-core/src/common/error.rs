//! Error types for the report pipeline.
//!
//! This module defines the central `Error` enum, which captures every
//! recoverable and reportable failure inside the pipeline. Only connection
//! errors are fatal; everything else is contained to the lifecycle of a single
//! message.
//!
//! ## Error Cases
//! - `Connection`: The broker or status store could not be reached at startup.
//! - `Broker` / `Store`: A command against an established connection failed.
//! - `Decode` / `Encode`: A message body or status snapshot was not valid JSON
//!   for its schema.
//! - `IllegalTransition`: A status write tried to skip or leave a state.
//! - `DuplicateDelivery`: A job id already has a live pending delivery.
//! - `Generation`: The report generation step reported a business failure.
//! - `DeadlineExceeded`: The per-task deadline fired before generation ended.
//! - `Cancelled`: The root shutdown signal fired.
//! - `ChannelError`: An internal channel between pipeline stages closed.
//! - `AlreadySettled`: A delivery was acknowledged twice.

use crate::common::status::Status;
use core::time::Duration;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the report pipeline.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Transport could not be established (fatal at startup).
    #[error("Connection error: {context}")]
    Connection { context: String },

    /// A broker command (publish, ack, nack, read) failed.
    #[error("Broker error: {context}")]
    Broker { context: String },

    /// A status store command failed or timed out.
    #[error("Store error: {context}")]
    Store { context: String },

    /// A payload could not be decoded.
    #[error("Decode error: {reason}")]
    Decode { reason: String },

    /// A payload could not be encoded.
    #[error("Encode error: {reason}")]
    Encode { reason: String },

    /// The requested status transition is not an edge of the state machine.
    #[error("Illegal status transition: {from} -> {to}")]
    IllegalTransition { from: Status, to: Status },

    /// The job id is already tracked by an unsettled delivery.
    #[error("Delivery for job {id} is already pending")]
    DuplicateDelivery { id: String },

    /// Expected business failure reported by the generation step.
    #[error("{reason}")]
    Generation { reason: String },

    /// The per-task deadline expired.
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// The root cancellation signal fired.
    #[error("context canceled")]
    Cancelled,

    /// Internal channel send/receive failure (e.g., closed channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The delivery was already acked or nacked.
    #[error("Delivery {tag} already settled")]
    AlreadySettled { tag: String },
}

impl Error {
    /// Returns `true` for the two interruption variants, deadline expiry and
    /// root cancellation.
    pub const fn is_interruption(&self) -> bool {
        matches!(self, Self::DeadlineExceeded(_) | Self::Cancelled)
    }

    pub(crate) fn decode(err: &serde_json::Error) -> Self {
        Self::Decode {
            reason: err.to_string(),
        }
    }

    pub(crate) fn encode(err: &serde_json::Error) -> Self {
        Self::Encode {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interruption_messages_are_distinguishable() {
        let deadline = Error::DeadlineExceeded(Duration::from_secs(5));
        let cancelled = Error::Cancelled;

        assert!(deadline.is_interruption());
        assert!(cancelled.is_interruption());
        assert_eq!(deadline.to_string(), "deadline exceeded after 5s");
        assert_eq!(cancelled.to_string(), "context canceled");
        assert_ne!(deadline.to_string(), cancelled.to_string());
    }

    #[test]
    fn generation_failure_is_not_an_interruption() {
        let err = Error::Generation {
            reason: "simulated report generation error for ID report-3".to_string(),
        };
        assert!(!err.is_interruption());
        assert_eq!(
            err.to_string(),
            "simulated report generation error for ID report-3"
        );
    }

    #[test]
    fn illegal_transition_names_both_states() {
        let err = Error::IllegalTransition {
            from: Status::Pending,
            to: Status::Completed,
        };
        assert_eq!(
            err.to_string(),
            "Illegal status transition: PENDING -> COMPLETED"
        );
    }
}
