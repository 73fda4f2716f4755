//! Job status state machine.
//!
//! ```text
//! Pending ──► InProgress ──┬──► Completed
//!                          └──► Failed
//! ```
//!
//! `Completed` and `Failed` are terminal. Every transition site goes through
//! [`Status::can_transition_to`], so an illegal edge is rejected instead of
//! silently overwriting the stored snapshot.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Processing status of a report job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Pulled off the queue, waiting for a worker.
    Pending,
    /// A worker is running the generation step.
    InProgress,
    /// Generation produced a report.
    Completed,
    /// Generation failed, timed out or was cancelled.
    Failed,
}

impl Status {
    pub const ALL: [Self; 4] = [
        Self::Pending,
        Self::InProgress,
        Self::Completed,
        Self::Failed,
    ];

    /// No transition leaves a terminal state.
    pub const fn is_terminal(self) -> bool {
        match self {
            Self::Completed | Self::Failed => true,
            Self::Pending | Self::InProgress => false,
        }
    }

    /// Returns `true` if `next` is a legal successor of `self`.
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::InProgress) => true,
            (Self::InProgress, Self::Completed | Self::Failed) => true,
            (Self::Pending, Self::Pending | Self::Completed | Self::Failed)
            | (Self::InProgress, Self::Pending | Self::InProgress)
            | (Self::Completed | Self::Failed, _) => false,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_four_edges_are_legal() {
        let legal = [
            (Status::Pending, Status::InProgress),
            (Status::InProgress, Status::Completed),
            (Status::InProgress, Status::Failed),
        ];

        for from in Status::ALL {
            for to in Status::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_successor() {
        for from in Status::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(Status::ALL.iter().all(|to| !from.can_transition_to(*to)));
        }
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::InProgress.is_terminal());
    }

    #[test]
    fn serializes_as_screaming_snake_case() {
        for status in Status::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }
}
