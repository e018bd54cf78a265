//! The `extraction_status` state machine.
//!
//! Chunks and transcript indexing jobs share the same four states and the
//! same edge set:
//!
//! ```text
//!   pending ──claim──▶ processing ──complete──▶ completed
//!      ▲                  │  │
//!      │                  │  └──fail──▶ failed
//!      └────reclaim───────┘               │
//!      └────────────requeue───────────────┘
//! ```
//!
//! `reclaim` is only issued by the watchdog and `requeue` only by an
//! operator. Every store update is a compare-and-set on the prior status,
//! so two writers can never both win the same edge.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TransitionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A named edge of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A worker takes exclusive ownership.
    Claim,
    /// Every derived signal was persisted.
    Complete,
    /// Permanent error or exhausted retry budget.
    Fail,
    /// Operator retry of a failed unit.
    Requeue,
    /// Watchdog release of a stale claim.
    Reclaim,
}

impl Transition {
    pub fn from_status(self) -> ExtractionStatus {
        match self {
            Transition::Claim => ExtractionStatus::Pending,
            Transition::Complete | Transition::Fail | Transition::Reclaim => {
                ExtractionStatus::Processing
            }
            Transition::Requeue => ExtractionStatus::Failed,
        }
    }

    pub fn to_status(self) -> ExtractionStatus {
        match self {
            Transition::Claim => ExtractionStatus::Processing,
            Transition::Complete => ExtractionStatus::Completed,
            Transition::Fail => ExtractionStatus::Failed,
            Transition::Requeue | Transition::Reclaim => ExtractionStatus::Pending,
        }
    }
}

impl ExtractionStatus {
    pub const ALL: [ExtractionStatus; 4] = [
        ExtractionStatus::Pending,
        ExtractionStatus::Processing,
        ExtractionStatus::Completed,
        ExtractionStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionStatus::Pending => "pending",
            ExtractionStatus::Processing => "processing",
            ExtractionStatus::Completed => "completed",
            ExtractionStatus::Failed => "failed",
        }
    }

    /// Resolve the edge `self -> to`, rejecting anything outside the table.
    pub fn transition_to(self, to: ExtractionStatus) -> Result<Transition, TransitionError> {
        use ExtractionStatus::*;
        match (self, to) {
            (Pending, Processing) => Ok(Transition::Claim),
            (Processing, Completed) => Ok(Transition::Complete),
            (Processing, Failed) => Ok(Transition::Fail),
            (Failed, Pending) => Ok(Transition::Requeue),
            (Processing, Pending) => Ok(Transition::Reclaim),
            _ => Err(TransitionError { from: self, to }),
        }
    }

    /// Only completed units carry every derived signal.
    pub fn is_retrievable(self) -> bool {
        self == ExtractionStatus::Completed
    }
}

impl fmt::Display for ExtractionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtractionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExtractionStatus::Pending),
            "processing" => Ok(ExtractionStatus::Processing),
            "completed" => Ok(ExtractionStatus::Completed),
            "failed" => Ok(ExtractionStatus::Failed),
            other => anyhow::bail!("unknown extraction_status: {}", other),
        }
    }
}
