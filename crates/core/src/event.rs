//! Append-only audit events.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{Address, TaskIdCommitment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    TaskCreated,
    TaskStarted,
    TaskScoreReady,
    TaskErrorReported,
    TaskValidated,
    TaskGroupValidated,
    TaskEndInvalidated,
    TaskEndGroupRefund,
    TaskEndSuccess,
    TaskEndGroupSuccess,
    TaskEndAborted,
    TaskPayment,
    TaskRefund,
    WorkerJoined,
    WorkerPaused,
    WorkerResumed,
    WorkerQuit,
    WorkerKickedOut,
    WorkerSlashed,
    WorkerVersionChanged,
    WorkerModelAdded,
    DownloadModel,
    Deposit,
}

impl EventKind {
    pub const ALL: [EventKind; 23] = [
        EventKind::TaskCreated,
        EventKind::TaskStarted,
        EventKind::TaskScoreReady,
        EventKind::TaskErrorReported,
        EventKind::TaskValidated,
        EventKind::TaskGroupValidated,
        EventKind::TaskEndInvalidated,
        EventKind::TaskEndGroupRefund,
        EventKind::TaskEndSuccess,
        EventKind::TaskEndGroupSuccess,
        EventKind::TaskEndAborted,
        EventKind::TaskPayment,
        EventKind::TaskRefund,
        EventKind::WorkerJoined,
        EventKind::WorkerPaused,
        EventKind::WorkerResumed,
        EventKind::WorkerQuit,
        EventKind::WorkerKickedOut,
        EventKind::WorkerSlashed,
        EventKind::WorkerVersionChanged,
        EventKind::WorkerModelAdded,
        EventKind::DownloadModel,
        EventKind::Deposit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskCreated => "TaskCreated",
            EventKind::TaskStarted => "TaskStarted",
            EventKind::TaskScoreReady => "TaskScoreReady",
            EventKind::TaskErrorReported => "TaskErrorReported",
            EventKind::TaskValidated => "TaskValidated",
            EventKind::TaskGroupValidated => "TaskGroupValidated",
            EventKind::TaskEndInvalidated => "TaskEndInvalidated",
            EventKind::TaskEndGroupRefund => "TaskEndGroupRefund",
            EventKind::TaskEndSuccess => "TaskEndSuccess",
            EventKind::TaskEndGroupSuccess => "TaskEndGroupSuccess",
            EventKind::TaskEndAborted => "TaskEndAborted",
            EventKind::TaskPayment => "TaskPayment",
            EventKind::TaskRefund => "TaskRefund",
            EventKind::WorkerJoined => "WorkerJoined",
            EventKind::WorkerPaused => "WorkerPaused",
            EventKind::WorkerResumed => "WorkerResumed",
            EventKind::WorkerQuit => "WorkerQuit",
            EventKind::WorkerKickedOut => "WorkerKickedOut",
            EventKind::WorkerSlashed => "WorkerSlashed",
            EventKind::WorkerVersionChanged => "WorkerVersionChanged",
            EventKind::WorkerModelAdded => "WorkerModelAdded",
            EventKind::DownloadModel => "DownloadModel",
            EventKind::Deposit => "Deposit",
        }
    }

    /// Events that close a job for good; settlement anchoring tails these.
    pub fn is_task_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::TaskEndInvalidated
                | EventKind::TaskEndGroupRefund
                | EventKind::TaskEndSuccess
                | EventKind::TaskEndGroupSuccess
                | EventKind::TaskEndAborted
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::unknown("event kind", s))
    }
}

/// Event as handed to the store; the log assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub kind: EventKind,
    pub worker: Option<Address>,
    pub commitment: Option<TaskIdCommitment>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Insertion sequence of the log.
    pub id: i64,
    pub kind: EventKind,
    pub worker: Option<Address>,
    pub commitment: Option<TaskIdCommitment>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
