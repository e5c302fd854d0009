//! Replication task records

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::domain::ports::{Change, PeerId, ReplicationMessage};
use crate::error::Error;

/// Task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in the worker pool queue
    Queued,
    /// An attempt is running
    Sending,
    /// Waiting out a retry delay
    Backoff,
    Completed,
    Abandoned,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Abandoned)
    }
}

/// A change to ship to the peers that have not acknowledged it yet.
#[derive(Debug)]
pub struct ReplicationTask {
    pub id: TaskId,
    pub message: Arc<ReplicationMessage>,
    /// Peers still owed this change
    pub pending: Vec<PeerId>,
    pub state: TaskState,
    /// Attempts started so far
    pub attempts: u32,
    /// Local commit time, the origin of lag
    pub committed_at: Instant,
    pub committed_wall: DateTime<Utc>,
    pub finished_at: Option<Instant>,
    pub last_error: Option<String>,
}

impl ReplicationTask {
    pub fn new(message: ReplicationMessage, peers: Vec<PeerId>) -> Self {
        Self {
            id: TaskId::new(),
            message: Arc::new(message),
            pending: peers,
            state: TaskState::Queued,
            attempts: 0,
            committed_at: Instant::now(),
            committed_wall: Utc::now(),
            finished_at: None,
            last_error: None,
        }
    }

    /// Time since local commit, frozen once the task is finished.
    pub fn lag(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(Instant::now);
        end.saturating_duration_since(self.committed_at)
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus {
            id: self.id,
            tenant: self.message.tenant.clone(),
            key: self.message.key.clone(),
            version: self.message.change.version(),
            state: self.state,
            attempts: self.attempts,
            pending_peers: self.pending.iter().map(|p| p.to_string()).collect(),
            committed_at: self.committed_wall,
            lag_millis: self.lag().as_millis() as u64,
            last_error: self.last_error.clone(),
        }
    }

    pub(crate) fn abandoned(&self, reason: String) -> AbandonedTask {
        AbandonedTask {
            id: self.id,
            tenant: self.message.tenant.clone(),
            key: self.message.key.clone(),
            version: self.message.change.version(),
            is_delete: matches!(self.message.change, Change::Delete { .. }),
            attempts: self.attempts,
            peers: self.pending.iter().map(|p| p.to_string()).collect(),
            reason,
            abandoned_at: Utc::now(),
        }
    }
}

/// Serializable view of a task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub id: TaskId,
    pub tenant: String,
    pub key: String,
    pub version: u64,
    pub state: TaskState,
    pub attempts: u32,
    pub pending_peers: Vec<String>,
    pub committed_at: DateTime<Utc>,
    pub lag_millis: u64,
    pub last_error: Option<String>,
}

/// A task that ran out of attempts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbandonedTask {
    pub id: TaskId,
    pub tenant: String,
    pub key: String,
    pub version: u64,
    pub is_delete: bool,
    pub attempts: u32,
    /// Peers that never acknowledged
    pub peers: Vec<String>,
    pub reason: String,
    pub abandoned_at: DateTime<Utc>,
}

impl AbandonedTask {
    pub fn to_error(&self) -> Error {
        Error::ReplicationAbandoned {
            key: format!("{}/{}", self.tenant, self.key),
            attempts: self.attempts,
            reason: self.reason.clone(),
        }
    }
}
