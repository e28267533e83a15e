//! Messages exchanged between clients, the driver and nodes.
//!
//! Every frame payload is one bincode-encoded [`WireMessage`]. The first message on a
//! connection is always a [`Handshake`]; the data phase that follows depends on the role.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TransportError};

/// Serialize any serde-compatible message to bytes using bincode.
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| TransportError::SerializationError(e.to_string()))
}

/// Deserialize bytes to a message using bincode.
pub fn deserialize_message<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| TransportError::SerializationError(e.to_string()))
}

/// Role announced by the connecting peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    /// Submits jobs and collects results.
    Client,
    /// Executes task bundles.
    Node,
    /// Another driver forwarding work, served like a node.
    PeerDriver,
}

/// First message on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub role: PeerRole,
    pub protocol_version: u16,
    /// Identity of the connecting process.
    pub uuid: Uuid,
    /// Worker threads available on a node; `None` for clients.
    pub processing_threads: Option<u32>,
}

/// When a task must be abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutSchedule {
    /// Relative to the moment the task is submitted for execution.
    Duration { millis: u64 },
    /// Absolute wall-clock expiry, in milliseconds since the Unix epoch.
    Expiry { epoch_ms: u64 },
}

impl TimeoutSchedule {
    pub fn after(duration: Duration) -> Self {
        TimeoutSchedule::Duration {
            millis: duration.as_millis() as u64,
        }
    }

    pub fn at(time: SystemTime) -> Self {
        let epoch_ms = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        TimeoutSchedule::Expiry { epoch_ms }
    }

    /// Delay from `now` until the schedule fires. Expiries in the past yield zero.
    pub fn delay_from(&self, now: SystemTime) -> Duration {
        match *self {
            TimeoutSchedule::Duration { millis } => Duration::from_millis(millis),
            TimeoutSchedule::Expiry { epoch_ms } => {
                let now_ms = now
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                Duration::from_millis(epoch_ms.saturating_sub(now_ms))
            }
        }
    }
}

/// One schedulable unit of work as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Position of the task inside its job.
    pub position: u32,
    /// Name the node resolves to an executable task.
    pub kind: String,
    pub payload: Vec<u8>,
    pub timeout: Option<TimeoutSchedule>,
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Completed(Vec<u8>),
    Failed(String),
    Cancelled,
    TimedOut,
}

impl TaskOutcome {
    pub fn is_error(&self) -> bool {
        !matches!(self, TaskOutcome::Completed(_))
    }
}

/// Result of one task, reported by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub position: u32,
    pub outcome: TaskOutcome,
    pub elapsed_nanos: u64,
    pub cpu_nanos: u64,
}

/// Job-level attributes shared by every bundle cut from the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHeader {
    pub job_id: Uuid,
    pub name: String,
    /// Higher values are dispatched first.
    pub priority: i32,
    pub metadata: BTreeMap<String, String>,
    /// Drivers the job has already traversed.
    pub uuid_path: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSubmission {
    pub header: JobHeader,
    pub tasks: Vec<TaskSpec>,
}

/// A slice of a job sent from the driver to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleDispatch {
    pub bundle_id: u64,
    pub job_id: Uuid,
    pub uuid_path: Vec<Uuid>,
    pub tasks: Vec<TaskSpec>,
}

/// Results of one round, sent from a node back to the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleResults {
    pub bundle_id: u64,
    pub job_id: Uuid,
    pub results: Vec<TaskResult>,
    /// Cancelled tasks must be put back on the driver's queue.
    pub requeue: bool,
    /// Set when the node's thread pool changed since its last advert.
    pub processing_threads: Option<u32>,
}

/// A batch of results forwarded from the driver to the submitting client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResults {
    pub job_id: Uuid,
    pub results: Vec<TaskResult>,
    /// Tasks of the job still outstanding after this batch.
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    Handshake(Handshake),
    JobSubmission(JobSubmission),
    CancelJob { job_id: Uuid },
    Bundle(BundleDispatch),
    BundleResults(BundleResults),
    JobResults(JobResults),
    JobCancelled { job_id: Uuid },
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Handshake(_) => "handshake",
            WireMessage::JobSubmission(_) => "job-submission",
            WireMessage::CancelJob { .. } => "cancel-job",
            WireMessage::Bundle(_) => "bundle",
            WireMessage::BundleResults(_) => "bundle-results",
            WireMessage::JobResults(_) => "job-results",
            WireMessage::JobCancelled { .. } => "job-cancelled",
        }
    }
}
