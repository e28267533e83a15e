use std::collections::BTreeMap;
use std::time::Duration;

use jobgrid_transport::{JobHeader, JobSubmission, TaskSpec, TimeoutSchedule};
use uuid::Uuid;

/// A job under construction.
#[derive(Debug, Clone)]
pub struct Job {
    header: JobHeader,
    tasks: Vec<TaskSpec>,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            header: JobHeader {
                job_id: Uuid::new_v4(),
                name: name.into(),
                priority: 0,
                metadata: BTreeMap::new(),
                uuid_path: Vec::new(),
            },
            tasks: Vec::new(),
        }
    }

    /// Higher priorities are dispatched first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.header.priority = priority;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.metadata.insert(key.into(), value.into());
        self
    }

    /// Records that the job already passed through `uuid`. A driver never dispatches
    /// a job to a peer on its path.
    pub fn visited(mut self, uuid: Uuid) -> Self {
        self.header.uuid_path.push(uuid);
        self
    }

    pub fn task(self, kind: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        self.push(kind.into(), payload.into(), None)
    }

    /// Adds a task that is abandoned `timeout` after it starts executing.
    pub fn task_with_timeout(
        self,
        kind: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        timeout: Duration,
    ) -> Self {
        self.push(kind.into(), payload.into(), Some(TimeoutSchedule::after(timeout)))
    }

    /// Adds a task with an explicit timeout schedule, such as an absolute expiry.
    pub fn task_with_schedule(
        self,
        kind: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        schedule: TimeoutSchedule,
    ) -> Self {
        self.push(kind.into(), payload.into(), Some(schedule))
    }

    fn push(mut self, kind: String, payload: Vec<u8>, timeout: Option<TimeoutSchedule>) -> Self {
        let position = self.tasks.len() as u32;
        self.tasks.push(TaskSpec {
            position,
            kind,
            payload,
            timeout,
        });
        self
    }

    pub fn id(&self) -> Uuid {
        self.header.job_id
    }

    pub fn name(&self) -> &str {
        &self.header.name
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn into_submission(self) -> JobSubmission {
        JobSubmission {
            header: self.header,
            tasks: self.tasks,
        }
    }
}
