//! Jobs accepted by the driver and the route of their results back to clients.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use dashmap::DashMap;
use jobgrid_transport::{
    ChannelId, JobHeader, JobResults, JobSubmission, MultiplexerHandle, Readiness, TaskResult,
    WireMessage,
};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bundle::TaskBundle;
use crate::error::{DriverError, Result};
use crate::queue::JobQueue;

/// Messages waiting to be written to one client channel.
#[derive(Default)]
pub struct ClientOutbox {
    messages: Mutex<VecDeque<WireMessage>>,
}

impl ClientOutbox {
    pub fn push(&self, message: WireMessage) {
        self.messages.lock().unwrap().push_back(message);
    }

    pub fn pop(&self) -> Option<WireMessage> {
        self.messages.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Notified when a job is cancelled, so work already on nodes can be stopped.
pub trait CancelHook: Send + Sync {
    fn job_cancelled(&self, job_id: Uuid);
}

struct JobState {
    header: Arc<JobHeader>,
    client: Option<ChannelId>,
    total: usize,
    remaining: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub job_id: Uuid,
    pub name: String,
    pub priority: i32,
    pub total: usize,
    pub remaining: usize,
}

pub struct JobRegistry {
    queue: Arc<JobQueue>,
    jobs: DashMap<Uuid, JobState>,
    outboxes: DashMap<ChannelId, Arc<ClientOutbox>>,
    clients: OnceLock<MultiplexerHandle>,
    hooks: RwLock<Vec<Arc<dyn CancelHook>>>,
}

impl JobRegistry {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self {
            queue,
            jobs: DashMap::new(),
            outboxes: DashMap::new(),
            clients: OnceLock::new(),
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Handle used to wake client channels when results are ready.
    pub fn set_client_handle(&self, handle: MultiplexerHandle) {
        let _ = self.clients.set(handle);
    }

    pub fn add_cancel_hook(&self, hook: Arc<dyn CancelHook>) {
        self.hooks.write().unwrap().push(hook);
    }

    pub fn attach_client(&self, client: ChannelId) -> Arc<ClientOutbox> {
        self.outboxes.entry(client).or_default().clone()
    }

    /// Accepts a job and queues all of its tasks as one bundle.
    pub fn submit(&self, client: Option<ChannelId>, submission: JobSubmission) -> Result<()> {
        let JobSubmission { header, tasks } = submission;
        let job_id = header.job_id;
        if self.jobs.contains_key(&job_id) {
            return Err(DriverError::DuplicateJob(job_id));
        }
        if tasks.is_empty() {
            self.send_to(
                client,
                WireMessage::JobResults(JobResults {
                    job_id,
                    results: Vec::new(),
                    pending: 0,
                }),
            );
            return Ok(());
        }

        let header = Arc::new(header);
        info!(
            %job_id,
            name = %header.name,
            priority = header.priority,
            tasks = tasks.len(),
            "job submitted"
        );
        self.jobs.insert(
            job_id,
            JobState {
                header: header.clone(),
                client,
                total: tasks.len(),
                remaining: tasks.len(),
            },
        );
        self.queue.enqueue(TaskBundle::new(header, tasks));
        Ok(())
    }

    pub fn is_active(&self, job_id: Uuid) -> bool {
        self.jobs.contains_key(&job_id)
    }

    pub fn header(&self, job_id: Uuid) -> Option<Arc<JobHeader>> {
        self.jobs.get(&job_id).map(|job| job.header.clone())
    }

    /// Forwards a batch of results to the job's client. Results of unknown or
    /// cancelled jobs are dropped.
    pub fn deliver(&self, job_id: Uuid, results: Vec<TaskResult>) {
        if results.is_empty() {
            return;
        }
        let (client, pending) = {
            let Some(mut job) = self.jobs.get_mut(&job_id) else {
                debug!(%job_id, count = results.len(), "dropping results of inactive job");
                return;
            };
            job.remaining = job.remaining.saturating_sub(results.len());
            (job.client, job.remaining)
        };
        if pending == 0 {
            self.jobs.remove(&job_id);
            info!(%job_id, "job complete");
        }
        self.send_to(
            client,
            WireMessage::JobResults(JobResults {
                job_id,
                results,
                pending,
            }),
        );
    }

    /// Removes the job, drops its queued tasks and tells its client.
    /// Returns the number of queued tasks removed.
    pub fn cancel_job(&self, job_id: Uuid) -> Result<usize> {
        let (_, job) = self
            .jobs
            .remove(&job_id)
            .ok_or(DriverError::JobNotFound(job_id))?;
        let removed = self.queue.remove_job(job_id);
        info!(%job_id, removed, "job cancelled");
        self.notify_hooks(job_id);
        self.send_to(job.client, WireMessage::JobCancelled { job_id });
        Ok(removed)
    }

    /// Cancels every job the client submitted and forgets its outbox.
    pub fn client_disconnected(&self, client: ChannelId) -> Vec<Uuid> {
        self.outboxes.remove(&client);
        let orphaned: Vec<Uuid> = self
            .jobs
            .iter()
            .filter(|job| job.client == Some(client))
            .map(|job| *job.key())
            .collect();
        for job_id in &orphaned {
            if self.jobs.remove(job_id).is_some() {
                let removed = self.queue.remove_job(*job_id);
                info!(%job_id, removed, client, "client gone, job cancelled");
                self.notify_hooks(*job_id);
            }
        }
        orphaned
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        self.jobs
            .iter()
            .map(|job| JobInfo {
                job_id: *job.key(),
                name: job.header.name.clone(),
                priority: job.header.priority,
                total: job.total,
                remaining: job.remaining,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn notify_hooks(&self, job_id: Uuid) {
        let hooks: Vec<Arc<dyn CancelHook>> = self.hooks.read().unwrap().clone();
        for hook in hooks {
            hook.job_cancelled(job_id);
        }
    }

    fn send_to(&self, client: Option<ChannelId>, message: WireMessage) {
        let Some(client) = client else {
            return;
        };
        let Some(outbox) = self.outboxes.get(&client).map(|o| o.clone()) else {
            debug!(client, kind = message.kind(), "client gone, message dropped");
            return;
        };
        outbox.push(message);
        if let Some(handle) = self.clients.get() {
            handle.wake(client, Readiness::WRITABLE);
        }
    }
}
