//! Executes the bundles a node receives from its driver.
//!
//! One round at a time: [`NodeExecutionManager::execute`] registers every task of the
//! bundle, hands it to the thread manager and blocks until each task has ended or a
//! reconnection is requested. A task ends exactly once, whichever comes first of its
//! own completion, its timeout or a cancel request; later signals for the same task
//! are ignored.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::{Duration, Instant, SystemTime};

use jobgrid_transport::{BundleDispatch, BundleResults, TaskOutcome, TaskResult, TaskSpec};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::{new_cancel_pair, CancelHandle, CancelReason};
use crate::error::{ExecutionError, Result};
use crate::resource::ResourceProvider;
use crate::schedule::{TimeoutRegistration, TimeoutScheduler};
use crate::task::{Task, TaskContext, TaskRegistry};
use crate::thread_manager::{thread_cpu_time, ThreadManager};

/// Emitted once per task of a round.
#[derive(Debug, Clone)]
pub struct TaskEndedEvent {
    pub bundle_id: u64,
    pub job_id: Uuid,
    pub position: u32,
    /// Per-round sequence number, starting at zero.
    pub number: u64,
    pub outcome: TaskOutcome,
    pub elapsed: Duration,
    pub cpu: Option<Duration>,
}

pub trait ExecutionListener: Send + Sync {
    fn task_ended(&self, event: &TaskEndedEvent);
}

/// Results of one completed round.
#[derive(Debug, Clone)]
pub struct RoundReport {
    pub bundle_id: u64,
    pub job_id: Uuid,
    pub results: Vec<TaskResult>,
    /// Set when the round was cancelled with requeue; cancelled tasks go back to the queue.
    pub requeue: bool,
}

struct TaskFuture {
    position: u32,
    cancel: CancelHandle,
    timeout: Option<TimeoutRegistration>,
    task: Arc<dyn Task>,
    submitted_at: Instant,
}

struct Round {
    /// Local sequence number; stale signals from an earlier round never match.
    seq: u64,
    bundle_id: u64,
    job_id: Uuid,
    uuid_path: Vec<Uuid>,
    next_number: u64,
    futures: HashMap<u64, TaskFuture>,
    /// Claimed futures whose result is not recorded yet.
    outstanding: usize,
    results: Vec<TaskResult>,
    requeue: bool,
}

#[derive(Default)]
struct Inner {
    round: Option<Round>,
    next_seq: u64,
    reconnection: Option<String>,
}

struct Shared {
    inner: Mutex<Inner>,
    changed: Condvar,
    listeners: RwLock<Vec<Arc<dyn ExecutionListener>>>,
}

impl Shared {
    /// Removes a task's future so that nothing else can end it.
    fn claim(&self, seq: u64, number: u64) -> Option<TaskFuture> {
        let mut inner = self.inner.lock().unwrap();
        let round = inner.round.as_mut().filter(|r| r.seq == seq)?;
        round.futures.remove(&number)
    }

    /// Records the outcome of a claimed task and notifies listeners.
    fn task_ended(
        &self,
        seq: u64,
        number: u64,
        future: TaskFuture,
        outcome: TaskOutcome,
        elapsed: Duration,
        cpu: Option<Duration>,
    ) {
        if let Some(timeout) = &future.timeout {
            timeout.cancel();
        }
        let event = {
            let mut inner = self.inner.lock().unwrap();
            let Some(round) = inner.round.as_mut().filter(|r| r.seq == seq) else {
                return;
            };
            round.results.push(TaskResult {
                position: future.position,
                outcome: outcome.clone(),
                elapsed_nanos: elapsed.as_nanos().min(u64::MAX as u128) as u64,
                cpu_nanos: cpu.map_or(0, |c| c.as_nanos().min(u64::MAX as u128) as u64),
            });
            round.outstanding -= 1;
            if round.outstanding == 0 {
                self.changed.notify_all();
            }
            TaskEndedEvent {
                bundle_id: round.bundle_id,
                job_id: round.job_id,
                position: future.position,
                number,
                outcome,
                elapsed,
                cpu,
            }
        };
        for listener in self.listeners.read().unwrap().iter() {
            listener.task_ended(&event);
        }
    }

    /// Runs on the timer thread. The task's own hook goes to the pool so that a slow
    /// hook cannot hold back the timeouts of other tasks.
    fn fire_timeout(&self, seq: u64, number: u64, threads: &dyn ThreadManager) {
        let Some(future) = self.claim(seq, number) else {
            return;
        };
        debug!(position = future.position, "task timed out");
        future.cancel.cancel(CancelReason::TimedOut);
        let task = future.task.clone();
        let elapsed = future.submitted_at.elapsed();
        self.task_ended(seq, number, future, TaskOutcome::TimedOut, elapsed, None);

        let hook = task.clone();
        let job = Box::new(move || {
            if catch_unwind(AssertUnwindSafe(|| hook.on_timeout())).is_err() {
                warn!("timeout hook panicked");
            }
        });
        if let Err(e) = threads.submit(job) {
            warn!(error = %e, "pool refused timeout hook, running it inline");
            task.on_timeout();
        }
    }
}

/// A task that could not be built; running it reports why.
struct Rejected(String);

impl Task for Rejected {
    fn run(&self, _ctx: &TaskContext) -> std::result::Result<Vec<u8>, String> {
        Err(self.0.clone())
    }
}

pub struct NodeExecutionManager {
    shared: Arc<Shared>,
    tasks: TaskRegistry,
    resources: Arc<dyn ResourceProvider>,
    threads: Arc<dyn ThreadManager>,
    config_changed: AtomicBool,
    scheduler: TimeoutScheduler,
}

impl NodeExecutionManager {
    pub fn new(
        threads: Arc<dyn ThreadManager>,
        tasks: TaskRegistry,
        resources: Arc<dyn ResourceProvider>,
    ) -> Result<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                changed: Condvar::new(),
                listeners: RwLock::new(Vec::new()),
            }),
            tasks,
            resources,
            threads,
            config_changed: AtomicBool::new(false),
            scheduler: TimeoutScheduler::new("task-timeout-timer")?,
        })
    }

    /// Prepares per-round state for `bundle`. Calling it again for the same bundle
    /// is a no-op; a different bundle is refused until [`cleanup`](Self::cleanup).
    pub fn setup(&self, bundle: &BundleDispatch) -> std::result::Result<(), ExecutionError> {
        let mut inner = self.shared.inner.lock().unwrap();
        if let Some(round) = &inner.round {
            if round.bundle_id == bundle.bundle_id {
                return Ok(());
            }
            return Err(ExecutionError::AlreadyExecuting {
                current: round.bundle_id,
                requested: bundle.bundle_id,
            });
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.round = Some(Round {
            seq,
            bundle_id: bundle.bundle_id,
            job_id: bundle.job_id,
            uuid_path: bundle.uuid_path.clone(),
            next_number: 0,
            futures: HashMap::new(),
            outstanding: 0,
            results: Vec::new(),
            requeue: false,
        });
        Ok(())
    }

    /// Runs every task of `bundle` and blocks until all of them have ended.
    ///
    /// Returns [`ExecutionError::Reconnection`] as soon as a reconnection is requested;
    /// the caller is expected to cancel the remaining tasks and clean up.
    pub fn execute(
        &self,
        bundle: &BundleDispatch,
    ) -> std::result::Result<RoundReport, ExecutionError> {
        self.setup(bundle)?;
        let started = Instant::now();
        let seq = self.submit_all(&bundle.tasks);

        let mut inner = self.shared.inner.lock().unwrap();
        loop {
            if let Some(reason) = inner.reconnection.take() {
                info!(bundle_id = bundle.bundle_id, %reason, "round interrupted by reconnection");
                return Err(ExecutionError::Reconnection(reason));
            }
            match inner.round.as_ref() {
                Some(round) if round.seq == seq && round.outstanding > 0 => {}
                _ => break,
            }
            inner = self.shared.changed.wait(inner).unwrap();
        }

        let Some(round) = inner.round.as_mut().filter(|r| r.seq == seq) else {
            // cleaned up under our feet; every task was cancelled
            return Ok(RoundReport {
                bundle_id: bundle.bundle_id,
                job_id: bundle.job_id,
                results: Vec::new(),
                requeue: false,
            });
        };
        debug!(
            bundle_id = round.bundle_id,
            job_id = %round.job_id,
            tasks = round.results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "round complete"
        );
        Ok(RoundReport {
            bundle_id: round.bundle_id,
            job_id: round.job_id,
            results: std::mem::take(&mut round.results),
            requeue: round.requeue,
        })
    }

    fn submit_all(&self, specs: &[TaskSpec]) -> u64 {
        let now = SystemTime::now();
        let mut pending = Vec::with_capacity(specs.len());
        let seq = {
            let mut inner = self.shared.inner.lock().unwrap();
            let Some(round) = inner.round.as_mut() else {
                return u64::MAX;
            };
            for spec in specs {
                let task: Arc<dyn Task> = match self.tasks.build(&spec.kind, &spec.payload) {
                    Ok(task) => Arc::from(task),
                    Err(reason) => Arc::new(Rejected(reason)),
                };
                let (token, cancel) = new_cancel_pair();
                let number = round.next_number;
                round.next_number += 1;
                round.outstanding += 1;
                round.futures.insert(
                    number,
                    TaskFuture {
                        position: spec.position,
                        cancel,
                        timeout: None,
                        task: task.clone(),
                        submitted_at: Instant::now(),
                    },
                );
                let delay = spec.timeout.map(|t| t.delay_from(now));
                pending.push((number, spec.position, task, token, delay));
            }
            round.seq
        };

        for (number, position, task, token, delay) in pending {
            if let Some(delay) = delay {
                let weak: Weak<Shared> = Arc::downgrade(&self.shared);
                let threads = self.threads.clone();
                let registration = self.scheduler.schedule(delay, move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.fire_timeout(seq, number, threads.as_ref());
                    }
                });
                let mut inner = self.shared.inner.lock().unwrap();
                match inner
                    .round
                    .as_mut()
                    .filter(|r| r.seq == seq)
                    .and_then(|r| r.futures.get_mut(&number))
                {
                    Some(future) => future.timeout = Some(registration),
                    None => registration.cancel(),
                }
            }

            let shared = self.shared.clone();
            let ctx = TaskContext::new(position, token, self.resources.clone());
            let job = Box::new(move || run_task(&shared, seq, number, task, ctx));
            if let Err(e) = self.threads.submit(job) {
                if let Some(future) = self.shared.claim(seq, number) {
                    self.shared.task_ended(
                        seq,
                        number,
                        future,
                        TaskOutcome::Failed(e.to_string()),
                        Duration::ZERO,
                        None,
                    );
                }
            }
        }
        seq
    }

    /// Cancels every outstanding task of the current round. Returns how many were cancelled.
    ///
    /// With `call_on_cancel` each task's cancel hook runs before its token is triggered.
    /// With `requeue` the round is reported back flagged for requeueing.
    pub fn cancel_all_tasks(&self, call_on_cancel: bool, requeue: bool) -> usize {
        let (seq, futures) = {
            let mut inner = self.shared.inner.lock().unwrap();
            let Some(round) = inner.round.as_mut() else {
                return 0;
            };
            round.requeue |= requeue;
            let futures: Vec<(u64, TaskFuture)> = round.futures.drain().collect();
            (round.seq, futures)
        };
        let count = futures.len();
        if count > 0 {
            info!(tasks = count, requeue, "cancelling outstanding tasks");
        }
        for (number, future) in futures {
            if call_on_cancel {
                future.task.on_cancel();
            }
            future.cancel.cancel(CancelReason::Cancelled);
            let elapsed = future.submitted_at.elapsed();
            self.shared
                .task_ended(seq, number, future, TaskOutcome::Cancelled, elapsed, None);
        }
        count
    }

    /// Drops all per-round state. Tasks still outstanding are cancelled first.
    pub fn cleanup(&self) {
        self.cancel_all_tasks(false, false);
        let mut inner = self.shared.inner.lock().unwrap();
        if let Some(round) = inner.round.take() {
            debug!(bundle_id = round.bundle_id, "round cleaned up");
        }
    }

    pub fn is_executing(&self) -> bool {
        self.shared.inner.lock().unwrap().round.is_some()
    }

    /// Tasks of the current round that have not ended yet.
    pub fn future_count(&self) -> usize {
        self.shared
            .inner
            .lock()
            .unwrap()
            .round
            .as_ref()
            .map_or(0, |r| r.futures.len())
    }

    /// The uuid path of the job being executed, if any.
    pub fn current_uuid_path(&self) -> Option<Vec<Uuid>> {
        self.shared
            .inner
            .lock()
            .unwrap()
            .round
            .as_ref()
            .map(|r| r.uuid_path.clone())
    }

    /// Makes a blocked [`execute`](Self::execute) return with a reconnection error.
    /// The notification stays pending until someone takes it.
    pub fn set_reconnection_notification(&self, reason: impl Into<String>) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.reconnection = Some(reason.into());
        self.shared.changed.notify_all();
    }

    pub fn take_reconnection_notification(&self) -> Option<String> {
        self.shared.inner.lock().unwrap().reconnection.take()
    }

    pub fn thread_pool_size(&self) -> usize {
        self.threads.pool_size()
    }

    pub fn set_thread_pool_size(&self, size: usize) -> std::result::Result<(), ExecutionError> {
        if self.threads.set_pool_size(size)? {
            self.config_changed.store(true, Ordering::SeqCst);
            info!(size, "thread pool size changed");
        }
        Ok(())
    }

    pub fn thread_priority(&self) -> i32 {
        self.threads.priority()
    }

    pub fn set_thread_priority(&self, priority: i32) {
        if self.threads.set_priority(priority) {
            self.config_changed.store(true, Ordering::SeqCst);
            info!(priority = self.threads.priority(), "thread priority changed");
        }
    }

    /// Returns whether the pool configuration changed since the last call, and resets it.
    pub fn take_config_changed(&self) -> bool {
        self.config_changed.swap(false, Ordering::SeqCst)
    }

    /// Turns a round report into the message sent to the driver, advertising the
    /// pool size when it changed.
    pub fn bundle_results(&self, report: RoundReport) -> BundleResults {
        let processing_threads = self
            .take_config_changed()
            .then(|| self.thread_pool_size() as u32);
        BundleResults {
            bundle_id: report.bundle_id,
            job_id: report.job_id,
            results: report.results,
            requeue: report.requeue,
            processing_threads,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ExecutionListener>) {
        self.shared.listeners.write().unwrap().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ExecutionListener>) -> bool {
        let mut listeners = self.shared.listeners.write().unwrap();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn shutdown(&self) {
        self.cancel_all_tasks(true, false);
        self.threads.shutdown();
    }
}

impl Drop for NodeExecutionManager {
    fn drop(&mut self) {
        self.threads.shutdown();
    }
}

/// Body of a pool job.
fn run_task(shared: &Shared, seq: u64, number: u64, task: Arc<dyn Task>, ctx: TaskContext) {
    if ctx.is_cancelled() {
        return;
    }
    let start = Instant::now();
    let cpu_start = thread_cpu_time();
    let outcome = match catch_unwind(AssertUnwindSafe(|| task.run(&ctx))) {
        Ok(Ok(output)) => TaskOutcome::Completed(output),
        Ok(Err(message)) => TaskOutcome::Failed(message),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "task panicked".to_string());
            warn!(position = ctx.position, %message, "task panicked");
            TaskOutcome::Failed(message)
        }
    };
    let elapsed = start.elapsed();
    let cpu = match (cpu_start, thread_cpu_time()) {
        (Some(before), Some(after)) => Some(after.saturating_sub(before)),
        _ => None,
    };
    if let Some(future) = shared.claim(seq, number) {
        shared.task_ended(seq, number, future, outcome, elapsed, cpu);
    }
}
