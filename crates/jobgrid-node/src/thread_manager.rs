//! Worker threads that execute tasks.
//!
//! A [`ThreadManager`] is chosen by name from a [`ThreadManagerRegistry`] when the node
//! starts. Pool size and thread priority can both be changed while tasks run; workers
//! pick up a new priority before their next job and surplus workers retire once idle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::error::ExecutionError;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// How long an idle worker waits before re-checking whether it should retire.
const IDLE_CHECK: Duration = Duration::from_millis(50);

/// Lowest and highest nice values accepted as thread priorities.
pub const MIN_PRIORITY: i32 = -20;
pub const MAX_PRIORITY: i32 = 19;

pub trait ThreadManager: Send + Sync {
    fn name(&self) -> &'static str;

    fn submit(&self, job: Job) -> Result<(), ExecutionError>;

    fn pool_size(&self) -> usize;

    /// Returns `true` if the size changed.
    fn set_pool_size(&self, size: usize) -> Result<bool, ExecutionError>;

    fn priority(&self) -> i32;

    /// Returns `true` if the priority changed.
    fn set_priority(&self, priority: i32) -> bool;

    /// Jobs currently running.
    fn active(&self) -> usize;

    fn shutdown(&self);
}

/// CPU time consumed by the calling thread, where the platform reports it.
pub fn thread_cpu_time() -> Option<Duration> {
    #[cfg(unix)]
    {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let ret = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
        if ret == 0 {
            return Some(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32));
        }
        None
    }
    #[cfg(not(unix))]
    {
        None
    }
}

/// Applies `priority` as the calling thread's nice value.
fn apply_priority(priority: i32) {
    #[cfg(target_os = "linux")]
    {
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::id_t;
        let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid, priority) };
        if ret != 0 {
            debug!(
                priority,
                error = %std::io::Error::last_os_error(),
                "could not change worker priority"
            );
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = priority;
    }
}

struct PoolShared {
    name: String,
    target: AtomicUsize,
    live: AtomicUsize,
    active: AtomicUsize,
    priority: AtomicI32,
    /// Bumped on every priority change so workers know to re-apply it.
    priority_epoch: AtomicU64,
    next_index: AtomicUsize,
}

impl PoolShared {
    /// Claims one retirement slot if the pool is above its target size.
    fn should_retire(&self) -> bool {
        let mut live = self.live.load(Ordering::SeqCst);
        loop {
            if live <= self.target.load(Ordering::SeqCst) {
                return false;
            }
            match self
                .live
                .compare_exchange(live, live - 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(current) => live = current,
            }
        }
    }
}

/// Fixed-size pool of OS threads fed through a crossbeam channel.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new(name: &str, size: usize, priority: i32) -> Result<Self, ExecutionError> {
        if size == 0 {
            return Err(ExecutionError::InvalidPoolSize(size));
        }
        let (sender, receiver) = unbounded();
        let pool = Self {
            shared: Arc::new(PoolShared {
                name: name.to_string(),
                target: AtomicUsize::new(size),
                live: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                priority: AtomicI32::new(priority.clamp(MIN_PRIORITY, MAX_PRIORITY)),
                priority_epoch: AtomicU64::new(0),
                next_index: AtomicUsize::new(0),
            }),
            sender: Mutex::new(Some(sender)),
            receiver,
            handles: Mutex::new(Vec::new()),
        };
        pool.spawn_workers(size);
        Ok(pool)
    }

    fn spawn_workers(&self, count: usize) {
        let mut handles = self.handles.lock().unwrap();
        handles.retain(|h| !h.is_finished());
        for _ in 0..count {
            let index = self.shared.next_index.fetch_add(1, Ordering::Relaxed);
            let shared = self.shared.clone();
            let receiver = self.receiver.clone();
            shared.live.fetch_add(1, Ordering::SeqCst);
            let spawned = std::thread::Builder::new()
                .name(format!("{}-{}", shared.name, index))
                .spawn({
                    let shared = shared.clone();
                    move || worker_loop(shared, receiver)
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    shared.live.fetch_sub(1, Ordering::SeqCst);
                    warn!(pool = %shared.name, error = %e, "failed to spawn worker");
                }
            }
        }
    }

    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }
}

fn worker_loop(shared: Arc<PoolShared>, receiver: Receiver<Job>) {
    let mut applied_epoch = u64::MAX;
    loop {
        let epoch = shared.priority_epoch.load(Ordering::Acquire);
        if epoch != applied_epoch {
            apply_priority(shared.priority.load(Ordering::Acquire));
            applied_epoch = epoch;
        }
        if shared.should_retire() {
            debug!(pool = %shared.name, "worker retired");
            return;
        }
        match receiver.recv_timeout(IDLE_CHECK) {
            Ok(job) => {
                shared.active.fetch_add(1, Ordering::SeqCst);
                job();
                shared.active.fetch_sub(1, Ordering::SeqCst);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                shared.live.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        }
    }
}

impl ThreadManager for ThreadPool {
    fn name(&self) -> &'static str {
        "pool"
    }

    fn submit(&self, job: Job) -> Result<(), ExecutionError> {
        let sender = self.sender.lock().unwrap();
        let sender = sender.as_ref().ok_or(ExecutionError::PoolShutdown)?;
        sender.send(job).map_err(|_| ExecutionError::PoolShutdown)
    }

    fn pool_size(&self) -> usize {
        self.shared.target.load(Ordering::SeqCst)
    }

    fn set_pool_size(&self, size: usize) -> Result<bool, ExecutionError> {
        if size == 0 {
            return Err(ExecutionError::InvalidPoolSize(size));
        }
        let previous = self.shared.target.swap(size, Ordering::SeqCst);
        if previous == size {
            return Ok(false);
        }
        let live = self.shared.live.load(Ordering::SeqCst);
        if size > live {
            self.spawn_workers(size - live);
        }
        debug!(pool = %self.shared.name, from = previous, to = size, "pool resized");
        Ok(true)
    }

    fn priority(&self) -> i32 {
        self.shared.priority.load(Ordering::Acquire)
    }

    fn set_priority(&self, priority: i32) -> bool {
        let priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        if self.shared.priority.swap(priority, Ordering::AcqRel) == priority {
            return false;
        }
        self.shared.priority_epoch.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn active(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.sender.lock().unwrap().take();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub type ThreadManagerConstructor =
    fn(size: usize, priority: i32) -> Result<Box<dyn ThreadManager>, ExecutionError>;

/// Named thread manager constructors.
#[derive(Clone)]
pub struct ThreadManagerRegistry {
    constructors: HashMap<String, ThreadManagerConstructor>,
}

impl Default for ThreadManagerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("pool", |size, priority| {
            Ok(Box::new(ThreadPool::new("task-worker", size, priority)?))
        });
        registry
    }
}

impl ThreadManagerRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, constructor: ThreadManagerConstructor) {
        self.constructors.insert(name.to_string(), constructor);
    }

    pub fn create(
        &self,
        name: &str,
        size: usize,
        priority: i32,
    ) -> Result<Arc<dyn ThreadManager>, ExecutionError> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| ExecutionError::UnknownThreadManager(name.to_string()))?;
        Ok(Arc::from(constructor(size, priority)?))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_runs_jobs() {
        let pool = ThreadPool::new("test", 3, 0).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let done = done.clone();
            pool.submit(Box::new(move || {
                done.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        wait_for(|| done.load(Ordering::SeqCst) == 20);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            ThreadPool::new("test", 0, 0),
            Err(ExecutionError::InvalidPoolSize(0))
        ));
        let pool = ThreadPool::new("test", 1, 0).unwrap();
        assert!(pool.set_pool_size(0).is_err());
    }

    #[test]
    fn test_grow_and_shrink() {
        let pool = ThreadPool::new("test", 2, 0).unwrap();
        wait_for(|| pool.live_workers() == 2);
        assert!(pool.set_pool_size(5).unwrap());
        assert!(!pool.set_pool_size(5).unwrap());
        wait_for(|| pool.live_workers() == 5);
        assert!(pool.set_pool_size(1).unwrap());
        wait_for(|| pool.live_workers() == 1);
        assert_eq!(pool.pool_size(), 1);
    }

    #[test]
    fn test_concurrency_bounded_by_size() {
        let pool = ThreadPool::new("test", 2, 0).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let (running, peak, done) = (running.clone(), peak.clone(), done.clone());
            pool.submit(Box::new(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(10));
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        wait_for(|| done.load(Ordering::SeqCst) == 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_priority_clamped() {
        let pool = ThreadPool::new("test", 1, 0).unwrap();
        assert!(pool.set_priority(100));
        assert_eq!(pool.priority(), MAX_PRIORITY);
        assert!(!pool.set_priority(MAX_PRIORITY));
    }

    #[test]
    fn test_submit_after_shutdown() {
        let pool = ThreadPool::new("test", 1, 0).unwrap();
        pool.shutdown();
        assert!(matches!(
            pool.submit(Box::new(|| {})),
            Err(ExecutionError::PoolShutdown)
        ));
    }

    #[test]
    fn test_registry() {
        let registry = ThreadManagerRegistry::default();
        assert_eq!(registry.names(), vec!["pool".to_string()]);
        let manager = registry.create("pool", 2, 0).unwrap();
        assert_eq!(manager.pool_size(), 2);
        assert!(matches!(
            registry.create("fibers", 2, 0),
            Err(ExecutionError::UnknownThreadManager(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_thread_cpu_time_advances() {
        let before = thread_cpu_time().unwrap();
        let mut x = 0u64;
        for i in 0..5_000_000u64 {
            x = x.wrapping_add(i * i);
        }
        std::hint::black_box(x);
        assert!(thread_cpu_time().unwrap() > before);
    }
}
