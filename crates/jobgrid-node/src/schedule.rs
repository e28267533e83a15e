//! Timer thread that fires task timeouts.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use tracing::{debug, warn};

type Action = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Schedule { id: u64, at: Instant, action: Action },
    Cancel(u64),
    Shutdown,
}

/// Runs one-shot actions at a deadline on a single dedicated thread.
///
/// Actions run on the timer thread and must not block.
pub struct TimeoutScheduler {
    commands: Sender<Command>,
    next_id: AtomicU64,
    thread: Option<JoinHandle<()>>,
}

/// Handle to a scheduled action.
#[derive(Debug)]
pub struct TimeoutRegistration {
    id: u64,
    commands: Sender<Command>,
}

impl TimeoutRegistration {
    /// Cancels the action if it has not fired yet.
    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel(self.id));
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Schedule { id, at, .. } => write!(f, "Schedule({id}, {at:?})"),
            Command::Cancel(id) => write!(f, "Cancel({id})"),
            Command::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl TimeoutScheduler {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (commands, receiver) = unbounded::<Command>();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut deadlines: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
                let mut actions: HashMap<u64, Action> = HashMap::new();
                loop {
                    let now = Instant::now();
                    while let Some(Reverse((at, id))) = deadlines.peek().copied() {
                        if at > now {
                            break;
                        }
                        deadlines.pop();
                        if let Some(action) = actions.remove(&id) {
                            action();
                        }
                    }

                    let command = match deadlines.peek() {
                        Some(Reverse((at, _))) => {
                            receiver.recv_timeout(at.saturating_duration_since(Instant::now()))
                        }
                        None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
                    };
                    match command {
                        Ok(Command::Schedule { id, at, action }) => {
                            actions.insert(id, action);
                            deadlines.push(Reverse((at, id)));
                        }
                        Ok(Command::Cancel(id)) => {
                            actions.remove(&id);
                        }
                        Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                            debug!(pending = actions.len(), "timeout scheduler stopped");
                            return;
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    // drop cancelled deadlines so the heap does not grow unbounded
                    if deadlines.len() > 64 && deadlines.len() > actions.len() * 2 {
                        deadlines.retain(|Reverse((_, id))| actions.contains_key(id));
                    }
                }
            })?;
        Ok(Self {
            commands,
            next_id: AtomicU64::new(1),
            thread: Some(thread),
        })
    }

    /// Runs `action` once `delay` has elapsed.
    pub fn schedule(
        &self,
        delay: Duration,
        action: impl FnOnce() + Send + 'static,
    ) -> TimeoutRegistration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let at = Instant::now() + delay;
        if self
            .commands
            .send(Command::Schedule {
                id,
                at,
                action: Box::new(action),
            })
            .is_err()
        {
            warn!("timeout scheduler is stopped; timeout dropped");
        }
        TimeoutRegistration {
            id,
            commands: self.commands.clone(),
        }
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_fires_in_deadline_order() {
        let scheduler = TimeoutScheduler::new("test-timer").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay, label) in [(40u64, 'c'), (10, 'a'), (25, 'b')] {
            let order = order.clone();
            scheduler.schedule(Duration::from_millis(delay), move || {
                order.lock().unwrap().push(label)
            });
        }
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(*order.lock().unwrap(), vec!['a', 'b', 'c']);
    }

    #[test]
    fn test_cancelled_action_never_runs() {
        let scheduler = TimeoutScheduler::new("test-timer").unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let registration = {
            let fired = fired.clone();
            scheduler.schedule(Duration::from_millis(30), move || {
                fired.store(true, Ordering::SeqCst)
            })
        };
        registration.cancel();
        std::thread::sleep(Duration::from_millis(80));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_zero_delay_fires() {
        let scheduler = TimeoutScheduler::new("test-timer").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let count = count.clone();
            scheduler.schedule(Duration::ZERO, move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_drop_stops_thread() {
        let scheduler = TimeoutScheduler::new("test-timer").unwrap();
        scheduler.schedule(Duration::from_secs(60), || {});
        drop(scheduler);
    }
}
