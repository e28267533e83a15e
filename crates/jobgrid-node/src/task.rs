//! Executable tasks and the registry that builds them from wire specs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cancel::{CancelReason, CancelToken};
use crate::resource::ResourceProvider;

/// Everything a running task can see of its surroundings.
pub struct TaskContext {
    pub position: u32,
    cancel: CancelToken,
    resources: Arc<dyn ResourceProvider>,
}

impl TaskContext {
    pub fn new(position: u32, cancel: CancelToken, resources: Arc<dyn ResourceProvider>) -> Self {
        Self {
            position,
            cancel,
            resources,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.cancel.reason()
    }

    /// Sleeps for `duration`, returning early with an error if the task is cancelled.
    pub fn sleep(&self, duration: Duration) -> Result<(), String> {
        self.cancel.sleep(duration).map_err(|e| e.to_string())
    }

    pub fn resource(&self, name: &str) -> Option<Vec<u8>> {
        self.resources.resource(name)
    }
}

/// A unit of work run on a pool thread.
///
/// `run` may block. Cancellation is cooperative: a task that never checks its
/// context runs to completion, although its result is discarded once the
/// task has been cancelled or timed out.
pub trait Task: Send + Sync {
    fn run(&self, ctx: &TaskContext) -> Result<Vec<u8>, String>;

    /// Called before the task's cancel token is triggered by a cancel request.
    fn on_cancel(&self) {}

    /// Called when the task's timeout fires, before it is cancelled.
    fn on_timeout(&self) {}
}

pub type TaskFactory = Arc<dyn Fn(&[u8]) -> Result<Box<dyn Task>, String> + Send + Sync>;

/// Maps task kinds to factories.
#[derive(Clone)]
pub struct TaskRegistry {
    factories: HashMap<String, TaskFactory>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("echo", |payload| Ok(Box::new(EchoTask(payload.to_vec()))));
        registry.register("sleep", |payload| {
            Ok(Box::new(SleepTask(Duration::from_millis(parse_millis(payload)?))))
        });
        registry.register("fail", |payload| {
            Ok(Box::new(FailTask(
                String::from_utf8_lossy(payload).into_owned(),
            )))
        });
        registry.register("busy", |payload| {
            Ok(Box::new(BusyTask(Duration::from_millis(parse_millis(payload)?))))
        });
        registry
    }
}

impl TaskRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&[u8]) -> Result<Box<dyn Task>, String> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
    }

    /// Builds a task. An unknown kind or a bad payload is reported as the task's failure.
    pub fn build(&self, kind: &str, payload: &[u8]) -> Result<Box<dyn Task>, String> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| format!("unknown task kind: {kind}"))?;
        factory(payload)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

fn parse_millis(payload: &[u8]) -> Result<u64, String> {
    std::str::from_utf8(payload)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| "payload must be a number of milliseconds".to_string())
}

/// Returns its payload.
struct EchoTask(Vec<u8>);

impl Task for EchoTask {
    fn run(&self, _ctx: &TaskContext) -> Result<Vec<u8>, String> {
        Ok(self.0.clone())
    }
}

/// Sleeps, honouring cancellation.
struct SleepTask(Duration);

impl Task for SleepTask {
    fn run(&self, ctx: &TaskContext) -> Result<Vec<u8>, String> {
        ctx.sleep(self.0)?;
        Ok(self.0.as_millis().to_string().into_bytes())
    }
}

/// Always fails with its payload as the message.
struct FailTask(String);

impl Task for FailTask {
    fn run(&self, _ctx: &TaskContext) -> Result<Vec<u8>, String> {
        Err(self.0.clone())
    }
}

/// Spins for the given time without looking at its cancel token.
struct BusyTask(Duration);

impl Task for BusyTask {
    fn run(&self, _ctx: &TaskContext) -> Result<Vec<u8>, String> {
        let start = Instant::now();
        let mut counter = 0u64;
        while start.elapsed() < self.0 {
            counter = std::hint::black_box(counter.wrapping_add(1));
        }
        Ok(counter.to_le_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::new_cancel_pair;
    use crate::resource::NoResources;

    fn context() -> (TaskContext, crate::cancel::CancelHandle) {
        let (token, handle) = new_cancel_pair();
        (TaskContext::new(0, token, Arc::new(NoResources)), handle)
    }

    #[test]
    fn test_builtin_kinds() {
        let registry = TaskRegistry::default();
        assert_eq!(registry.kinds(), vec!["busy", "echo", "fail", "sleep"]);
        let (ctx, _handle) = context();

        let echo = registry.build("echo", b"hi").unwrap();
        assert_eq!(echo.run(&ctx), Ok(b"hi".to_vec()));

        let fail = registry.build("fail", b"boom").unwrap();
        assert_eq!(fail.run(&ctx), Err("boom".to_string()));

        let sleep = registry.build("sleep", b"5").unwrap();
        assert_eq!(sleep.run(&ctx), Ok(b"5".to_vec()));
    }

    #[test]
    fn test_unknown_kind() {
        let registry = TaskRegistry::default();
        let err = registry.build("render", b"").err().unwrap();
        assert_eq!(err, "unknown task kind: render");
    }

    #[test]
    fn test_bad_sleep_payload() {
        assert!(TaskRegistry::default().build("sleep", b"soon").is_err());
    }

    #[test]
    fn test_sleep_observes_cancel() {
        let registry = TaskRegistry::default();
        let (ctx, handle) = context();
        let task = registry.build("sleep", b"10000").unwrap();
        handle.cancel(CancelReason::Cancelled);
        assert!(task.run(&ctx).is_err());
        assert_eq!(ctx.cancel_reason(), Some(CancelReason::Cancelled));
    }

    #[test]
    fn test_busy_ignores_cancel() {
        let registry = TaskRegistry::default();
        let (ctx, handle) = context();
        handle.cancel(CancelReason::Cancelled);
        let task = registry.build("busy", b"5").unwrap();
        assert!(task.run(&ctx).is_ok());
    }

    #[test]
    fn test_custom_kind() {
        struct Upper;
        impl Task for Upper {
            fn run(&self, ctx: &TaskContext) -> Result<Vec<u8>, String> {
                Ok(ctx.position.to_string().into_bytes())
            }
        }
        let mut registry = TaskRegistry::empty();
        registry.register("position", |_| Ok(Box::new(Upper)));
        let (token, _handle) = new_cancel_pair();
        let ctx = TaskContext::new(7, token, Arc::new(NoResources));
        assert_eq!(registry.build("position", b"").unwrap().run(&ctx), Ok(b"7".to_vec()));
    }
}
