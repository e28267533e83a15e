//! JobGrid node: runs the task bundles a driver sends it on a resizable pool of worker
//! threads, with per-task timeouts and cooperative cancellation.

pub mod cancel;
pub mod config;
pub mod error;
pub mod execution;
pub mod node;
pub mod resource;
pub mod schedule;
pub mod task;
pub mod thread_manager;

pub use cancel::{CancelReason, CancelToken, Cancelled};
pub use config::{NodeConfig, NodeTls};
pub use error::{ExecutionError, NodeError, Result};
pub use execution::{ExecutionListener, NodeExecutionManager, RoundReport, TaskEndedEvent};
pub use node::{Node, NodeHandle};
pub use resource::{DirectoryResources, MemoryResources, NoResources, ResourceProvider};
pub use task::{Task, TaskContext, TaskRegistry};
pub use thread_manager::{ThreadManager, ThreadManagerRegistry, ThreadPool};
