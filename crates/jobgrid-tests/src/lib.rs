//! JobGrid test infrastructure: an in-process grid of one driver, any number of
//! nodes and job clients, all over loopback.

pub mod harness;

pub use harness::{init_tracing, wait_until, EventLog, GridBuilder, GridNode, TestGrid};
