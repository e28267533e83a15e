//! JobGrid client: build jobs, submit them to a driver and await their results.

pub mod client;
pub mod error;
pub mod job;

pub use client::{JobClient, JobHandle, JobOutcome};
pub use error::{ClientError, Result};
pub use job::Job;
