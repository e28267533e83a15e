//! JobGrid driver: accepts jobs from clients, cuts them into bundles sized per node and
//! routes results back as nodes return them.

pub mod bundle;
pub mod bundler;
pub mod client_server;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod job;
pub mod node_server;
pub mod queue;

pub use bundle::TaskBundle;
pub use bundler::{
    Bundler, BundlerReference, BundlerRegistry, BundlerSettings, ChannelBundler, NodeProfile,
};
pub use config::{DriverConfig, ModeConfig, TlsFiles};
pub use dispatch::{select_bundle, Dispatch};
pub use driver::{Driver, DriverStats};
pub use error::{BundlerError, DriverError, Result};
pub use job::{JobInfo, JobRegistry};
pub use node_server::NodeInfo;
pub use queue::{JobQueue, QueueEvent, QueueListener, QueueStatsSnapshot};
