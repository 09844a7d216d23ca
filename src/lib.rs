// Subpulse - asynchronous job orchestration core for subreddit analytics

pub mod analytics;
pub mod config;
pub mod pool;
pub mod queue;
pub mod store;
pub mod types;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use queue::{
    Broker, JobDispatcher, JobHandler, JobKind, ProgressListener, ProgressSink, ResultListener,
    WorkerConsumer,
};
pub use store::JobStore;
pub use pool::{ConnectionPool, PooledConnection};
pub use types::{AppError, AppResult, JobParams, JobRequest, JobStage, ProgressUpdate};
