//! Build workers: the processor that runs one attempt inside containers,
//! and the pool that feeds it from the build queue.

pub mod pool;
pub mod processor;
pub mod testing;
pub mod workspace;

pub use pool::{PoolConfig, WorkerPool};
pub use processor::{Attempt, BuildProcessor, ProcessorConfig};

/// Queue name for build jobs.
pub const BUILD_QUEUE: &str = "builds";
