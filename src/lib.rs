//! # buildq
//!
//! Queue-driven build execution for generated projects.
//!
//! A build request is analyzed for complexity, turned into an immutable job
//! and placed on a priority queue. A pool of workers runs each job's install,
//! build and test phases in resource-capped, network-isolated containers,
//! retrying with exponential backoff and dead-lettering jobs that exhaust
//! their budget. Terminal results go out over webhooks; live progress is
//! fanned out to subscribers.

pub mod analysis;
pub mod config;
pub mod container;
pub mod db;
pub mod error;
pub mod files;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod server;
pub mod telemetry;
pub mod worker;
