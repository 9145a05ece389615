//! Core data model.
//!
//! A build job is a project snapshot (files + dependency manifest) plus the
//! execution plan chosen for it. The queue owns jobs once enqueued; workers
//! borrow them for one attempt and produce a [`result::BuildResult`].

pub mod job;
pub mod project;
pub mod result;

pub use job::*;
pub use project::*;
pub use result::*;
