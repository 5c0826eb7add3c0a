//! Genome Queue: durable background job queue for genome analysis.

pub mod artifacts;
pub mod config;
pub mod error;
pub mod jobs;
pub mod reaper;
pub mod store;
pub mod worker;
