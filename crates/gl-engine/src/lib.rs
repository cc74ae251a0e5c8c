//! The gauntlet orchestration engine: dependency-aware execution planning,
//! a priority task scheduler with a fixed worker pool, a supervised plugin
//! sandbox, bounded resource tracking, failure classification, and graceful
//! degradation, composed by [`engine::AnalysisEngine`] into a single
//! `run analysis -> aggregated result` operation with a lifecycle event
//! stream.

pub mod degradation;
pub mod engine;
pub mod errors;
pub mod events;
pub mod resolver;
pub mod resources;
pub mod sandbox;
pub mod scheduler;
