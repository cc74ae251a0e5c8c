//! Core types for the gauntlet analysis engine: the plugin capability
//! contract, per-run analysis context with cooperative cancellation, the
//! cache collaborator, configuration, and the shared result/issue domain
//! types that every other crate speaks.

pub mod cache;
pub mod cancel;
pub mod config;
pub mod context;
pub mod plugin;
pub mod telemetry;
pub mod types;
