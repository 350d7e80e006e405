//! Fake GPU status exporter
//!
//! Receives node topology snapshots and materializes a simulated utilization
//! value for every pod on every reserved GPU under
//! `runai/proc/pod/<pod>/metrics/gpu/<index>/utilization.sm`.

pub mod app;
pub mod config;
pub mod export;
pub mod sampler;
pub mod watch;
