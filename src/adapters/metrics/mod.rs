//! Metrics and Monitoring Adapters
//!
//! Prometheus metrics and the ops server exposing /live, /ready and
//! /metrics via axum 0.7.

pub mod health;
pub mod prometheus;

pub use health::{HealthServer, HealthState};
pub use prometheus::MetricsRegistry;
