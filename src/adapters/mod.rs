//! Adapters Layer - Hexagonal Architecture Outer Ring
//!
//! Implements the port traits defined in `crate::ports` with concrete
//! external dependencies (HTTP client, file I/O) and hosts the inbound
//! HTTP surfaces.
//!
//! Adapter categories:
//! - `http`: Public price API (`/price`, `/price/stream`)
//! - `market`: Kuru market REST client
//! - `metrics`: Prometheus metrics export and health checks
//! - `persistence`: Durable last-valid-price slot

pub mod http;
pub mod market;
pub mod metrics;
pub mod persistence;
