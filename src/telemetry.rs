//! Observability: Prometheus metrics and health endpoints.

pub mod health;
pub mod metrics;
