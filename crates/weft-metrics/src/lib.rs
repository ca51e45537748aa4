//! Weft Metrics
//!
//! A small Prometheus registry shared by the controller and the operator.
//! The controller records its own series ([`ControllerMetrics`]); workflows
//! and templates declare custom metrics that the operator emits when they
//! finish. Everything is served as text exposition format by
//! [`MetricsServer`].
//!
//! ```text
//!   controller ──┐
//!                ├──▶ MetricsRegistry ──▶ GET /metrics
//!   operator ────┘
//! ```

mod condition;
mod controller;
mod error;
mod registry;
mod server;

pub use condition::evaluate_condition;
pub use controller::{
  ControllerMetrics, ERROR_COUNT, OPERATION_DURATION, PODS_COUNT, QUEUE_DEPTH, WORKFLOWS_COUNT,
  WORKFLOWS_PROCESSED,
};
pub use error::MetricsError;
pub use registry::{Labels, MetricKind, MetricsRegistry, labels, parse_value};
pub use server::{MetricsServer, TEXT_FORMAT, router};
