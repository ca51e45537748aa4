use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::MetricsError;
use crate::registry::{Labels, MetricsRegistry, labels};

pub const WORKFLOWS_COUNT: &str = "weft_workflows_count";
pub const PODS_COUNT: &str = "weft_workflows_pods_count";
pub const WORKFLOWS_PROCESSED: &str = "weft_workflows_processed_count";
pub const OPERATION_DURATION: &str = "weft_workflows_operation_duration_seconds";
pub const ERROR_COUNT: &str = "weft_workflows_error_count";
pub const QUEUE_DEPTH: &str = "weft_workflows_queue_depth_count";

const OPERATION_BUCKETS: [f64; 11] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// The series every controller reports, whatever its workflows declare.
#[derive(Debug, Clone)]
pub struct ControllerMetrics {
  registry: Arc<MetricsRegistry>,
}

impl ControllerMetrics {
  pub fn new(registry: Arc<MetricsRegistry>) -> Self {
    Self { registry }
  }

  pub fn registry(&self) -> &Arc<MetricsRegistry> {
    &self.registry
  }

  /// Set the workflow gauge for every phase in `phases`, zero when a phase
  /// has no entry in `counts`.
  pub fn workflows_by_phase<'a>(&self, phases: &[&str], counts: impl IntoIterator<Item = (&'a str, usize)>) {
    self.set_by_phase(WORKFLOWS_COUNT, "Number of workflows by phase", phases, counts);
  }

  pub fn pods_by_phase<'a>(&self, phases: &[&str], counts: impl IntoIterator<Item = (&'a str, usize)>) {
    self.set_by_phase(PODS_COUNT, "Number of pods by phase", phases, counts);
  }

  fn set_by_phase<'a>(
    &self,
    name: &str,
    help: &str,
    phases: &[&str],
    counts: impl IntoIterator<Item = (&'a str, usize)>,
  ) {
    let counts: Vec<(&str, usize)> = counts.into_iter().collect();
    for phase in phases {
      let n = counts.iter().filter(|(p, _)| p == phase).map(|(_, n)| *n).sum::<usize>();
      record(self.registry.set_gauge(name, help, &labels([("phase", *phase)]), n as f64));
    }
  }

  /// One reconcile of a workflow finished, successfully or not.
  pub fn operation(&self, elapsed: Duration) {
    record(self.registry.inc_counter(
      WORKFLOWS_PROCESSED,
      "Number of workflow reconciles",
      &Labels::new(),
      1.0,
    ));
    record(self.registry.observe(
      OPERATION_DURATION,
      "Time taken by one workflow reconcile",
      &OPERATION_BUCKETS,
      &Labels::new(),
      elapsed.as_secs_f64(),
    ));
  }

  pub fn error(&self, cause: &str) {
    record(self.registry.inc_counter(
      ERROR_COUNT,
      "Number of errors by cause",
      &labels([("cause", cause)]),
      1.0,
    ));
  }

  pub fn queue_depth(&self, queue: &str, depth: usize) {
    record(self.registry.set_gauge(
      QUEUE_DEPTH,
      "Keys waiting in a work queue",
      &labels([("queue_name", queue)]),
      depth as f64,
    ));
  }
}

// Built-in names and kinds are fixed; a rejection is only logged.
fn record(result: Result<(), MetricsError>) {
  if let Err(error) = result {
    debug!(%error, "builtin_metric_rejected");
  }
}
