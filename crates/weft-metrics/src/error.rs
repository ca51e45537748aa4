#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
  #[error("invalid metric name '{0}'")]
  InvalidName(String),

  #[error("invalid label name '{label}' on metric '{metric}'")]
  InvalidLabel { metric: String, label: String },

  #[error("metric '{name}' is already registered as a {existing}")]
  KindMismatch { name: String, existing: &'static str },

  #[error("counter '{name}' cannot decrease (got {value})")]
  NegativeIncrement { name: String, value: f64 },

  #[error("'{0}' is not a number")]
  NotANumber(String),

  #[error("invalid condition '{expr}': {reason}")]
  Condition { expr: String, reason: String },

  #[error("failed to bind metrics listener on {addr}: {source}")]
  Bind { addr: String, source: std::io::Error },

  #[error("metrics server failed: {0}")]
  Serve(#[source] std::io::Error),
}
