use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

static METRIC_NAME: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").expect("metric name pattern is valid"));
static LABEL_NAME: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("label name pattern is valid"));

/// Custom metrics emitted when a workflow or template finishes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Metrics {
  #[serde(default)]
  pub prometheus: Vec<MetricSpec>,
}

impl Metrics {
  pub fn validate(&self) -> Result<(), WorkflowError> {
    let mut names = HashSet::new();
    for metric in &self.prometheus {
      metric.validate()?;
      if !names.insert(metric.name.as_str()) {
        return Err(WorkflowError::validation(format!("metric '{}' is declared twice", metric.name)));
      }
    }
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricLabel {
  pub key: String,
  pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GaugeSpec {
  pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CounterSpec {
  pub value: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistogramSpec {
  pub value: String,
  pub buckets: Vec<f64>,
}

/// One metric. Its name, labels, `when` and value may hold `{{...}}`
/// placeholders such as `{{status}}` or `{{duration}}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricSpec {
  pub name: String,
  pub help: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub labels: Vec<MetricLabel>,
  /// Emit only when this condition holds, e.g. `{{status}} == Failed`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub when: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub gauge: Option<GaugeSpec>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub counter: Option<CounterSpec>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub histogram: Option<HistogramSpec>,
}

/// The kind of a metric with its value expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue<'a> {
  Gauge(&'a str),
  Counter(&'a str),
  Histogram { value: &'a str, buckets: &'a [f64] },
}

impl MetricSpec {
  /// The single kind set on this metric.
  pub fn value(&self) -> Result<MetricValue<'_>, WorkflowError> {
    match (&self.gauge, &self.counter, &self.histogram) {
      (Some(g), None, None) => Ok(MetricValue::Gauge(&g.value)),
      (None, Some(c), None) => Ok(MetricValue::Counter(&c.value)),
      (None, None, Some(h)) => Ok(MetricValue::Histogram {
        value: &h.value,
        buckets: &h.buckets,
      }),
      _ => Err(WorkflowError::validation(format!(
        "metric '{}' must be exactly one of gauge, counter or histogram",
        self.name
      ))),
    }
  }

  pub fn validate(&self) -> Result<(), WorkflowError> {
    // Placeholders in the name are checked once they are expanded.
    if !self.name.contains("{{") && !METRIC_NAME.is_match(&self.name) {
      return Err(WorkflowError::validation(format!("invalid metric name '{}'", self.name)));
    }
    if self.help.trim().is_empty() {
      return Err(WorkflowError::validation(format!("metric '{}' needs help text", self.name)));
    }
    for label in &self.labels {
      if !LABEL_NAME.is_match(&label.key) {
        return Err(WorkflowError::validation(format!(
          "metric '{}' has invalid label '{}'",
          self.name, label.key
        )));
      }
    }
    if let MetricValue::Histogram { buckets, .. } = self.value()? {
      if buckets.is_empty() {
        return Err(WorkflowError::validation(format!("histogram '{}' needs buckets", self.name)));
      }
      if buckets.windows(2).any(|w| w[0] >= w[1]) {
        return Err(WorkflowError::validation(format!(
          "histogram '{}' buckets must increase",
          self.name
        )));
      }
    }
    Ok(())
  }
}

pub fn is_valid_metric_name(name: &str) -> bool {
  METRIC_NAME.is_match(name)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(yaml: &str) -> Metrics {
    serde_yaml::from_str(yaml).unwrap()
  }

  #[test]
  fn test_metrics_parse_and_validate() {
    let metrics = parse(
      r#"
prometheus:
  - name: result_counter
    help: Count of step results
    labels:
      - key: name
        value: flakey
    when: "{{status}} == Failed"
    counter:
      value: "1"
  - name: duration
    help: Step duration
    histogram:
      value: "{{duration}}"
      buckets: [1.0, 5.0, 30.0]
"#,
    );
    metrics.validate().unwrap();
    assert_eq!(metrics.prometheus[0].value().unwrap(), MetricValue::Counter("1"));
    assert!(matches!(
      metrics.prometheus[1].value().unwrap(),
      MetricValue::Histogram { buckets, .. } if buckets.len() == 3
    ));
  }

  #[test]
  fn test_metric_kind_must_be_unique() {
    let metrics = parse(
      r#"
prometheus:
  - name: both
    help: h
    gauge: { value: "1" }
    counter: { value: "1" }
"#,
    );
    assert!(metrics.validate().is_err());
  }

  #[test]
  fn test_invalid_names_and_buckets() {
    let bad_name = MetricSpec {
      name: "bad-name".into(),
      help: "h".into(),
      gauge: Some(GaugeSpec { value: "1".into() }),
      ..Default::default()
    };
    assert!(bad_name.validate().is_err());

    let unsorted = MetricSpec {
      name: "h".into(),
      help: "h".into(),
      histogram: Some(HistogramSpec {
        value: "1".into(),
        buckets: vec![5.0, 1.0],
      }),
      ..Default::default()
    };
    assert!(unsorted.validate().is_err());
    assert!(is_valid_metric_name("weft_custom:total"));
  }
}
