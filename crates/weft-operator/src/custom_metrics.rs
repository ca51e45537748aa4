use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use weft_metrics::{Labels, MetricsError, MetricsRegistry, evaluate_condition, parse_value};
use weft_resolver::stored_template_id;
use weft_workflow::{MetricSpec, MetricValue, Metrics, NodeStatus, NodeType, Template, Workflow};

use crate::context::Operation;
use crate::substitute::{Params, substitute_str};

pub(crate) const CUSTOM_METRIC_ERROR: &str = "CustomMetric";

fn seconds_between(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> f64 {
  match (start, end) {
    (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as f64 / 1000.0,
    _ => 0.0,
  }
}

/// The template a finished node ran, as pinned on the workflow.
fn template_of<'w>(wf: &'w Workflow, node: &NodeStatus) -> Option<&'w Template> {
  if let Some(r) = &node.template_ref {
    let id = stored_template_id(r.cluster_scope, &r.name, &r.template);
    return wf.status.stored_templates.get(&id);
  }
  let name = node.template_name.as_deref()?;
  wf.get_template(name).or_else(|| {
    let suffix = format!("/{name}");
    wf.status
      .stored_templates
      .iter()
      .find(|(id, _)| id.ends_with(&suffix))
      .map(|(_, t)| t)
  })
}

/// Values a node's metrics may refer to on top of the workflow globals.
fn node_params(globals: &Params, node: &NodeStatus) -> Params {
  let mut params = globals.clone();
  params.insert("status".into(), node.phase.as_str().to_string());
  params.insert(
    "duration".into(),
    seconds_between(node.started_at, node.finished_at).to_string(),
  );
  if let Some(inputs) = &node.inputs {
    for p in &inputs.parameters {
      if let Some(value) = &p.value {
        params.insert(format!("inputs.parameters.{}", p.name), value.clone());
      }
    }
  }
  if let Some(outputs) = &node.outputs {
    for p in &outputs.parameters {
      if let Some(value) = &p.value {
        params.insert(format!("outputs.parameters.{}", p.name), value.clone());
      }
    }
    if let Some(result) = &outputs.result {
      params.insert("outputs.result".into(), result.clone());
    }
    if let Some(code) = &outputs.exit_code {
      params.insert("exitCode".into(), code.clone());
    }
  }
  params
}

#[derive(Debug, thiserror::Error)]
enum EmitError {
  #[error("{0}")]
  Substitute(String),
  #[error(transparent)]
  Metrics(#[from] MetricsError),
}

fn expand(input: &str, params: &Params) -> Result<String, EmitError> {
  let out = substitute_str(input, params, &[]).map_err(|e| EmitError::Substitute(e.to_string()))?;
  if out.contains("{{") {
    return Err(EmitError::Substitute(format!("unresolved placeholder in '{input}'")));
  }
  Ok(out)
}

/// Emit one metric. `Ok(false)` when its `when` does not hold.
fn emit(registry: &MetricsRegistry, spec: &MetricSpec, params: &Params) -> Result<bool, EmitError> {
  if let Some(when) = &spec.when
    && !evaluate_condition(&expand(when, params)?)?
  {
    return Ok(false);
  }
  let name = expand(&spec.name, params)?;
  let mut labels = Labels::new();
  for label in &spec.labels {
    labels.insert(label.key.clone(), expand(&label.value, params)?);
  }
  let value = spec.value().map_err(|e| EmitError::Substitute(e.to_string()))?;
  match value {
    MetricValue::Gauge(raw) => registry.set_gauge(&name, &spec.help, &labels, parse_value(&expand(raw, params)?)?)?,
    MetricValue::Counter(raw) => {
      registry.inc_counter(&name, &spec.help, &labels, parse_value(&expand(raw, params)?)?)?
    }
    MetricValue::Histogram { value, buckets } => {
      registry.observe(&name, &spec.help, buckets, &labels, parse_value(&expand(value, params)?)?)?
    }
  }
  Ok(true)
}

impl Operation<'_> {
  /// Emit the custom metrics of templates whose nodes finished in this
  /// reconcile, and of the workflow when it completed.
  pub(crate) fn emit_custom_metrics(&self, fulfilled_before: &HashSet<String>) {
    let Some(controller) = self.op.metrics.as_ref() else {
      return;
    };
    let registry = controller.registry();
    let ignore_errors = self.config.metrics_config.ignore_errors;
    let report = |owner: &str, spec: &MetricSpec, result: Result<bool, EmitError>| match result {
      Ok(emitted) => {
        if emitted {
          debug!(owner, metric = %spec.name, "custom_metric_emitted");
        }
      }
      Err(error) if ignore_errors => debug!(owner, metric = %spec.name, %error, "custom_metric_skipped"),
      Err(error) => {
        warn!(owner, metric = %spec.name, %error, "custom_metric_failed");
        controller.error(CUSTOM_METRIC_ERROR);
      }
    };

    // Attempts under a retry node share its template; the retry node
    // reports for all of them.
    let retried: HashSet<&str> = self
      .wf
      .status
      .nodes
      .values()
      .filter(|n| n.node_type == NodeType::Retry)
      .flat_map(|n| n.children.iter().map(String::as_str))
      .collect();
    for node in self.wf.status.nodes.values() {
      if !node.fulfilled()
        || fulfilled_before.contains(&node.id)
        || node.node_type == NodeType::Skipped
        || retried.contains(node.id.as_str())
      {
        continue;
      }
      let Some(Metrics { prometheus }) = template_of(&self.wf, node).and_then(|t| t.metrics.as_ref()) else {
        continue;
      };
      let params = node_params(&self.globals, node);
      for spec in prometheus {
        report(&node.name, spec, emit(registry, spec, &params));
      }
    }

    if self.completed_now
      && let Some(Metrics { prometheus }) = self.wf.spec.metrics.as_ref()
    {
      let mut params = self.globals.clone();
      params.insert("status".into(), self.wf.status.phase.as_str().to_string());
      params.insert(
        "duration".into(),
        seconds_between(self.wf.status.started_at, self.wf.status.finished_at).to_string(),
      );
      for spec in prometheus {
        report(self.wf.name(), spec, emit(registry, spec, &params));
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use weft_metrics::labels;
  use weft_workflow::{CounterSpec, GaugeSpec, HistogramSpec, MetricLabel, NodePhase};

  fn params(pairs: &[(&str, &str)]) -> Params {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
  }

  #[test]
  fn test_when_and_labels_are_substituted() {
    let registry = MetricsRegistry::new();
    let spec = MetricSpec {
      name: "weft_step_failures".into(),
      help: "Failed steps".into(),
      labels: vec![MetricLabel {
        key: "step".into(),
        value: "{{workflow.name}}".into(),
      }],
      when: Some("{{status}} == Failed".into()),
      counter: Some(CounterSpec { value: "1".into() }),
      ..Default::default()
    };
    let failed = params(&[("status", "Failed"), ("workflow.name", "hello")]);
    let succeeded = params(&[("status", "Succeeded"), ("workflow.name", "hello")]);

    assert!(emit(&registry, &spec, &failed).unwrap());
    assert!(emit(&registry, &spec, &failed).unwrap());
    assert!(!emit(&registry, &spec, &succeeded).unwrap());
    assert_eq!(
      registry.value("weft_step_failures", &labels([("step", "hello")])),
      Some(2.0)
    );
  }

  #[test]
  fn test_gauge_and_histogram_values() {
    let registry = MetricsRegistry::new();
    let gauge = MetricSpec {
      name: "weft_last_duration".into(),
      help: "Last duration".into(),
      gauge: Some(GaugeSpec {
        value: "{{duration}}".into(),
      }),
      ..Default::default()
    };
    let histogram = MetricSpec {
      name: "weft_durations".into(),
      help: "Durations".into(),
      histogram: Some(HistogramSpec {
        value: "{{duration}}".into(),
        buckets: vec![1.0, 10.0],
      }),
      ..Default::default()
    };
    let p = params(&[("duration", "4.5")]);
    emit(&registry, &gauge, &p).unwrap();
    emit(&registry, &histogram, &p).unwrap();
    assert_eq!(registry.value("weft_last_duration", &Labels::new()), Some(4.5));
    assert_eq!(registry.histogram_count("weft_durations", &Labels::new()), Some(1));
  }

  #[test]
  fn test_unresolved_or_bad_values_fail() {
    let registry = MetricsRegistry::new();
    let spec = MetricSpec {
      name: "weft_x".into(),
      help: "x".into(),
      gauge: Some(GaugeSpec {
        value: "{{outputs.result}}".into(),
      }),
      ..Default::default()
    };
    assert!(matches!(emit(&registry, &spec, &Params::new()), Err(EmitError::Substitute(_))));
    let p = params(&[("outputs.result", "lots")]);
    assert!(matches!(
      emit(&registry, &spec, &p),
      Err(EmitError::Metrics(MetricsError::NotANumber(_)))
    ));
    assert!(!registry.contains("weft_x"));
  }

  #[test]
  fn test_node_params_cover_status_io_and_exit_code() {
    let now = Utc::now();
    let mut node = NodeStatus::new("wf-1", "wf[0].a", "a", NodeType::Pod, NodePhase::Succeeded, now);
    node.finished_at = Some(now + chrono::Duration::seconds(3));
    node.outputs = Some(weft_workflow::Outputs {
      result: Some("42".into()),
      exit_code: Some("0".into()),
      ..Default::default()
    });
    let p = node_params(&params(&[("workflow.name", "wf")]), &node);
    assert_eq!(p["status"], "Succeeded");
    assert_eq!(p["duration"], "3");
    assert_eq!(p["outputs.result"], "42");
    assert_eq!(p["exitCode"], "0");
    assert_eq!(p["workflow.name"], "wf");
  }
}
