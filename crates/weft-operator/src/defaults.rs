use serde_json::Value;
use weft_workflow::{ObjectMeta, Workflow, WorkflowStatus};

use crate::error::OperatorError;

/// Recursive JSON merge where `overlay` wins. Objects merge key by key;
/// anything else is replaced. Null and empty-string overlay values leave
/// the base alone.
fn merge(base: &mut Value, overlay: Value) {
  match (base, overlay) {
    (Value::Object(base), Value::Object(overlay)) => {
      for (key, value) in overlay {
        match base.get_mut(&key) {
          Some(existing) => merge(existing, value),
          None => {
            base.insert(key, value);
          }
        }
      }
    }
    (_, Value::Null) => {}
    (_, Value::String(s)) if s.is_empty() => {}
    (base, overlay) => *base = overlay,
  }
}

/// `wf` laid over the controller's `workflowDefaults`. Only the defaults'
/// spec, labels and annotations are used.
pub(crate) fn apply_defaults(wf: &Workflow, defaults: &Workflow) -> Result<Workflow, OperatorError> {
  let defaults = Workflow {
    metadata: ObjectMeta {
      labels: defaults.metadata.labels.clone(),
      annotations: defaults.metadata.annotations.clone(),
      ..Default::default()
    },
    spec: defaults.spec.clone(),
    status: WorkflowStatus::default(),
  };
  let mut merged = serde_json::to_value(&defaults)?;
  merge(&mut merged, serde_json::to_value(wf)?);
  Ok(serde_json::from_value(merged)?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use weft_workflow::{RetryStrategy, WorkflowSpec};

  #[test]
  fn test_workflow_values_win_and_gaps_are_filled() {
    let mut defaults = Workflow::default();
    defaults.metadata.labels.insert("team".into(), "data".into());
    defaults.metadata.labels.insert("tier".into(), "batch".into());
    defaults.spec.parallelism = Some(4);
    defaults.spec.entrypoint = "main".into();
    defaults.spec.retry_strategy = Some(RetryStrategy {
      limit: Some("2".into()),
      ..Default::default()
    });

    let mut wf = Workflow::new("ns", "wf", WorkflowSpec::default());
    wf.metadata.labels.insert("tier".into(), "interactive".into());
    wf.spec.parallelism = Some(1);

    let merged = apply_defaults(&wf, &defaults).unwrap();
    assert_eq!(merged.name(), "wf");
    assert_eq!(merged.namespace(), "ns");
    assert_eq!(merged.metadata.labels["team"], "data");
    assert_eq!(merged.metadata.labels["tier"], "interactive");
    assert_eq!(merged.spec.parallelism, Some(1));
    assert_eq!(merged.spec.entrypoint, "main");
    assert_eq!(merged.spec.retry_strategy.and_then(|r| r.limit).as_deref(), Some("2"));
  }
}
