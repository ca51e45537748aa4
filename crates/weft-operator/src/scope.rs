use std::collections::BTreeMap;

use serde_json::Value;
use weft_workflow::{Artifact, NodeStatus};

use crate::error::OperatorError;
use crate::expand::Expandable;
use crate::substitute::{Params, REFERENCE_REQUIRED, placeholder_name, substitute};

/// Values visible to the steps or tasks of one steps/DAG template:
/// the workflow globals plus the outputs of nodes that already finished.
#[derive(Debug, Clone, Default)]
pub(crate) struct Scope {
  pub params: Params,
  pub artifacts: BTreeMap<String, Artifact>,
}

impl Scope {
  pub fn new(globals: &Params) -> Self {
    Self {
      params: globals.clone(),
      artifacts: BTreeMap::new(),
    }
  }

  pub fn add_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
    self.params.insert(key.into(), value.into());
  }

  /// Expose a single node under `prefix` (`steps.gen`, `tasks.a`).
  pub fn add_node(&mut self, prefix: &str, node: &NodeStatus) {
    self.add_param(format!("{prefix}.id"), node.id.clone());
    self.add_param(format!("{prefix}.status"), node.phase.as_str());
    if let Some(started) = node.started_at {
      self.add_param(format!("{prefix}.startedAt"), started.to_rfc3339());
    }
    if let Some(finished) = node.finished_at {
      self.add_param(format!("{prefix}.finishedAt"), finished.to_rfc3339());
    }
    let Some(outputs) = &node.outputs else {
      return;
    };
    if let Some(result) = &outputs.result {
      self.add_param(format!("{prefix}.outputs.result"), result.clone());
    }
    if let Some(code) = &outputs.exit_code {
      self.add_param(format!("{prefix}.exitCode"), code.clone());
    }
    for param in &outputs.parameters {
      if let Some(value) = &param.value {
        self.add_param(format!("{prefix}.outputs.parameters.{}", param.name), value.clone());
      }
    }
    for artifact in &outputs.artifacts {
      self
        .artifacts
        .insert(format!("{prefix}.outputs.artifacts.{}", artifact.name), artifact.clone());
    }
  }

  /// Expose the children of an expanded step or task as JSON lists:
  /// `outputs.result`, `outputs.parameters` and `outputs.parameters.<name>`.
  pub fn add_aggregate(&mut self, prefix: &str, children: &[&NodeStatus]) {
    let mut results = Vec::new();
    let mut param_maps = Vec::new();
    let mut per_name: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for node in children {
      let Some(outputs) = node.outputs.as_ref().filter(|_| node.phase.successful()) else {
        continue;
      };
      if !outputs.parameters.is_empty() {
        let mut map = BTreeMap::new();
        for param in &outputs.parameters {
          let value = param.value.clone().unwrap_or_default();
          per_name.entry(param.name.clone()).or_default().push(value.clone());
          map.insert(param.name.clone(), value);
        }
        param_maps.push(map);
      }
      if let Some(result) = &outputs.result {
        // Results that are themselves JSON are kept structured.
        let item = serde_json::from_str::<Value>(result).unwrap_or_else(|_| Value::String(result.clone()));
        results.push(item);
      }
    }

    self.add_param(
      format!("{prefix}.outputs.result"),
      serde_json::to_string(&results).unwrap_or_default(),
    );
    self.add_param(
      format!("{prefix}.outputs.parameters"),
      serde_json::to_string(&param_maps).unwrap_or_default(),
    );
    for (name, values) in per_name {
      self.add_param(
        format!("{prefix}.outputs.parameters.{name}"),
        serde_json::to_string(&values).unwrap_or_default(),
      );
    }
  }

  /// A step or task with its references to earlier steps or tasks
  /// expanded and its `from` artifacts located.
  pub fn resolve<T: Expandable>(&self, step: &T) -> Result<T, OperatorError> {
    let mut resolved = substitute(step, &self.params, REFERENCE_REQUIRED)?;
    for artifact in &mut resolved.arguments_mut().artifacts {
      let Some(from) = artifact.from.as_deref() else {
        continue;
      };
      match self.artifact(from) {
        Some(source) => artifact.location = source.location.clone(),
        None if artifact.optional => {}
        None => {
          return Err(OperatorError::validation(format!(
            "unable to resolve artifact reference {from}"
          )));
        }
      }
    }
    Ok(resolved)
  }

  /// The artifact named by a `from` expression such as
  /// `{{steps.gen.outputs.artifacts.out}}`.
  pub fn artifact(&self, expr: &str) -> Option<&Artifact> {
    self.artifacts.get(placeholder_name(expr)?)
  }
}
