//! Static checks run before a workflow is first reconciled.

use std::collections::HashSet;

use crate::error::WorkflowError;
use crate::graph::DagGraph;
use crate::template::{Template, TemplateHolder, TemplateKind};
use crate::workflow::Workflow;

const TEMPLATE_KINDS: [&str; 6] = ["container", "script", "resource", "steps", "dag", "suspend"];

/// Decode a workflow, rejecting templates with zero or several kinds.
pub fn workflow_from_value(value: serde_json::Value) -> Result<Workflow, WorkflowError> {
  if let Some(templates) = value.pointer("/spec/templates").and_then(|t| t.as_array()) {
    for template in templates {
      let name = template.get("name").and_then(|n| n.as_str()).unwrap_or("<unnamed>");
      let kinds = TEMPLATE_KINDS
        .iter()
        .filter(|k| template.get(**k).is_some_and(|v| !v.is_null()))
        .count();
      if kinds != 1 {
        return Err(WorkflowError::validation(format!(
          "template '{name}' must define exactly one of {}, found {kinds}",
          TEMPLATE_KINDS.join(", ")
        )));
      }
    }
  }
  Ok(serde_json::from_value(value)?)
}

/// Validate the workflow's own templates. References into workflow templates
/// are checked when they are resolved.
pub fn validate_workflow(wf: &Workflow) -> Result<(), WorkflowError> {
  if wf.metadata.name.is_empty() {
    return Err(WorkflowError::validation("workflow name is required"));
  }
  if wf.spec.entrypoint.is_empty() {
    return Err(WorkflowError::validation("spec.entrypoint is required"));
  }

  let mut names = HashSet::new();
  for template in &wf.spec.templates {
    if template.name.is_empty() {
      return Err(WorkflowError::validation("template name is required"));
    }
    if !names.insert(template.name.as_str()) {
      return Err(WorkflowError::validation(format!(
        "template name '{}' is not unique",
        template.name
      )));
    }
  }

  if wf.get_template(&wf.spec.entrypoint).is_none() {
    return Err(WorkflowError::TemplateNotFound(wf.spec.entrypoint.clone()));
  }
  if let Some(on_exit) = wf.spec.on_exit.as_deref()
    && wf.get_template(on_exit).is_none()
  {
    return Err(WorkflowError::TemplateNotFound(on_exit.to_string()));
  }
  if let Some(sync) = &wf.spec.synchronization {
    sync.validate()?;
  }
  if let Some(metrics) = &wf.spec.metrics {
    metrics.validate()?;
  }
  if let Some(ttl) = &wf.spec.ttl_strategy
    && [ttl.seconds_after_completion, ttl.seconds_after_success, ttl.seconds_after_failure]
      .into_iter()
      .flatten()
      .any(|s| s < 0)
  {
    return Err(WorkflowError::validation("ttlStrategy seconds must not be negative"));
  }

  for template in &wf.spec.templates {
    validate_template(wf, template)?;
  }
  Ok(())
}

fn check_holder(wf: &Workflow, scope: &str, holder: TemplateHolder<'_>) -> Result<(), WorkflowError> {
  match (holder.template, holder.template_ref) {
    (Some(_), Some(_)) => Err(WorkflowError::validation(format!(
      "{scope}: only one of template and templateRef may be set"
    ))),
    (None, None) => Err(WorkflowError::validation(format!(
      "{scope}: one of template or templateRef is required"
    ))),
    (Some(name), None) if wf.get_template(name).is_none() => Err(WorkflowError::TemplateNotFound(name.to_string())),
    _ => Ok(()),
  }
}

fn check_expansion(scope: &str, sources: [bool; 3]) -> Result<(), WorkflowError> {
  if sources.iter().filter(|s| **s).count() > 1 {
    return Err(WorkflowError::validation(format!(
      "{scope}: only one of withItems, withParam and withSequence may be set"
    )));
  }
  Ok(())
}

fn validate_template(wf: &Workflow, template: &Template) -> Result<(), WorkflowError> {
  if let Some(sync) = &template.synchronization {
    sync.validate()?;
  }
  if let Some(metrics) = &template.metrics {
    metrics.validate()?;
  }
  if let Some(retry) = &template.retry_strategy {
    retry.limit()?;
    if let Some(backoff) = &retry.backoff {
      backoff.delay(1)?;
    }
  }

  match &template.kind {
    TemplateKind::Steps(groups) => {
      let mut names = HashSet::new();
      for group in groups {
        for step in group {
          let scope = format!("templates.{}.steps.{}", template.name, step.name);
          if step.name.is_empty() {
            return Err(WorkflowError::validation(format!(
              "templates.{}: step name is required",
              template.name
            )));
          }
          if !names.insert(step.name.as_str()) {
            return Err(WorkflowError::validation(format!(
              "templates.{}: step name '{}' is not unique",
              template.name, step.name
            )));
          }
          check_holder(wf, &scope, step.template_holder())?;
          check_expansion(
            &scope,
            [
              step.with_items.is_some(),
              step.with_param.is_some(),
              step.with_sequence.is_some(),
            ],
          )?;
        }
      }
    }
    TemplateKind::Dag(dag) => {
      let mut names = HashSet::new();
      for task in &dag.tasks {
        let scope = format!("templates.{}.tasks.{}", template.name, task.name);
        if task.name.is_empty() {
          return Err(WorkflowError::validation(format!(
            "templates.{}: task name is required",
            template.name
          )));
        }
        if !names.insert(task.name.as_str()) {
          return Err(WorkflowError::validation(format!(
            "templates.{}: task name '{}' is not unique",
            template.name, task.name
          )));
        }
        check_holder(wf, &scope, task.template_holder())?;
        check_expansion(
          &scope,
          [
            task.with_items.is_some(),
            task.with_param.is_some(),
            task.with_sequence.is_some(),
          ],
        )?;
      }
      DagGraph::new(&template.name, dag)?.detect_cycle(&template.name)?;
    }
    TemplateKind::Suspend(suspend) => {
      suspend.duration()?;
    }
    TemplateKind::Container(c) if c.image.is_empty() => {
      return Err(WorkflowError::validation(format!(
        "templates.{}.container.image is required",
        template.name
      )));
    }
    TemplateKind::Script(s) if s.image.is_empty() => {
      return Err(WorkflowError::validation(format!(
        "templates.{}.script.image is required",
        template.name
      )));
    }
    _ => {}
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn workflow(templates: serde_json::Value) -> serde_json::Value {
    json!({
      "metadata": { "name": "wf", "namespace": "default" },
      "spec": { "entrypoint": "main", "templates": templates }
    })
  }

  #[test]
  fn test_valid_dag() {
    let wf = workflow_from_value(workflow(json!([
      { "name": "main", "dag": { "tasks": [
        { "name": "a", "template": "echo" },
        { "name": "b", "template": "echo", "dependencies": ["a"] }
      ]}},
      { "name": "echo", "container": { "image": "alpine" } }
    ])))
    .unwrap();
    assert!(validate_workflow(&wf).is_ok());
  }

  #[test]
  fn test_rejects_bad_metrics_and_ttl() {
    let mut value = workflow(json!([
      { "name": "main", "container": { "image": "a" }, "metrics": { "prometheus": [
        { "name": "bad-name", "help": "h", "counter": { "value": "1" } }
      ] } }
    ]));
    assert!(workflow_from_value(value.clone()).is_err());

    value["spec"]["templates"][0]["metrics"]["prometheus"][0]["name"] = json!("good_name");
    assert!(workflow_from_value(value.clone()).is_ok());

    value["spec"]["ttlStrategy"] = json!({ "secondsAfterSuccess": -1 });
    assert!(workflow_from_value(value).is_err());
  }

  #[test]
  fn test_rejects_template_with_two_kinds() {
    let err = workflow_from_value(workflow(json!([
      { "name": "main", "container": { "image": "a" }, "script": { "image": "b", "source": "x" } }
    ])))
    .unwrap_err();
    assert!(matches!(err, WorkflowError::Validation { .. }));
  }

  #[test]
  fn test_rejects_missing_entrypoint_template() {
    let wf = workflow_from_value(workflow(json!([
      { "name": "other", "container": { "image": "alpine" } }
    ])))
    .unwrap();
    assert!(matches!(
      validate_workflow(&wf),
      Err(WorkflowError::TemplateNotFound(name)) if name == "main"
    ));
  }

  #[test]
  fn test_rejects_duplicate_step_names() {
    let wf = workflow_from_value(workflow(json!([
      { "name": "main", "steps": [
        [{ "name": "a", "template": "echo" }],
        [{ "name": "a", "template": "echo" }]
      ]},
      { "name": "echo", "container": { "image": "alpine" } }
    ])))
    .unwrap();
    assert!(validate_workflow(&wf).is_err());
  }

  #[test]
  fn test_rejects_dag_cycle() {
    let wf = workflow_from_value(workflow(json!([
      { "name": "main", "dag": { "tasks": [
        { "name": "a", "template": "echo", "dependencies": ["b"] },
        { "name": "b", "template": "echo", "dependencies": ["a"] }
      ]}},
      { "name": "echo", "container": { "image": "alpine" } }
    ])))
    .unwrap();
    assert!(matches!(
      validate_workflow(&wf),
      Err(WorkflowError::CycleDetected { .. })
    ));
  }
}
