//! Steps templates: sequential groups of parallel steps.

use weft_resolver::TemplateScope;
use weft_workflow::{ContinueOn, NodePhase, NodeStatus, NodeType, Outputs, Template, WorkflowStep};

use crate::context::{NodeRequest, Operation};
use crate::error::OperatorError;
use crate::expand::expand;
use crate::scope::Scope;
use crate::substitute::resolve_expression;

pub(crate) const SKIPPED_EMPTY: &str = "Skipped, empty params";

impl Operation<'_> {
  pub(crate) async fn execute_steps(
    &mut self,
    req: &NodeRequest,
    node_id: &str,
    existing: Option<NodeStatus>,
    template: &Template,
    groups: &[Vec<WorkflowStep>],
    scope: &TemplateScope,
  ) -> Result<NodeStatus, OperatorError> {
    if existing.is_none() {
      let node = self.new_node(req, node_id, NodeType::Steps, NodePhase::Running);
      self.put_node(node);
    }

    let mut values = Scope::new(&self.globals);
    let mut previous: Option<String> = None;
    for (i, group) in groups.iter().enumerate() {
      let group_name = format!("{}[{i}]", req.node_name);
      let group_id = self.wf.node_id(&group_name);
      if self.node(&group_id).is_none() {
        let mut node = NodeStatus::new(&group_id, &group_name, format!("[{i}]"), NodeType::StepGroup, NodePhase::Running, self.now);
        node.boundary_id = Some(node_id.to_string());
        self.put_node(node);
        match &previous {
          None => self.add_child(node_id, &group_id),
          Some(previous) => {
            for outbound in self.outbound(previous) {
              self.add_child(&outbound, &group_id);
            }
          }
        }
      }

      let group_node = self
        .execute_step_group(req, node_id, template, &group_name, &group_id, group, &values, scope)
        .await?;
      if !group_node.fulfilled() {
        return self.get(node_id);
      }
      if !group_node.successful() {
        let outbound = self.outbound(&group_id);
        self.set_outbound(node_id, outbound);
        return Ok(self.finish(node_id, group_node.phase, Some(&group_node.message), None));
      }
      for step in group {
        self.expose_step(&mut values, &group_name, &group_id, step);
      }
      previous = Some(group_id);
    }

    if let Some(last) = &previous {
      let outbound = self.outbound(last);
      self.set_outbound(node_id, outbound);
    }
    match template_outputs(template, &values) {
      Ok(outputs) => Ok(self.finish(node_id, NodePhase::Succeeded, None, outputs)),
      Err(e) => Ok(self.finish(node_id, NodePhase::Failed, Some(&e.to_string()), None)),
    }
  }

  #[allow(clippy::too_many_arguments)]
  async fn execute_step_group(
    &mut self,
    req: &NodeRequest,
    steps_id: &str,
    template: &Template,
    group_name: &str,
    group_id: &str,
    group: &[WorkflowStep],
    values: &Scope,
    scope: &TemplateScope,
  ) -> Result<NodeStatus, OperatorError> {
    if let Some(node) = self.node(group_id)
      && node.fulfilled()
    {
      return Ok(node.clone());
    }

    let mut children: Vec<WorkflowStep> = Vec::new();
    for step in group {
      let expanded = match values.resolve(step).and_then(|s| expand(&s)) {
        Ok(expanded) => expanded,
        Err(e) if e.is_node_failure() => {
          return Ok(self.finish(group_id, NodePhase::Failed, Some(&e.to_string()), None));
        }
        Err(e) => return Err(e),
      };
      if step.is_expanded() && expanded.is_empty() {
        let name = format!("{group_name}.{}", step.name);
        let id = self.wf.node_id(&name);
        if self.node(&id).is_none() {
          let mut node = NodeStatus::new(&id, &name, &step.name, NodeType::Skipped, NodePhase::Skipped, self.now);
          node.message = SKIPPED_EMPTY.to_string();
          node.boundary_id = Some(steps_id.to_string());
          self.put_node(node);
          self.add_child(group_id, &id);
        }
        continue;
      }
      children.extend(expanded);
    }

    for child in &children {
      let child_req = NodeRequest {
        node_name: format!("{group_name}.{}", child.name),
        display_name: child.name.clone(),
        template: child.template.clone(),
        template_ref: child.template_ref.clone(),
        scope: scope.clone(),
        arguments: child.arguments.clone(),
        boundary_id: Some(steps_id.to_string()),
        boundary_parallelism: template.parallelism,
        on_exit: req.on_exit,
      };
      match self.execute_template(child_req).await {
        Ok(node) => self.add_child(group_id, &node.id),
        Err(OperatorError::ParallelismReached) => break,
        Err(e) => return Err(e),
      }
    }

    let mut failure: Option<NodeStatus> = None;
    for child in &children {
      let Some(node) = self.node_by_name(&format!("{group_name}.{}", child.name)) else {
        return self.get(group_id);
      };
      if !node.fulfilled() {
        return self.get(group_id);
      }
      if !node.successful() && !ContinueOn::continues(child.continue_on.as_ref(), node.phase) && failure.is_none() {
        failure = Some(node.clone());
      }
    }
    Ok(match failure {
      Some(failed) => {
        let message = format!("child '{}' failed", failed.id);
        self.finish(group_id, failed.phase, Some(&message), None)
      }
      None => self.finish(group_id, NodePhase::Succeeded, None, None),
    })
  }

  /// Make a finished step's outputs visible to later groups.
  fn expose_step(&self, values: &mut Scope, group_name: &str, group_id: &str, step: &WorkflowStep) {
    let prefix = format!("steps.{}", step.name);
    if step.is_expanded() {
      let child_prefix = format!("{group_name}.{}(", step.name);
      let children: Vec<&NodeStatus> = self
        .node(group_id)
        .map(|g| g.children.as_slice())
        .unwrap_or_default()
        .iter()
        .filter_map(|id| self.node(id))
        .filter(|n| n.name.starts_with(&child_prefix))
        .collect();
      values.add_aggregate(&prefix, &children);
    } else if let Some(node) = self.node_by_name(&format!("{group_name}.{}", step.name)) {
      values.add_node(&prefix, node);
    }
  }
}

/// Output parameters a steps or DAG template gathers from its children.
pub(crate) fn template_outputs(template: &Template, values: &Scope) -> Result<Option<Outputs>, OperatorError> {
  if template.outputs.is_empty() {
    return Ok(None);
  }
  let mut outputs = template.outputs.clone();
  for param in &mut outputs.parameters {
    let Some(expr) = param.value_from.as_ref().and_then(|vf| vf.parameter.as_deref()) else {
      continue;
    };
    let value = match resolve_expression(expr, &values.params) {
      Some(value) => value,
      None => param
        .value_from
        .as_ref()
        .and_then(|vf| vf.default.clone())
        .ok_or_else(|| OperatorError::validation(format!("unable to resolve outputs from scope: {expr}")))?,
    };
    param.value = Some(value);
  }
  for artifact in &mut outputs.artifacts {
    let Some(from) = artifact.from.as_deref() else {
      continue;
    };
    match values.artifact(from) {
      Some(source) => artifact.location = source.location.clone(),
      None if artifact.optional => {}
      None => {
        return Err(OperatorError::validation(format!(
          "unable to resolve output artifact {from}"
        )));
      }
    }
  }
  Ok(Some(outputs))
}
