//! Executing one template: resolution, input binding, template-level locks,
//! parallelism and dispatch by template kind.

use futures::future::{BoxFuture, FutureExt};
use tracing::debug;
use weft_resolver::TemplateScope;
use weft_workflow::{
  Arguments, NodePhase, NodeStatus, NodeSynchronizationStatus, NodeType, SuspendTemplate, Template, TemplateKind,
};

use crate::context::{NodeRequest, Operation, deadline};
use crate::error::OperatorError;
use crate::substitute::{TEMPLATE_REQUIRED, substitute, substitute_str};

pub(crate) const DEADLINE_EXCEEDED: &str = "Step exceeded its deadline";

fn node_type_for(template: &Template) -> NodeType {
  match template.kind {
    TemplateKind::Steps(_) => NodeType::Steps,
    TemplateKind::Dag(_) => NodeType::Dag,
    TemplateKind::Suspend(_) => NodeType::Suspend,
    TemplateKind::Container(_) | TemplateKind::Script(_) | TemplateKind::Resource(_) => NodeType::Pod,
  }
}

impl Operation<'_> {
  /// Advance the node `req` names and return its current status.
  ///
  /// Boxed because steps and DAG templates recurse into their children.
  pub(crate) fn execute_template(&mut self, req: NodeRequest) -> BoxFuture<'_, Result<NodeStatus, OperatorError>> {
    async move { self.run_template(req).await }.boxed()
  }

  async fn run_template(&mut self, req: NodeRequest) -> Result<NodeStatus, OperatorError> {
    let node_id = self.wf.node_id(&req.node_name);
    let existing = self.node(&node_id).cloned();
    if let Some(node) = &existing
      && node.fulfilled()
    {
      return Ok(node.clone());
    }

    let resolved = match self.op.resolver.resolve(&self.wf, req.holder(), &req.scope).await {
      Ok(resolved) => resolved,
      Err(e) if e.is_transient() => return Err(e.into()),
      Err(e) => {
        return Ok(self.settle(&req, &node_id, NodeType::Skipped, NodePhase::Failed, &e.to_string()));
      }
    };
    resolved.store_into(&mut self.wf);
    let inner_scope = resolved.scope;
    let mut template = resolved.template;
    if template.retry_strategy.is_none() && template.is_pod() {
      template.retry_strategy = self.wf.spec.retry_strategy.clone();
    }

    let template = match self.bind_inputs(&template, &req.arguments) {
      Ok(template) => template,
      Err(e) if e.is_node_failure() => {
        return Ok(self.settle(&req, &node_id, node_type_for(&template), NodePhase::Failed, &e.to_string()));
      }
      Err(e) => return Err(e),
    };

    if let Some(node) = &existing
      && self.template_deadline_passed(&template, node)
    {
      self.fail_subtree(&node_id, DEADLINE_EXCEEDED).await?;
      return Ok(self.finish(&node_id, NodePhase::Failed, Some(DEADLINE_EXCEEDED), None));
    }

    if let Some(sync) = template.synchronization.as_ref() {
      let outcome = match self.op.sync.try_acquire(&mut self.wf, Some(&node_id), sync).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_transient() => return Err(e.into()),
        Err(e) => {
          return Ok(self.settle(&req, &node_id, node_type_for(&template), NodePhase::Failed, &e.to_string()));
        }
      };
      if !outcome.acquired {
        let mut node = existing.unwrap_or_else(|| self.new_node(&req, &node_id, node_type_for(&template), NodePhase::Pending));
        node.message = outcome.message;
        node.synchronization_status = Some(NodeSynchronizationStatus {
          waiting: outcome.blocking_lock.unwrap_or_default(),
        });
        debug!(node = %node.name, waiting = ?node.synchronization_status, "node_waiting_for_lock");
        return Ok(self.put_node(node));
      }
      if let Some(node) = self.wf.status.nodes.get_mut(&node_id)
        && node.synchronization_status.take().is_some()
      {
        node.message.clear();
      }
    }

    if existing.is_none() {
      self.check_parallelism(&template, &req)?;
    }

    let node = if template.retry_strategy.is_some() {
      self.execute_retry(&req, &node_id, &template, &inner_scope).await?
    } else {
      let existing = self.node(&node_id).cloned();
      self.dispatch(&req, &node_id, existing, &template, &inner_scope).await?
    };

    if node.fulfilled()
      && let Some(sync) = template.synchronization.as_ref()
      && let Err(e) = self.op.sync.release(&mut self.wf, Some(&node_id), sync).await
    {
      tracing::warn!(node = %node.name, error = %e, "lock_release_failed");
    }
    Ok(node)
  }

  /// Run `template` as the node `node_id`.
  pub(crate) async fn dispatch(
    &mut self,
    req: &NodeRequest,
    node_id: &str,
    existing: Option<NodeStatus>,
    template: &Template,
    scope: &TemplateScope,
  ) -> Result<NodeStatus, OperatorError> {
    match &template.kind {
      TemplateKind::Container(_) | TemplateKind::Script(_) | TemplateKind::Resource(_) => {
        self.execute_pod(req, node_id, existing, template).await
      }
      TemplateKind::Suspend(suspend) => Ok(self.execute_suspend(req, node_id, existing, suspend)),
      TemplateKind::Steps(groups) => self.execute_steps(req, node_id, existing, template, groups, scope).await,
      TemplateKind::Dag(dag) => self.execute_dag(req, node_id, existing, template, dag, scope).await,
    }
  }

  /// Bind arguments to the template's inputs and expand `{{inputs...}}`
  /// and the workflow globals throughout the template.
  fn bind_inputs(&self, template: &Template, args: &Arguments) -> Result<Template, OperatorError> {
    let mut bound = template.clone();
    let mut params = self.globals.clone();

    for param in &mut bound.inputs.parameters {
      let value = args
        .parameter(&param.name)
        .and_then(|arg| arg.value.clone())
        .or_else(|| param.value.clone())
        .or_else(|| param.default.clone())
        .ok_or_else(|| OperatorError::validation(format!("inputs.parameters.{} was not supplied", param.name)))?;
      let value = substitute_str(&value, &self.globals, &[])?;
      params.insert(format!("inputs.parameters.{}", param.name), value.clone());
      param.value = Some(value);
    }

    for artifact in &mut bound.inputs.artifacts {
      match args.artifact(&artifact.name).filter(|arg| arg.has_location()) {
        Some(arg) => artifact.location = arg.location.clone(),
        None if artifact.has_location() || artifact.optional => {}
        None => {
          return Err(OperatorError::validation(format!(
            "inputs.artifacts.{} was not supplied",
            artifact.name
          )));
        }
      }
      if let Some(path) = &artifact.path {
        params.insert(format!("inputs.artifacts.{}.path", artifact.name), path.clone());
      }
    }

    substitute(&bound, &params, TEMPLATE_REQUIRED)
  }

  fn template_deadline_passed(&mut self, template: &Template, node: &NodeStatus) -> bool {
    let (Some(seconds), Some(started)) = (template.active_deadline_seconds, node.started_at) else {
      return false;
    };
    match deadline(started, seconds) {
      Some(at) => self.until(at).is_none(),
      None => false,
    }
  }

  /// Fail every unfulfilled node under `node_id`, terminating their pods.
  pub(crate) async fn fail_subtree(&mut self, node_id: &str, message: &str) -> Result<(), OperatorError> {
    let mut stack = vec![node_id.to_string()];
    let mut visited = std::collections::HashSet::new();
    let mut doomed = Vec::new();
    while let Some(id) = stack.pop() {
      if !visited.insert(id.clone()) {
        continue;
      }
      let Some(node) = self.node(&id) else {
        continue;
      };
      stack.extend(node.children.iter().cloned());
      stack.extend(
        self
          .wf
          .status
          .nodes
          .values()
          .filter(|n| n.boundary_id.as_deref() == Some(id.as_str()))
          .map(|n| n.id.clone()),
      );
      if !node.fulfilled() {
        doomed.push(id);
      }
    }

    for id in doomed {
      if self.pods_seen.contains(&id) {
        self.op.pods.terminate_pod(self.wf.namespace(), &id, message).await?;
      }
      self.finish(&id, NodePhase::Failed, Some(message), None);
    }
    Ok(())
  }

  fn check_parallelism(&self, template: &Template, req: &NodeRequest) -> Result<(), OperatorError> {
    if template.is_pod()
      && let Some(limit) = self.wf.spec.parallelism
      && self.active_pods >= limit
    {
      debug!(node = %req.node_name, limit, "workflow_parallelism_reached");
      return Err(OperatorError::ParallelismReached);
    }
    if let (Some(boundary), Some(limit)) = (req.boundary_id.as_deref(), req.boundary_parallelism)
      && self.active_in_boundary(boundary) >= limit
    {
      debug!(node = %req.node_name, boundary, limit, "template_parallelism_reached");
      return Err(OperatorError::ParallelismReached);
    }
    Ok(())
  }

  fn execute_suspend(
    &mut self,
    req: &NodeRequest,
    node_id: &str,
    existing: Option<NodeStatus>,
    suspend: &SuspendTemplate,
  ) -> NodeStatus {
    let duration = match suspend.duration() {
      Ok(duration) => duration,
      Err(e) => return self.settle(req, node_id, NodeType::Suspend, NodePhase::Failed, &e.to_string()),
    };
    let node = match existing {
      Some(node) => node,
      None => {
        if let Some(reason) = self.stop_reason(req.on_exit) {
          return self.settle(req, node_id, NodeType::Suspend, NodePhase::Failed, &reason);
        }
        let node = self.new_node(req, node_id, NodeType::Suspend, NodePhase::Running);
        self.put_node(node)
      }
    };
    let resume_at = duration
      .and_then(|d| chrono::Duration::from_std(d).ok())
      .zip(node.started_at)
      .and_then(|(d, started)| started.checked_add_signed(d));
    if let Some(resume_at) = resume_at
      && self.until(resume_at).is_none()
    {
      return self.finish(node_id, NodePhase::Succeeded, None, None);
    }
    node
  }
}
