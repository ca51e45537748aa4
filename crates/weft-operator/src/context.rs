use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use weft_artifact::ArtifactResolver;
use weft_config::Config;
use weft_resolver::TemplateScope;
use weft_workflow::{
  Arguments, ArtifactLocation, NodePhase, NodeStatus, NodeType, Outputs, TemplateHolder, TemplateRef, Workflow,
};

use crate::error::OperatorError;
use crate::operator::{NodeEvent, Operator};
use crate::substitute::Params;

/// State of a single reconcile of one workflow.
pub(crate) struct Operation<'a> {
  pub op: &'a Operator,
  pub wf: Workflow,
  pub config: Arc<Config>,
  pub now: DateTime<Utc>,
  /// `workflow.*` values visible to every template.
  pub globals: Params,
  pub artifacts: ArtifactResolver,
  pub default_archive: Option<ArtifactLocation>,
  /// Unfulfilled pod nodes, counted against `spec.parallelism`.
  pub active_pods: u32,
  /// Node ids of pods that currently exist.
  pub pods_seen: HashSet<String>,
  /// The workflow reached a terminal phase during this reconcile.
  pub completed_now: bool,
  /// Node phases as loaded, before this reconcile changed anything.
  pub phases_before: HashMap<String, NodePhase>,
  pub node_events: Vec<NodeEvent>,
  requeue_after: Option<Duration>,
}

/// `start` plus `seconds`, if representable.
pub(crate) fn deadline(start: DateTime<Utc>, seconds: i64) -> Option<DateTime<Utc>> {
  chrono::Duration::try_seconds(seconds).and_then(|d| start.checked_add_signed(d))
}

/// What to run and where to hang it in the node tree.
#[derive(Debug, Clone)]
pub(crate) struct NodeRequest {
  pub node_name: String,
  pub display_name: String,
  pub template: Option<String>,
  pub template_ref: Option<TemplateRef>,
  /// Scope `template` is resolved in.
  pub scope: TemplateScope,
  pub arguments: Arguments,
  /// Enclosing steps or DAG node.
  pub boundary_id: Option<String>,
  pub boundary_parallelism: Option<u32>,
  /// Part of the exit handler tree.
  pub on_exit: bool,
}

impl NodeRequest {
  pub fn holder(&self) -> TemplateHolder<'_> {
    TemplateHolder {
      template: self.template.as_deref(),
      template_ref: self.template_ref.as_ref(),
    }
  }

  /// The request for retry attempt `n`.
  pub fn attempt(&self, n: usize) -> Self {
    Self {
      node_name: format!("{}({n})", self.node_name),
      display_name: format!("{}({n})", self.display_name),
      ..self.clone()
    }
  }
}

impl<'a> Operation<'a> {
  pub fn new(op: &'a Operator, wf: Workflow, config: Arc<Config>, now: DateTime<Utc>, artifacts: ArtifactResolver) -> Self {
    Self {
      op,
      wf,
      config,
      now,
      globals: Params::new(),
      artifacts,
      default_archive: None,
      active_pods: 0,
      pods_seen: HashSet::new(),
      completed_now: false,
      phases_before: HashMap::new(),
      node_events: Vec::new(),
      requeue_after: None,
    }
  }

  /// Ask to be reconciled again after `after`; the earliest request wins.
  pub fn requeue(&mut self, after: Duration) {
    self.requeue_after = Some(match self.requeue_after {
      Some(current) => current.min(after),
      None => after,
    });
  }

  pub fn requeue_after(&self) -> Option<Duration> {
    self.requeue_after
  }

  /// Time left until `deadline`, requeueing for it. `None` once passed.
  pub fn until(&mut self, deadline: DateTime<Utc>) -> Option<Duration> {
    let left = (deadline - self.now).to_std().ok().filter(|d| !d.is_zero())?;
    self.requeue(left);
    Some(left)
  }

  pub fn node(&self, id: &str) -> Option<&NodeStatus> {
    self.wf.status.nodes.get(id)
  }

  /// A node this reconcile created or already knew about.
  pub fn get(&self, id: &str) -> Result<NodeStatus, OperatorError> {
    self.node(id).cloned().ok_or_else(|| OperatorError::Internal {
      message: format!("node {id} is missing from the status"),
    })
  }

  pub fn node_by_name(&self, name: &str) -> Option<&NodeStatus> {
    self.wf.get_node_by_name(name)
  }

  pub fn put_node(&mut self, node: NodeStatus) -> NodeStatus {
    self.wf.status.nodes.insert(node.id.clone(), node.clone());
    node
  }

  pub fn add_child(&mut self, parent_id: &str, child_id: &str) {
    if let Some(parent) = self.wf.status.nodes.get_mut(parent_id) {
      parent.add_child(child_id);
    }
  }

  /// A new node for `req`, not yet inserted.
  pub fn new_node(&self, req: &NodeRequest, node_id: &str, node_type: NodeType, phase: NodePhase) -> NodeStatus {
    let mut node = NodeStatus::new(node_id, &req.node_name, &req.display_name, node_type, phase, self.now);
    node.template_name = req.template.clone();
    node.template_ref = req.template_ref.clone();
    node.boundary_id = req.boundary_id.clone();
    node
  }

  /// The existing node moved to `phase`, or a new one created there.
  pub fn settle(
    &mut self,
    req: &NodeRequest,
    node_id: &str,
    node_type: NodeType,
    phase: NodePhase,
    message: &str,
  ) -> NodeStatus {
    let now = self.now;
    let node = match self.wf.status.nodes.get_mut(node_id) {
      Some(node) => {
        node.mark_phase(phase, Some(message), now);
        node.clone()
      }
      None => {
        let mut node = self.new_node(req, node_id, node_type, phase);
        node.message = message.to_string();
        self.put_node(node)
      }
    };
    if phase.fulfilled() {
      tracing::debug!(node = %node.name, phase = %phase, message, "node_settled");
    }
    node
  }

  /// Move an existing node to a terminal `phase`, optionally with outputs.
  pub fn finish(&mut self, node_id: &str, phase: NodePhase, message: Option<&str>, outputs: Option<Outputs>) -> NodeStatus {
    let now = self.now;
    match self.wf.status.nodes.get_mut(node_id) {
      Some(node) => {
        node.mark_phase(phase, message, now);
        if outputs.is_some() {
          node.outputs = outputs;
        }
        node.clone()
      }
      None => NodeStatus::new(node_id, node_id, node_id, NodeType::Skipped, phase, now),
    }
  }

  /// Ids of the leaf nodes through which `id` connects to what runs next.
  pub fn outbound(&self, id: &str) -> Vec<String> {
    let Some(node) = self.node(id) else {
      return Vec::new();
    };
    match node.node_type {
      NodeType::Pod | NodeType::Plugin | NodeType::Suspend | NodeType::Skipped => vec![id.to_string()],
      NodeType::Retry => match node.children.last() {
        Some(last) => self.outbound(last),
        None => vec![id.to_string()],
      },
      NodeType::Steps | NodeType::Dag => {
        if node.outbound_nodes.is_empty() {
          vec![id.to_string()]
        } else {
          node.outbound_nodes.clone()
        }
      }
      NodeType::StepGroup | NodeType::TaskGroup => {
        if node.children.is_empty() {
          vec![id.to_string()]
        } else {
          node.children.iter().flat_map(|c| self.outbound(c)).collect()
        }
      }
    }
  }

  pub fn set_outbound(&mut self, node_id: &str, outbound: Vec<String>) {
    if let Some(node) = self.wf.status.nodes.get_mut(node_id) {
      node.outbound_nodes = outbound;
    }
  }

  /// Why new work must not start, if the workflow is being stopped or has
  /// run out of time. Exit handlers keep running under `Stop` and after a
  /// workflow deadline.
  pub fn stop_reason(&self, on_exit: bool) -> Option<String> {
    if let Some(strategy) = self.wf.spec.shutdown {
      if !(on_exit && strategy.runs_exit_handler()) {
        return Some(format!("Stopped with strategy '{strategy:?}'"));
      }
      return None;
    }
    if !on_exit && self.workflow_deadline_passed() {
      return Some("Step exceeded its deadline".to_string());
    }
    None
  }

  pub fn workflow_deadline(&self) -> Option<DateTime<Utc>> {
    let seconds = self.wf.spec.active_deadline_seconds?;
    deadline(self.wf.status.started_at?, seconds)
  }

  pub fn workflow_deadline_passed(&self) -> bool {
    self.workflow_deadline().is_some_and(|deadline| self.now >= deadline)
  }

  /// Unfulfilled nodes inside `boundary_id` that occupy a parallelism slot.
  pub fn active_in_boundary(&self, boundary_id: &str) -> u32 {
    let count = self
      .wf
      .status
      .nodes
      .values()
      .filter(|n| n.boundary_id.as_deref() == Some(boundary_id))
      .filter(|n| !n.fulfilled())
      .filter(|n| !matches!(n.node_type, NodeType::Retry | NodeType::StepGroup | NodeType::TaskGroup))
      .count();
    u32::try_from(count).unwrap_or(u32::MAX)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_attempt_request_names() {
    let req = NodeRequest {
      node_name: "wf[0].flaky".into(),
      display_name: "flaky".into(),
      template: Some("flaky".into()),
      template_ref: None,
      scope: TemplateScope::Workflow,
      arguments: Arguments::default(),
      boundary_id: None,
      boundary_parallelism: None,
      on_exit: false,
    };
    let attempt = req.attempt(2);
    assert_eq!(attempt.node_name, "wf[0].flaky(2)");
    assert_eq!(attempt.display_name, "flaky(2)");
    assert_eq!(attempt.template.as_deref(), Some("flaky"));
  }
}
