use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::progress::Progress;
use crate::template::{Inputs, Outputs, TemplateRef};

/// 32-bit FNV-1a hash.
pub fn fnv32a(data: &[u8]) -> u32 {
  const OFFSET_BASIS: u32 = 0x811c_9dc5;
  const PRIME: u32 = 0x0100_0193;
  data.iter().fold(OFFSET_BASIS, |hash, byte| {
    (hash ^ u32::from(*byte)).wrapping_mul(PRIME)
  })
}

/// Phase of a single node in the execution tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NodePhase {
  #[default]
  Pending,
  Running,
  Succeeded,
  Skipped,
  Failed,
  Error,
  Omitted,
}

impl NodePhase {
  /// The node has reached a terminal phase.
  pub fn fulfilled(self) -> bool {
    matches!(
      self,
      NodePhase::Succeeded
        | NodePhase::Failed
        | NodePhase::Error
        | NodePhase::Skipped
        | NodePhase::Omitted
    )
  }

  /// Terminal and not a failure.
  pub fn successful(self) -> bool {
    matches!(
      self,
      NodePhase::Succeeded | NodePhase::Skipped | NodePhase::Omitted
    )
  }

  pub fn failed_or_errored(self) -> bool {
    matches!(self, NodePhase::Failed | NodePhase::Error)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      NodePhase::Pending => "Pending",
      NodePhase::Running => "Running",
      NodePhase::Succeeded => "Succeeded",
      NodePhase::Skipped => "Skipped",
      NodePhase::Failed => "Failed",
      NodePhase::Error => "Error",
      NodePhase::Omitted => "Omitted",
    }
  }
}

impl fmt::Display for NodePhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Kind of vertex in the execution tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
  Pod,
  Steps,
  StepGroup,
  #[serde(rename = "DAG")]
  Dag,
  TaskGroup,
  Retry,
  Skipped,
  Suspend,
  /// Leaf run by a template executor instead of a pod.
  Plugin,
}

impl NodeType {
  /// Nodes that do work themselves and count towards progress.
  pub fn is_leaf_work(self) -> bool {
    matches!(self, NodeType::Pod | NodeType::Plugin)
  }
}

/// Waiting-lock bookkeeping carried on a node that requested a template-level
/// lock.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeSynchronizationStatus {
  /// Lock key the node is waiting on.
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub waiting: String,
}

/// One vertex of the execution tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
  pub id: String,
  /// Fully-qualified display path, the input to the node id hash.
  pub name: String,
  pub display_name: String,
  #[serde(rename = "type")]
  pub node_type: NodeType,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub template_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub template_ref: Option<TemplateRef>,
  #[serde(default)]
  pub phase: NodePhase,
  #[serde(default, rename = "boundaryID", skip_serializing_if = "Option::is_none")]
  pub boundary_id: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub children: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub outbound_nodes: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub inputs: Option<Inputs>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub outputs: Option<Outputs>,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub finished_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub progress: Option<Progress>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub host_node_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub synchronization_status: Option<NodeSynchronizationStatus>,
}

impl NodeStatus {
  /// A fresh node in `phase`, timestamped at `now`.
  pub fn new(
    id: impl Into<String>,
    name: impl Into<String>,
    display_name: impl Into<String>,
    node_type: NodeType,
    phase: NodePhase,
    now: DateTime<Utc>,
  ) -> Self {
    let finished_at = phase.fulfilled().then_some(now);
    Self {
      id: id.into(),
      name: name.into(),
      display_name: display_name.into(),
      node_type,
      template_name: None,
      template_ref: None,
      phase,
      boundary_id: None,
      children: Vec::new(),
      outbound_nodes: Vec::new(),
      inputs: None,
      outputs: None,
      message: String::new(),
      started_at: Some(now),
      finished_at,
      progress: None,
      host_node_name: None,
      synchronization_status: None,
    }
  }

  pub fn fulfilled(&self) -> bool {
    self.phase.fulfilled()
  }

  pub fn successful(&self) -> bool {
    self.phase.successful()
  }

  /// Leaf nodes that correspond to a pod.
  pub fn is_pod(&self) -> bool {
    self.node_type == NodeType::Pod
  }

  /// Move to `phase`, stamping `finished_at` the first time a terminal phase
  /// is reached. Returns whether anything changed.
  pub fn mark_phase(&mut self, phase: NodePhase, message: Option<&str>, now: DateTime<Utc>) -> bool {
    let mut changed = false;
    if self.phase != phase {
      self.phase = phase;
      changed = true;
    }
    if let Some(message) = message
      && self.message != message
    {
      self.message = message.to_string();
      changed = true;
    }
    if phase.fulfilled() && self.finished_at.is_none() {
      self.finished_at = Some(now);
      changed = true;
    }
    changed
  }

  pub fn add_child(&mut self, child_id: &str) {
    if !self.children.iter().any(|c| c == child_id) {
      self.children.push(child_id.to_string());
    }
  }

  /// Output parameter value by name.
  pub fn output_parameter(&self, name: &str) -> Option<&str> {
    self
      .outputs
      .as_ref()?
      .parameters
      .iter()
      .find(|p| p.name == name)
      .and_then(|p| p.value.as_deref())
  }
}

/// The node map of a workflow, keyed by node id.
///
/// A `BTreeMap` keeps iteration (and therefore JSON encoding) in a stable
/// order, which the offload version tag depends on.
pub type Nodes = BTreeMap<String, NodeStatus>;

/// Find a node by its display path.
pub fn find_by_name<'a>(nodes: &'a Nodes, name: &str) -> Option<&'a NodeStatus> {
  nodes.values().find(|n| n.name == name)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fnv32a_known_vectors() {
    assert_eq!(fnv32a(b""), 0x811c9dc5);
    assert_eq!(fnv32a(b"a"), 0xe40c292c);
    assert_eq!(fnv32a(b"foobar"), 0xbf9cf968);
  }

  #[test]
  fn test_mark_phase_stamps_finish_once() {
    let start = Utc::now();
    let mut node = NodeStatus::new("wf", "wf", "wf", NodeType::Pod, NodePhase::Running, start);
    assert!(node.finished_at.is_none());

    let end = start + chrono::Duration::seconds(5);
    assert!(node.mark_phase(NodePhase::Succeeded, None, end));
    assert_eq!(node.finished_at, Some(end));

    let later = end + chrono::Duration::seconds(5);
    assert!(!node.mark_phase(NodePhase::Succeeded, None, later));
    assert_eq!(node.finished_at, Some(end));
  }

  #[test]
  fn test_phase_classification() {
    assert!(NodePhase::Skipped.fulfilled());
    assert!(NodePhase::Skipped.successful());
    assert!(!NodePhase::Running.fulfilled());
    assert!(NodePhase::Error.failed_or_errored());
    assert!(!NodePhase::Omitted.failed_or_errored());
  }

  #[test]
  fn test_node_type_serializes_dag_uppercase() {
    let json = serde_json::to_string(&NodeType::Dag).unwrap();
    assert_eq!(json, "\"DAG\"");
  }
}
