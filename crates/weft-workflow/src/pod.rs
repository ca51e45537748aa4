//! The pod view the operator observes and the pod specs it submits.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactLocation;
use crate::template::{Outputs, Template};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PodPhase {
  #[default]
  Pending,
  Running,
  Succeeded,
  Failed,
  Unknown,
}

impl PodPhase {
  pub const ALL: [PodPhase; 5] = [
    PodPhase::Pending,
    PodPhase::Running,
    PodPhase::Succeeded,
    PodPhase::Failed,
    PodPhase::Unknown,
  ];

  pub fn fulfilled(self) -> bool {
    matches!(self, PodPhase::Succeeded | PodPhase::Failed)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      PodPhase::Pending => "Pending",
      PodPhase::Running => "Running",
      PodPhase::Succeeded => "Succeeded",
      PodPhase::Failed => "Failed",
      PodPhase::Unknown => "Unknown",
    }
  }
}

/// What the operator asks the scheduler to run for a leaf node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
  pub name: String,
  pub namespace: String,
  pub node_id: String,
  /// The template with inputs bound and placeholders expanded.
  pub template: Template,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub labels: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub annotations: BTreeMap<String, String>,
  /// Where the executor uploads output artifacts and logs.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub archive_location: Option<ArtifactLocation>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub active_deadline_seconds: Option<i64>,
}

/// Observed state of a pod.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
  #[serde(default)]
  pub phase: PodPhase,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub host_node_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub exit_code: Option<i32>,
  /// Raw termination message of the main container; see [`TerminationMessage`].
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub termination_message: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
  pub spec: PodSpec,
  #[serde(default)]
  pub status: PodStatus,
}

impl Pod {
  pub fn new(spec: PodSpec) -> Self {
    Self {
      spec,
      status: PodStatus::default(),
    }
  }

  pub fn name(&self) -> &str {
    &self.spec.name
  }

  pub fn node_id(&self) -> &str {
    &self.spec.node_id
  }
}

/// Message and outputs a finished container reports through its termination
/// message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TerminationMessage {
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub outputs: Option<Outputs>,
}

impl TerminationMessage {
  pub fn mux(message: &str, outputs: Option<&Outputs>) -> String {
    let muxed = TerminationMessage {
      message: message.to_string(),
      outputs: outputs.cloned(),
    };
    serde_json::to_string(&muxed).unwrap_or_else(|_| message.to_string())
  }

  /// Split a termination message. Anything that is not a muxed message is
  /// the message itself with no outputs.
  pub fn demux(raw: &str) -> (String, Option<Outputs>) {
    match serde_json::from_str::<TerminationMessage>(raw) {
      Ok(TerminationMessage { message, outputs }) if raw.trim_start().starts_with('{') => (message, outputs),
      _ => (raw.to_string(), None),
    }
  }
}
