use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactRepository, ArtifactRepositoryRef};
use crate::metrics::Metrics;
use crate::node::{NodeStatus, Nodes, fnv32a};
use crate::progress::Progress;
use crate::sync::{Synchronization, SynchronizationStatus};
use crate::template::{Arguments, Outputs, RetryStrategy, Template};

/// Label carrying the workflow phase.
pub const LABEL_PHASE: &str = "weft.dev/phase";
/// Label set to `"true"` once a workflow is fulfilled.
pub const LABEL_COMPLETED: &str = "weft.dev/completed";
/// Label linking a pod to its workflow.
pub const LABEL_WORKFLOW: &str = "weft.dev/workflow";

/// Identity and bookkeeping common to all stored objects.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub namespace: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub uid: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub resource_version: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub creation_timestamp: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub labels: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
  pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      namespace: namespace.into(),
      ..Default::default()
    }
  }

  /// `namespace/name`.
  pub fn key(&self) -> String {
    format!("{}/{}", self.namespace, self.name)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WorkflowPhase {
  #[default]
  Pending,
  Running,
  Succeeded,
  Failed,
  Error,
}

impl WorkflowPhase {
  pub const ALL: [WorkflowPhase; 5] = [
    WorkflowPhase::Pending,
    WorkflowPhase::Running,
    WorkflowPhase::Succeeded,
    WorkflowPhase::Failed,
    WorkflowPhase::Error,
  ];

  pub fn fulfilled(self) -> bool {
    matches!(
      self,
      WorkflowPhase::Succeeded | WorkflowPhase::Failed | WorkflowPhase::Error
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      WorkflowPhase::Pending => "Pending",
      WorkflowPhase::Running => "Running",
      WorkflowPhase::Succeeded => "Succeeded",
      WorkflowPhase::Failed => "Failed",
      WorkflowPhase::Error => "Error",
    }
  }
}

impl fmt::Display for WorkflowPhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// How a shutdown request treats the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownStrategy {
  /// Stop everything, exit handlers included.
  Terminate,
  /// Stop the primary graph but still run exit handlers.
  Stop,
}

impl ShutdownStrategy {
  pub fn runs_exit_handler(self) -> bool {
    matches!(self, ShutdownStrategy::Stop)
  }
}

/// How long a finished workflow is kept before it is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtlStrategy {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub seconds_after_completion: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub seconds_after_success: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub seconds_after_failure: Option<i64>,
}

impl TtlStrategy {
  /// Seconds to keep a workflow that finished in `phase`. The phase
  /// specific setting wins over `secondsAfterCompletion`.
  pub fn seconds_for(&self, phase: WorkflowPhase) -> Option<i64> {
    match phase {
      WorkflowPhase::Succeeded => self.seconds_after_success.or(self.seconds_after_completion),
      WorkflowPhase::Failed | WorkflowPhase::Error => self.seconds_after_failure.or(self.seconds_after_completion),
      WorkflowPhase::Pending | WorkflowPhase::Running => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub templates: Vec<Template>,
  #[serde(default)]
  pub entrypoint: String,
  #[serde(default)]
  pub arguments: Arguments,
  /// Name of the exit-handler template.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub on_exit: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub synchronization: Option<Synchronization>,
  /// Applied to pod templates that carry no strategy of their own.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub retry_strategy: Option<RetryStrategy>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub artifact_repository_ref: Option<ArtifactRepositoryRef>,
  /// Cap on concurrently running pods.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parallelism: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub active_deadline_seconds: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub shutdown: Option<ShutdownStrategy>,
  /// Higher values acquire contended locks first.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub priority: Option<i32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub suspend: Option<bool>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ttl_strategy: Option<TtlStrategy>,
  /// Emitted once the workflow finishes.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub metrics: Option<Metrics>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
  #[serde(default)]
  pub phase: WorkflowPhase,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub finished_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub message: String,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub nodes: Nodes,
  /// Set when `nodes` lives in the offload table instead of the object.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub offload_node_status_version: Option<String>,
  /// Templates resolved through references, pinned by id.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub stored_templates: BTreeMap<String, Template>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub outputs: Option<Outputs>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub synchronization: Option<SynchronizationStatus>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub progress: Option<Progress>,
  /// Repository artifacts of this workflow are written to, pinned at start.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub artifact_repository: Option<ArtifactRepository>,
}

impl WorkflowStatus {
  pub fn fulfilled(&self) -> bool {
    self.phase.fulfilled()
  }

  pub fn synchronization_mut(&mut self) -> &mut SynchronizationStatus {
    self.synchronization.get_or_insert_with(SynchronizationStatus::default)
  }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
  #[serde(default)]
  pub metadata: ObjectMeta,
  #[serde(default)]
  pub spec: WorkflowSpec,
  #[serde(default)]
  pub status: WorkflowStatus,
}

impl Workflow {
  pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: WorkflowSpec) -> Self {
    Self {
      metadata: ObjectMeta::new(namespace, name),
      spec,
      status: WorkflowStatus::default(),
    }
  }

  pub fn name(&self) -> &str {
    &self.metadata.name
  }

  pub fn namespace(&self) -> &str {
    &self.metadata.namespace
  }

  /// `namespace/name`.
  pub fn key(&self) -> String {
    self.metadata.key()
  }

  /// Deterministic node id for a display path. The root node's id is the
  /// workflow name.
  pub fn node_id(&self, node_name: &str) -> String {
    node_id(&self.metadata.name, node_name)
  }

  pub fn get_template(&self, name: &str) -> Option<&Template> {
    self.spec.templates.iter().find(|t| t.name == name)
  }

  pub fn get_node_by_name(&self, node_name: &str) -> Option<&NodeStatus> {
    self.status.nodes.get(&self.node_id(node_name))
  }

  pub fn priority(&self) -> i32 {
    self.spec.priority.unwrap_or(0)
  }

  pub fn creation_timestamp(&self) -> DateTime<Utc> {
    self.metadata.creation_timestamp.unwrap_or(DateTime::UNIX_EPOCH)
  }

  /// When a finished workflow with a TTL strategy may be deleted.
  pub fn expires_at(&self) -> Option<DateTime<Utc>> {
    let seconds = self.spec.ttl_strategy?.seconds_for(self.status.phase)?;
    let finished = self.status.finished_at?;
    finished.checked_add_signed(chrono::Duration::try_seconds(seconds.max(0))?)
  }

  pub fn parameter(&self, name: &str) -> Option<&str> {
    self
      .spec
      .arguments
      .parameter(name)
      .and_then(|p| p.value.as_deref().or(p.default.as_deref()))
  }
}

/// `{workflow}-{fnv32a(path)}`, or the workflow name for the root.
pub fn node_id(workflow_name: &str, node_name: &str) -> String {
  if node_name == workflow_name {
    return workflow_name.to_string();
  }
  format!("{workflow_name}-{}", fnv32a(node_name.as_bytes()))
}

/// A stored set of templates that workflows reference with `templateRef`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplate {
  #[serde(default)]
  pub metadata: ObjectMeta,
  #[serde(default)]
  pub spec: WorkflowSpec,
}

impl WorkflowTemplate {
  pub fn get_template(&self, name: &str) -> Option<&Template> {
    self.spec.templates.iter().find(|t| t.name == name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_root_node_id_is_workflow_name() {
    let wf = Workflow::new("default", "hello", WorkflowSpec::default());
    assert_eq!(wf.node_id("hello"), "hello");
  }

  #[test]
  fn test_child_node_id_is_stable() {
    let wf = Workflow::new("default", "hello", WorkflowSpec::default());
    let id = wf.node_id("hello[0].generate");
    assert_eq!(id, format!("hello-{}", fnv32a(b"hello[0].generate")));
    assert_eq!(id, wf.node_id("hello[0].generate"));
    assert_ne!(id, wf.node_id("hello[1].generate"));
  }

  #[test]
  fn test_ttl_picks_phase_specific_seconds() {
    let mut wf = Workflow::new(
      "default",
      "hello",
      WorkflowSpec {
        ttl_strategy: Some(TtlStrategy {
          seconds_after_completion: Some(60),
          seconds_after_failure: Some(10),
          ..Default::default()
        }),
        ..Default::default()
      },
    );
    let finished = DateTime::UNIX_EPOCH + chrono::Duration::seconds(100);
    assert_eq!(wf.expires_at(), None);

    wf.status.finished_at = Some(finished);
    wf.status.phase = WorkflowPhase::Failed;
    assert_eq!(wf.expires_at(), Some(finished + chrono::Duration::seconds(10)));
    wf.status.phase = WorkflowPhase::Succeeded;
    assert_eq!(wf.expires_at(), Some(finished + chrono::Duration::seconds(60)));
    wf.status.phase = WorkflowPhase::Running;
    assert_eq!(wf.expires_at(), None);
  }

  #[test]
  fn test_ttl_overflow_never_expires() {
    let mut wf = Workflow::new(
      "default",
      "hello",
      WorkflowSpec {
        ttl_strategy: Some(TtlStrategy {
          seconds_after_completion: Some(i64::MAX),
          ..Default::default()
        }),
        ..Default::default()
      },
    );
    wf.status.phase = WorkflowPhase::Succeeded;
    wf.status.finished_at = Some(Utc::now());
    assert_eq!(wf.expires_at(), None);
  }

  #[test]
  fn test_workflow_serde_round_trip() {
    let yaml = r#"
metadata:
  name: steps
  namespace: default
  labels:
    env: prod
spec:
  entrypoint: main
  arguments:
    parameters:
      - name: message
        value: hi
  templates:
    - name: main
      steps:
        - - name: a
            template: echo
    - name: echo
      container:
        image: alpine
        command: [echo, "{{workflow.parameters.message}}"]
"#;
    let wf: Workflow = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(wf.parameter("message"), Some("hi"));
    assert!(wf.get_template("echo").is_some_and(|t| t.is_pod()));

    let json = serde_json::to_string(&wf).unwrap();
    let back: Workflow = serde_json::from_str(&json).unwrap();
    assert_eq!(back, wf);
  }
}
