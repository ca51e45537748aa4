//! Templates and the pieces they are built from.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::artifact::ArtifactLocation;
use crate::duration::parse_duration;
use crate::error::WorkflowError;
use crate::items::{Item, Sequence};
use crate::metrics::Metrics;
use crate::node::NodePhase;
use crate::sync::Synchronization;

/// Accepts a string, number or boolean and keeps it as a string.
pub(crate) fn any_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
  D: Deserializer<'de>,
{
  let value = Option::<serde_json::Value>::deserialize(deserializer)?;
  Ok(match value {
    None | Some(serde_json::Value::Null) => None,
    Some(serde_json::Value::String(s)) => Some(s),
    Some(other) => Some(other.to_string()),
  })
}

/// A named parameter with an optional value, default or source.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
  pub name: String,
  #[serde(default, deserialize_with = "any_string", skip_serializing_if = "Option::is_none")]
  pub value: Option<String>,
  #[serde(default, deserialize_with = "any_string", skip_serializing_if = "Option::is_none")]
  pub default: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub value_from: Option<ValueFrom>,
  /// Promote this output to `workflow.outputs.parameters.<globalName>`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub global_name: Option<String>,
}

impl Parameter {
  pub fn with_value(name: impl Into<String>, value: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      value: Some(value.into()),
      ..Default::default()
    }
  }
}

/// Where an output parameter takes its value from.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueFrom {
  /// File path inside the container (read by the executor).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub path: Option<String>,
  /// A placeholder expression such as `{{steps.gen.outputs.parameters.x}}`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parameter: Option<String>,
  #[serde(default, deserialize_with = "any_string", skip_serializing_if = "Option::is_none")]
  pub default: Option<String>,
}

/// Archive strategy for an output artifact.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArchiveStrategy {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub none: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tar: Option<serde_json::Value>,
}

/// An input or output file carried between steps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub path: Option<String>,
  /// Reference to another node's artifact, e.g. `{{steps.a.outputs.artifacts.b}}`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub from: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub global_name: Option<String>,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub optional: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub archive: Option<ArchiveStrategy>,
  /// Name of a credential record to merge into the location.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub credential: Option<String>,
  #[serde(flatten)]
  pub location: Option<ArtifactLocation>,
}

impl Artifact {
  /// File name the executor uploads: `<name>.tgz` unless archiving is off.
  pub fn file_name(&self) -> String {
    match &self.archive {
      Some(ArchiveStrategy { none: Some(_), .. }) => self.name.clone(),
      _ => format!("{}.tgz", self.name),
    }
  }

  pub fn has_location(&self) -> bool {
    self.location.as_ref().is_some_and(|l| l.has_location())
  }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inputs {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub parameters: Vec<Parameter>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub artifacts: Vec<Artifact>,
}

impl Inputs {
  pub fn is_empty(&self) -> bool {
    self.parameters.is_empty() && self.artifacts.is_empty()
  }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outputs {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub parameters: Vec<Parameter>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub artifacts: Vec<Artifact>,
  /// Standard output of a script template.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub result: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub exit_code: Option<String>,
}

impl Outputs {
  pub fn is_empty(&self) -> bool {
    self.parameters.is_empty()
      && self.artifacts.is_empty()
      && self.result.is_none()
      && self.exit_code.is_none()
  }
}

/// Arguments passed to a template or workflow.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Arguments {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub parameters: Vec<Parameter>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub artifacts: Vec<Artifact>,
}

impl Arguments {
  pub fn parameter(&self, name: &str) -> Option<&Parameter> {
    self.parameters.iter().find(|p| p.name == name)
  }

  pub fn artifact(&self, name: &str) -> Option<&Artifact> {
    self.artifacts.iter().find(|a| a.name == name)
  }
}

/// Reference to a template held in a workflow template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRef {
  /// Name of the workflow template (or cluster workflow template).
  pub name: String,
  /// Template name within it.
  pub template: String,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub cluster_scope: bool,
}

/// Per-step policy for treating a failure as non-fatal downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContinueOn {
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub error: bool,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub failed: bool,
}

impl ContinueOn {
  pub fn continues(continue_on: Option<&ContinueOn>, phase: NodePhase) -> bool {
    match continue_on {
      None => false,
      Some(c) => (c.error && phase == NodePhase::Error) || (c.failed && phase == NodePhase::Failed),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetryPolicy {
  Always,
  #[default]
  OnFailure,
  OnError,
}

/// Exponential backoff between retry attempts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
  /// Base delay, e.g. `"1s"` or a bare number of seconds.
  #[serde(default, deserialize_with = "any_string", skip_serializing_if = "Option::is_none")]
  pub duration: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub factor: Option<f64>,
  #[serde(default, deserialize_with = "any_string", skip_serializing_if = "Option::is_none")]
  pub max_duration: Option<String>,
}

fn parse_seconds_or_duration(value: &str) -> Result<Duration, WorkflowError> {
  match value.parse::<u64>() {
    Ok(secs) => Ok(Duration::from_secs(secs)),
    Err(_) => parse_duration(value),
  }
}

impl Backoff {
  /// Delay before the attempt that follows `failed_attempts` failures:
  /// `min(duration * factor^(failed_attempts - 1), maxDuration)`.
  pub fn delay(&self, failed_attempts: u32) -> Result<Duration, WorkflowError> {
    let Some(base) = self.duration.as_deref() else {
      return Ok(Duration::ZERO);
    };
    let base = parse_seconds_or_duration(base)?;
    let factor = self.factor.unwrap_or(2.0);
    let exponent = failed_attempts.saturating_sub(1) as i32;
    let mut delay = base.mul_f64(factor.powi(exponent).max(0.0));
    if let Some(max) = self.max_duration.as_deref() {
      delay = delay.min(parse_seconds_or_duration(max)?);
    }
    Ok(delay)
  }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStrategy {
  /// Maximum number of retries after the first attempt. Unlimited when unset.
  #[serde(default, deserialize_with = "any_string", skip_serializing_if = "Option::is_none")]
  pub limit: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub retry_policy: Option<RetryPolicy>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub backoff: Option<Backoff>,
}

impl RetryStrategy {
  pub fn limit(&self) -> Result<Option<u32>, WorkflowError> {
    self
      .limit
      .as_deref()
      .map(|l| {
        l.trim()
          .parse::<u32>()
          .map_err(|_| WorkflowError::validation(format!("invalid retry limit '{l}'")))
      })
      .transpose()
  }

  pub fn policy(&self) -> RetryPolicy {
    self.retry_policy.unwrap_or_default()
  }

  /// Whether an attempt that ended in `phase` is eligible for a retry.
  pub fn should_retry(&self, phase: NodePhase) -> bool {
    match self.policy() {
      RetryPolicy::Always => phase.failed_or_errored(),
      RetryPolicy::OnFailure => phase == NodePhase::Failed,
      RetryPolicy::OnError => phase == NodePhase::Error,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
  pub name: String,
  #[serde(default)]
  pub value: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerTemplate {
  pub image: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub command: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub args: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub env: Vec<EnvVar>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub working_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptTemplate {
  pub image: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub command: Vec<String>,
  pub source: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
  /// `get`, `create`, `apply`, `delete`, `replace` or `patch`.
  pub action: String,
  #[serde(default)]
  pub manifest: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub success_condition: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub failure_condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SuspendTemplate {
  /// Resume automatically after this long (`"30s"`, or seconds).
  #[serde(default, deserialize_with = "any_string", skip_serializing_if = "Option::is_none")]
  pub duration: Option<String>,
}

impl SuspendTemplate {
  pub fn duration(&self) -> Result<Option<Duration>, WorkflowError> {
    self
      .duration
      .as_deref()
      .map(parse_seconds_or_duration)
      .transpose()
  }
}

/// Fields common to steps and DAG tasks that invoke another template.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub template: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub template_ref: Option<TemplateRef>,
  #[serde(default)]
  pub arguments: Arguments,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub with_items: Option<Vec<Item>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub with_param: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub with_sequence: Option<Sequence>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub continue_on: Option<ContinueOn>,
}

impl WorkflowStep {
  pub fn is_expanded(&self) -> bool {
    self.with_items.is_some() || self.with_param.is_some() || self.with_sequence.is_some()
  }

  pub fn template_holder(&self) -> TemplateHolder<'_> {
    TemplateHolder {
      template: self.template.as_deref(),
      template_ref: self.template_ref.as_ref(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagTask {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub template: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub template_ref: Option<TemplateRef>,
  #[serde(default)]
  pub arguments: Arguments,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub dependencies: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub with_items: Option<Vec<Item>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub with_param: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub with_sequence: Option<Sequence>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub continue_on: Option<ContinueOn>,
}

impl DagTask {
  pub fn is_expanded(&self) -> bool {
    self.with_items.is_some() || self.with_param.is_some() || self.with_sequence.is_some()
  }

  pub fn template_holder(&self) -> TemplateHolder<'_> {
    TemplateHolder {
      template: self.template.as_deref(),
      template_ref: self.template_ref.as_ref(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagTemplate {
  pub tasks: Vec<DagTask>,
  /// Stop scheduling new tasks after the first failure. Defaults to true.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub fail_fast: Option<bool>,
}

impl DagTemplate {
  pub fn fail_fast(&self) -> bool {
    self.fail_fast.unwrap_or(true)
  }

  pub fn task(&self, name: &str) -> Option<&DagTask> {
    self.tasks.iter().find(|t| t.name == name)
  }
}

/// What a template runs. Exactly one variant per template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TemplateKind {
  Container(ContainerTemplate),
  Script(ScriptTemplate),
  Resource(ResourceTemplate),
  Steps(Vec<Vec<WorkflowStep>>),
  Dag(DagTemplate),
  Suspend(SuspendTemplate),
}

impl TemplateKind {
  pub fn name(&self) -> &'static str {
    match self {
      TemplateKind::Container(_) => "container",
      TemplateKind::Script(_) => "script",
      TemplateKind::Resource(_) => "resource",
      TemplateKind::Steps(_) => "steps",
      TemplateKind::Dag(_) => "dag",
      TemplateKind::Suspend(_) => "suspend",
    }
  }

  /// Templates that are realised as a pod.
  pub fn is_pod(&self) -> bool {
    matches!(
      self,
      TemplateKind::Container(_) | TemplateKind::Script(_) | TemplateKind::Resource(_)
    )
  }
}

/// Pod metadata applied to the pods a template creates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TemplateMetadata {
  #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
  pub labels: std::collections::BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
  pub annotations: std::collections::BTreeMap<String, String>,
}

/// A reusable execution unit identified by name within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
  pub name: String,
  #[serde(default, skip_serializing_if = "Inputs::is_empty")]
  pub inputs: Inputs,
  #[serde(default, skip_serializing_if = "Outputs::is_empty")]
  pub outputs: Outputs,
  #[serde(flatten)]
  pub kind: TemplateKind,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub retry_strategy: Option<RetryStrategy>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub synchronization: Option<Synchronization>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub archive_location: Option<ArtifactLocation>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub active_deadline_seconds: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parallelism: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub metadata: Option<TemplateMetadata>,
  /// Emitted each time a node of this template finishes.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub metrics: Option<Metrics>,
}

impl Template {
  pub fn new(name: impl Into<String>, kind: TemplateKind) -> Self {
    Self {
      name: name.into(),
      inputs: Inputs::default(),
      outputs: Outputs::default(),
      kind,
      retry_strategy: None,
      synchronization: None,
      archive_location: None,
      active_deadline_seconds: None,
      parallelism: None,
      metadata: None,
      metrics: None,
    }
  }

  pub fn is_pod(&self) -> bool {
    self.kind.is_pod()
  }

  pub fn is_leaf(&self) -> bool {
    self.is_pod() || matches!(self.kind, TemplateKind::Suspend(_))
  }
}

/// Either a local template name or a reference into a workflow template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateHolder<'a> {
  pub template: Option<&'a str>,
  pub template_ref: Option<&'a TemplateRef>,
}

impl<'a> TemplateHolder<'a> {
  pub fn local(name: &'a str) -> Self {
    Self {
      template: Some(name),
      template_ref: None,
    }
  }

  pub fn describe(&self) -> String {
    match (self.template, self.template_ref) {
      (_, Some(r)) => format!("{}/{}", r.name, r.template),
      (Some(t), None) => t.to_string(),
      (None, None) => "<none>".to_string(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_template_kind_flattened() {
    let json = serde_json::json!({
      "name": "hello",
      "container": { "image": "alpine", "command": ["echo", "hello"] }
    });
    let template: Template = serde_json::from_value(json.clone()).unwrap();
    assert_eq!(template.name, "hello");
    assert!(matches!(template.kind, TemplateKind::Container(ref c) if c.image == "alpine"));
    assert_eq!(serde_json::to_value(&template).unwrap(), json);
  }

  #[test]
  fn test_steps_template_parses_groups() {
    let json = serde_json::json!({
      "name": "main",
      "steps": [
        [{ "name": "a", "template": "hello" }],
        [{ "name": "b", "template": "hello" }, { "name": "c", "template": "hello" }]
      ]
    });
    let template: Template = serde_json::from_value(json).unwrap();
    match template.kind {
      TemplateKind::Steps(groups) => {
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1].len(), 2);
      }
      other => panic!("unexpected kind {}", other.name()),
    }
  }

  #[test]
  fn test_parameter_value_accepts_numbers() {
    let p: Parameter = serde_json::from_value(serde_json::json!({"name": "n", "value": 3})).unwrap();
    assert_eq!(p.value.as_deref(), Some("3"));
  }

  #[test]
  fn test_continue_on() {
    let c = ContinueOn {
      error: false,
      failed: true,
    };
    assert!(ContinueOn::continues(Some(&c), NodePhase::Failed));
    assert!(!ContinueOn::continues(Some(&c), NodePhase::Error));
    assert!(!ContinueOn::continues(None, NodePhase::Failed));
  }

  #[test]
  fn test_backoff_is_capped() {
    let backoff = Backoff {
      duration: Some("1s".into()),
      factor: Some(2.0),
      max_duration: Some("10s".into()),
    };
    assert_eq!(backoff.delay(1).unwrap(), Duration::from_secs(1));
    assert_eq!(backoff.delay(2).unwrap(), Duration::from_secs(2));
    assert_eq!(backoff.delay(3).unwrap(), Duration::from_secs(4));
    assert_eq!(backoff.delay(6).unwrap(), Duration::from_secs(10));
  }

  #[test]
  fn test_retry_policy() {
    let on_failure = RetryStrategy::default();
    assert!(on_failure.should_retry(NodePhase::Failed));
    assert!(!on_failure.should_retry(NodePhase::Error));

    let always = RetryStrategy {
      retry_policy: Some(RetryPolicy::Always),
      ..Default::default()
    };
    assert!(always.should_retry(NodePhase::Error));
    assert!(!always.should_retry(NodePhase::Succeeded));
  }

  #[test]
  fn test_artifact_file_name() {
    let mut artifact = Artifact {
      name: "out".into(),
      ..Default::default()
    };
    assert_eq!(artifact.file_name(), "out.tgz");
    artifact.archive = Some(ArchiveStrategy {
      none: Some(serde_json::json!({})),
      tar: None,
    });
    assert_eq!(artifact.file_name(), "out");
  }
}
