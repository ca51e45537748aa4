//! The reconcile entry point.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error, info, instrument, warn};
use weft_artifact::{ArtifactResolver, CredentialRegistry, resolve_repository};
use weft_config::{ConfigMapStore, SharedConfig};
use weft_metrics::ControllerMetrics;
use weft_persist::{LABEL_ARCHIVING_STATUS, Persistence};
use weft_plugin::PluginSet;
use weft_resolver::{Resolver, TemplateScope};
use weft_sync::SyncManager;
use weft_workflow::{
  Arguments, LABEL_COMPLETED, LABEL_PHASE, NodePhase, NodeStatus, NodeType, Outputs, Parameter, Workflow,
  WorkflowPhase, validate_workflow,
};

use crate::clock::{Clock, SystemClock};
use crate::cluster::PodControl;
use crate::context::{NodeRequest, Operation};
use crate::defaults::apply_defaults;
use crate::error::OperatorError;
use crate::progress::update_progress;
use crate::substitute::Params;

const ARCHIVED: &str = "Persisted";
const TOO_LARGE: &str = "workflow is longer than maximum allowed size";

/// Outcome of one reconcile.
#[derive(Debug, Clone)]
pub struct Reconciled {
  pub workflow: Workflow,
  /// The workflow differs from what was passed in and should be written.
  pub updated: bool,
  /// Reconcile again after this long even if nothing else happens.
  pub requeue_after: Option<Duration>,
  /// Nodes that started running or finished during this reconcile. Empty
  /// when node events are disabled.
  pub node_events: Vec<NodeEvent>,
}

/// A node moved to `Running` or a terminal phase.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEvent {
  pub node_id: String,
  pub node_name: String,
  pub node_type: NodeType,
  pub phase: NodePhase,
  pub message: String,
}

/// Drives workflows towards completion, one reconcile at a time.
///
/// `operate` is a pure step: it reads the workflow and the pods the
/// scheduler reports, creates or terminates pods, and returns the new
/// workflow. Writing it back is up to the caller.
pub struct Operator {
  pub(crate) resolver: Arc<dyn Resolver>,
  pub(crate) pods: Arc<dyn PodControl>,
  pub(crate) sync: Arc<SyncManager>,
  pub(crate) config_maps: Arc<dyn ConfigMapStore>,
  pub(crate) config: SharedConfig,
  pub(crate) persistence: Persistence,
  pub(crate) plugins: PluginSet,
  pub(crate) clock: Arc<dyn Clock>,
  pub(crate) metrics: Option<ControllerMetrics>,
}

impl Operator {
  pub fn new(
    resolver: Arc<dyn Resolver>,
    pods: Arc<dyn PodControl>,
    sync: Arc<SyncManager>,
    config_maps: Arc<dyn ConfigMapStore>,
    config: SharedConfig,
  ) -> Self {
    Self {
      resolver,
      pods,
      sync,
      config_maps,
      config,
      persistence: Persistence::disabled(),
      plugins: PluginSet::default(),
      clock: Arc::new(SystemClock),
      metrics: None,
    }
  }

  pub fn with_persistence(mut self, persistence: Persistence) -> Self {
    self.persistence = persistence;
    self
  }

  pub fn with_plugins(mut self, plugins: PluginSet) -> Self {
    self.plugins = plugins;
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Emit workflow and template metrics into this registry.
  pub fn with_metrics(mut self, metrics: ControllerMetrics) -> Self {
    self.metrics = Some(metrics);
    self
  }

  pub fn metrics(&self) -> Option<&ControllerMetrics> {
    self.metrics.as_ref()
  }

  pub fn sync(&self) -> &Arc<SyncManager> {
    &self.sync
  }

  pub fn persistence(&self) -> &Persistence {
    &self.persistence
  }

  pub fn config(&self) -> &SharedConfig {
    &self.config
  }

  pub fn clock(&self) -> &Arc<dyn Clock> {
    &self.clock
  }

  /// Advance `wf` as far as it can go right now.
  ///
  /// Transient errors (scheduler, store or database unavailable) are
  /// returned and the workflow should be retried unchanged. Everything else
  /// ends up on the workflow or one of its nodes.
  #[instrument(name = "workflow_operate", skip(self, wf), fields(workflow = %wf.key()))]
  pub async fn operate(&self, wf: Workflow) -> Result<Reconciled, OperatorError> {
    let original = wf.clone();
    let config = self.config.current();
    let artifacts = ArtifactResolver::new(CredentialRegistry::new(config.artifact_credentials.clone()));
    let mut operation = Operation::new(self, wf, config, self.clock.now(), artifacts);
    operation.run().await?;

    let requeue_after = operation.requeue_after();
    let node_events = std::mem::take(&mut operation.node_events);
    let workflow = operation.wf;
    let updated = workflow != original;
    debug!(updated, phase = %workflow.status.phase, ?requeue_after, "workflow_operated");
    Ok(Reconciled {
      workflow,
      updated,
      requeue_after,
      node_events,
    })
  }
}

/// `workflow.*` values every template can reference.
fn build_globals(wf: &Workflow) -> Params {
  let mut globals = Params::new();
  globals.insert("workflow.name".into(), wf.name().to_string());
  globals.insert("workflow.namespace".into(), wf.namespace().to_string());
  globals.insert("workflow.uid".into(), wf.metadata.uid.clone());
  globals.insert("workflow.creationTimestamp".into(), wf.creation_timestamp().to_rfc3339());
  globals.insert("workflow.priority".into(), wf.priority().to_string());
  for param in &wf.spec.arguments.parameters {
    if let Some(value) = param.value.as_ref().or(param.default.as_ref()) {
      globals.insert(format!("workflow.parameters.{}", param.name), value.clone());
    }
  }
  for (key, value) in &wf.metadata.labels {
    globals.insert(format!("workflow.labels.{key}"), value.clone());
  }
  for (key, value) in &wf.metadata.annotations {
    globals.insert(format!("workflow.annotations.{key}"), value.clone());
  }
  if let Some(outputs) = &wf.status.outputs {
    for param in &outputs.parameters {
      if let Some(value) = &param.value {
        globals.insert(format!("workflow.outputs.parameters.{}", param.name), value.clone());
      }
    }
  }
  globals
}

fn workflow_phase_for(node: &NodeStatus) -> WorkflowPhase {
  match node.phase {
    NodePhase::Error => WorkflowPhase::Error,
    phase if phase.successful() => WorkflowPhase::Succeeded,
    _ => WorkflowPhase::Failed,
  }
}

impl Operation<'_> {
  async fn run(&mut self) -> Result<(), OperatorError> {
    self.op.plugins.workflow_pre_operate(&mut self.wf).await;

    let completed = self.wf.metadata.labels.get(LABEL_COMPLETED).is_some_and(|v| v == "true");
    if completed || self.wf.status.phase.fulfilled() {
      self.set_labels();
      return Ok(());
    }

    if !self.hydrate().await? {
      return self.finalize(&HashSet::new()).await;
    }
    self.phases_before = self.wf.status.nodes.values().map(|n| (n.id.clone(), n.phase)).collect();
    let fulfilled_before: HashSet<String> = self
      .wf
      .status
      .nodes
      .values()
      .filter(|n| n.fulfilled())
      .map(|n| n.id.clone())
      .collect();

    if self.wf.status.phase == WorkflowPhase::Pending && !self.start().await? {
      return self.finalize(&fulfilled_before).await;
    }

    self.default_archive = self
      .wf
      .status
      .artifact_repository
      .clone()
      .and_then(|repo| repo.into_artifact_location());
    self.reconcile_pods().await?;
    self.enforce_stop().await?;
    self.promote_global_outputs();
    self.globals = build_globals(&self.wf);

    if self.wf.spec.suspend == Some(true) {
      debug!("workflow_suspended");
      return self.finalize(&fulfilled_before).await;
    }

    let name = self.wf.name().to_string();
    let root_req = NodeRequest {
      node_name: name.clone(),
      display_name: name.clone(),
      template: Some(self.wf.spec.entrypoint.clone()),
      template_ref: None,
      scope: TemplateScope::Workflow,
      arguments: self.wf.spec.arguments.clone(),
      boundary_id: None,
      boundary_parallelism: None,
      on_exit: false,
    };
    let root = match self.execute_template(root_req).await {
      Ok(root) => Some(root),
      Err(OperatorError::ParallelismReached) => None,
      Err(e) if e.is_transient() => return Err(e),
      Err(e) => {
        error!(error = %e, "workflow_execution_failed");
        self.complete(WorkflowPhase::Error, e.to_string());
        None
      }
    };

    if let Some(root) = root.filter(|r| r.fulfilled())
      && !self.wf.status.phase.fulfilled()
    {
      self.conclude(&name, &root).await?;
    }
    self.finalize(&fulfilled_before).await
  }

  /// Move a Pending workflow to Running, or explain why it cannot start.
  async fn start(&mut self) -> Result<bool, OperatorError> {
    if self.wf.status.started_at.is_none()
      && let Some(defaults) = self.config.workflow_defaults.clone()
    {
      match apply_defaults(&self.wf, &defaults) {
        Ok(merged) => self.wf = merged,
        Err(e) => {
          self.complete(WorkflowPhase::Error, format!("failed to apply workflow defaults: {e}"));
          return Ok(false);
        }
      }
    }

    if let Err(e) = validate_workflow(&self.wf) {
      self.complete(WorkflowPhase::Failed, e.to_string());
      return Ok(false);
    }

    if self.wf.status.artifact_repository.is_none() {
      let repository = resolve_repository(
        self.op.config_maps.as_ref(),
        self.wf.namespace(),
        self.wf.spec.artifact_repository_ref.as_ref(),
        self.config.artifact_repository.as_ref(),
      )
      .await;
      match repository {
        Ok(repository) => self.wf.status.artifact_repository = repository,
        Err(e) => {
          self.complete(WorkflowPhase::Failed, e.to_string());
          return Ok(false);
        }
      }
    }

    if let Some(sync) = self.wf.spec.synchronization.clone() {
      match self.op.sync.try_acquire(&mut self.wf, None, &sync).await {
        Ok(outcome) if !outcome.acquired => {
          debug!(message = %outcome.message, "workflow_waiting_for_lock");
          self.wf.status.message = outcome.message;
          return Ok(false);
        }
        Ok(_) => {}
        Err(e) if e.is_transient() => return Err(e.into()),
        Err(e) => {
          self.complete(WorkflowPhase::Failed, e.to_string());
          return Ok(false);
        }
      }
    }

    self.wf.status.phase = WorkflowPhase::Running;
    self.wf.status.started_at = Some(self.now);
    self.wf.status.message.clear();
    info!("workflow_started");
    Ok(true)
  }

  /// The root is done: run the exit handler, then complete the workflow.
  async fn conclude(&mut self, name: &str, root: &NodeStatus) -> Result<(), OperatorError> {
    let phase = workflow_phase_for(root);
    let mut message = if phase == WorkflowPhase::Succeeded {
      String::new()
    } else {
      root.message.clone()
    };

    if let Some(on_exit) = self.wf.spec.on_exit.clone() {
      self.expose_outcome(phase);
      let exit_name = format!("{name}.onExit");
      let req = NodeRequest {
        node_name: exit_name.clone(),
        display_name: exit_name,
        template: Some(on_exit),
        template_ref: None,
        scope: TemplateScope::Workflow,
        arguments: Arguments::default(),
        boundary_id: None,
        boundary_parallelism: None,
        on_exit: true,
      };
      let exit = match self.execute_template(req).await {
        Ok(exit) => exit,
        Err(OperatorError::ParallelismReached) => return Ok(()),
        Err(e) if e.is_transient() => return Err(e),
        Err(e) => {
          self.complete(WorkflowPhase::Error, e.to_string());
          return Ok(());
        }
      };
      if !exit.fulfilled() {
        return Ok(());
      }
      if !exit.successful() {
        let note = format!("exit handler failed: {}", exit.message);
        message = if message.is_empty() { note } else { format!("{message}; {note}") };
      }
    }

    self.complete(phase, message);
    Ok(())
  }

  /// `workflow.status`, `workflow.failures` and `workflow.duration` for the
  /// exit handler.
  fn expose_outcome(&mut self, phase: WorkflowPhase) {
    let failures: Vec<serde_json::Value> = self
      .wf
      .status
      .nodes
      .values()
      .filter(|n| n.node_type.is_leaf_work() && n.phase.failed_or_errored())
      .map(|n| {
        json!({
          "displayName": n.display_name,
          "message": n.message,
          "templateName": n.template_name,
          "phase": n.phase.as_str(),
          "podName": n.id,
          "finishedAt": n.finished_at,
        })
      })
      .collect();
    let duration = self
      .wf
      .status
      .started_at
      .map(|started| (self.now - started).num_milliseconds() as f64 / 1000.0)
      .unwrap_or_default();

    self.globals.insert("workflow.status".into(), phase.as_str().to_string());
    self.globals.insert("workflow.failures".into(), serde_json::Value::Array(failures).to_string());
    self.globals.insert("workflow.duration".into(), format!("{duration:.6}"));
  }

  /// Put the workflow in a terminal phase and let go of its locks.
  pub(crate) fn complete(&mut self, phase: WorkflowPhase, message: impl Into<String>) {
    let message = message.into();
    self.wf.status.phase = phase;
    self.wf.status.message = message;
    self.wf.status.started_at.get_or_insert(self.now);
    self.wf.status.finished_at = Some(self.now);
    self.op.sync.release_all(&mut self.wf);
    self.completed_now = true;
    info!(phase = %phase, message = %self.wf.status.message, "workflow_completed");
  }

  /// Load offloaded nodes. `false` when they are gone and the workflow has
  /// been failed for it.
  async fn hydrate(&mut self) -> Result<bool, OperatorError> {
    let Some(version) = self.wf.status.offload_node_status_version.clone() else {
      return Ok(true);
    };
    if !self.wf.status.nodes.is_empty() {
      return Ok(true);
    }
    let loaded = self
      .op
      .persistence
      .offload
      .get(self.wf.name(), self.wf.namespace(), Some(&version))
      .await;
    match loaded {
      Ok(nodes) => {
        debug!(version, count = nodes.len(), "nodes_hydrated");
        self.wf.status.nodes = nodes;
        Ok(true)
      }
      Err(e) if e.is_transient() => Err(e.into()),
      Err(e) => {
        self.complete(WorkflowPhase::Error, format!("failed to hydrate offloaded nodes: {e}"));
        Ok(false)
      }
    }
  }

  /// Fail running leaves once the workflow is stopped or out of time.
  async fn enforce_stop(&mut self) -> Result<(), OperatorError> {
    if let Some(deadline) = self.workflow_deadline() {
      self.until(deadline);
    }
    if self.stop_reason(false).is_none() {
      return Ok(());
    }
    let exit_prefix = format!("{}.onExit", self.wf.name());
    let doomed: Vec<(String, bool, String)> = self
      .wf
      .status
      .nodes
      .values()
      .filter(|n| !n.fulfilled())
      .filter(|n| matches!(n.node_type, NodeType::Pod | NodeType::Plugin | NodeType::Suspend))
      .filter_map(|n| {
        self
          .stop_reason(n.name.starts_with(&exit_prefix))
          .map(|reason| (n.id.clone(), n.is_pod(), reason))
      })
      .collect();

    for (id, is_pod, reason) in doomed {
      if is_pod && self.pods_seen.contains(&id) {
        self.op.pods.terminate_pod(self.wf.namespace(), &id, &reason).await?;
      }
      self.finish(&id, NodePhase::Failed, Some(&reason), None);
      info!(node = %id, reason, "node_stopped");
    }
    Ok(())
  }

  /// Copy outputs with a `globalName` from succeeded nodes into the
  /// workflow outputs. Later finishers win.
  fn promote_global_outputs(&mut self) {
    let mut sources: Vec<&NodeStatus> = self
      .wf
      .status
      .nodes
      .values()
      .filter(|n| n.phase == NodePhase::Succeeded && n.outputs.is_some())
      .collect();
    sources.sort_by_key(|n| n.finished_at);

    let mut params = Vec::new();
    let mut artifacts = Vec::new();
    for outputs in sources.into_iter().filter_map(|n| n.outputs.as_ref()) {
      for param in &outputs.parameters {
        if let (Some(global), Some(value)) = (&param.global_name, &param.value) {
          params.push((global.clone(), value.clone()));
        }
      }
      for artifact in &outputs.artifacts {
        if let Some(global) = &artifact.global_name
          && artifact.has_location()
        {
          let mut promoted = artifact.clone();
          promoted.name = global.clone();
          promoted.global_name = None;
          artifacts.push(promoted);
        }
      }
    }
    if params.is_empty() && artifacts.is_empty() {
      return;
    }

    let outputs = self.wf.status.outputs.get_or_insert_with(Outputs::default);
    for (name, value) in params {
      match outputs.parameters.iter_mut().find(|p| p.name == name) {
        Some(existing) => existing.value = Some(value),
        None => outputs.parameters.push(Parameter::with_value(name, value)),
      }
    }
    for artifact in artifacts {
      match outputs.artifacts.iter_mut().find(|a| a.name == artifact.name) {
        Some(existing) => *existing = artifact,
        None => outputs.artifacts.push(artifact),
      }
    }
  }

  /// Nodes whose phase moved to `Running` or a terminal phase since the
  /// start of this reconcile.
  fn phase_changes(&self) -> Vec<NodeEvent> {
    let mut events: Vec<NodeEvent> = self
      .wf
      .status
      .nodes
      .values()
      .filter(|n| n.phase == NodePhase::Running || n.fulfilled())
      .filter(|n| self.phases_before.get(&n.id) != Some(&n.phase))
      .map(|n| NodeEvent {
        node_id: n.id.clone(),
        node_name: n.name.clone(),
        node_type: n.node_type,
        phase: n.phase,
        message: n.message.clone(),
      })
      .collect();
    events.sort_by(|a, b| a.node_name.cmp(&b.node_name));
    for event in &events {
      info!(node = %event.node_name, phase = %event.phase, message = %event.message, "node_phase_changed");
    }
    events
  }

  fn set_labels(&mut self) {
    let labels = &mut self.wf.metadata.labels;
    labels.insert(LABEL_PHASE.to_string(), self.wf.status.phase.as_str().to_string());
    let completed = if self.wf.status.phase.fulfilled() { "true" } else { "false" };
    labels.insert(LABEL_COMPLETED.to_string(), completed.to_string());
  }

  async fn archive(&mut self) -> Result<(), OperatorError> {
    if !self.op.persistence.should_archive(&self.wf) {
      return Ok(());
    }
    match self.op.persistence.archive.archive_workflow(&self.wf).await {
      Ok(()) => {
        self
          .wf
          .metadata
          .labels
          .insert(LABEL_ARCHIVING_STATUS.to_string(), ARCHIVED.to_string());
        info!("workflow_archived");
        Ok(())
      }
      Err(e) if e.is_transient() => Err(e.into()),
      Err(e) => {
        warn!(error = %e, "workflow_archive_failed");
        Ok(())
      }
    }
  }

  /// Bookkeeping shared by every path out of a reconcile.
  async fn finalize(&mut self, fulfilled_before: &HashSet<String>) -> Result<(), OperatorError> {
    self.wf.status.progress = update_progress(&mut self.wf.status.nodes);

    let newly_fulfilled: Vec<NodeStatus> = self
      .wf
      .status
      .nodes
      .values()
      .filter(|n| n.fulfilled() && !fulfilled_before.contains(&n.id))
      .filter(|n| n.node_type.is_leaf_work() || n.node_type == NodeType::Suspend)
      .cloned()
      .collect();
    for node in &newly_fulfilled {
      self.op.plugins.node_post_execute(&self.wf, node).await;
    }
    if self.config.node_events.enabled() {
      self.node_events = self.phase_changes();
    }

    let size = serde_json::to_vec(&self.wf.status.nodes)?.len();
    let oversized = !self.wf.status.nodes.is_empty() && size > self.op.persistence.offload_threshold;
    if oversized && !self.op.persistence.offload.is_enabled() && !self.wf.status.phase.fulfilled() {
      self.complete(WorkflowPhase::Error, TOO_LARGE);
    }
    self.emit_custom_metrics(fulfilled_before);

    self.set_labels();
    if self.completed_now {
      if let Err(e) = self.op.sync.flush_releases().await {
        warn!(error = %e, "lock_store_release_deferred");
      }
      self.archive().await?;
    }
    self.op.plugins.workflow_pre_update(&mut self.wf).await;

    if !oversized {
      self.wf.status.offload_node_status_version = None;
    } else if self.op.persistence.offload.is_enabled() {
      let version = self
        .op
        .persistence
        .offload
        .save(self.wf.name(), self.wf.namespace(), &self.wf.status.nodes)
        .await?;
      debug!(version, size, "nodes_offloaded");
      self.wf.status.nodes.clear();
      self.wf.status.offload_node_status_version = Some(version);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use weft_workflow::WorkflowSpec;

  #[test]
  fn test_globals_include_metadata_and_arguments() {
    let mut wf = Workflow::new("argo", "hello", WorkflowSpec::default());
    wf.metadata.uid = "uid-1".into();
    wf.metadata.labels.insert("team".into(), "data".into());
    wf.spec.arguments.parameters.push(Parameter::with_value("message", "hi"));
    let mut defaulted = Parameter::with_value("count", "");
    defaulted.value = None;
    defaulted.default = Some("3".into());
    wf.spec.arguments.parameters.push(defaulted);

    let globals = build_globals(&wf);
    assert_eq!(globals["workflow.name"], "hello");
    assert_eq!(globals["workflow.namespace"], "argo");
    assert_eq!(globals["workflow.uid"], "uid-1");
    assert_eq!(globals["workflow.parameters.message"], "hi");
    assert_eq!(globals["workflow.parameters.count"], "3");
    assert_eq!(globals["workflow.labels.team"], "data");
  }

  #[test]
  fn test_workflow_phase_follows_root() {
    let now = chrono::Utc::now();
    let node = |phase| NodeStatus::new("wf", "wf", "wf", NodeType::Steps, phase, now);
    assert_eq!(workflow_phase_for(&node(NodePhase::Succeeded)), WorkflowPhase::Succeeded);
    assert_eq!(workflow_phase_for(&node(NodePhase::Skipped)), WorkflowPhase::Succeeded);
    assert_eq!(workflow_phase_for(&node(NodePhase::Failed)), WorkflowPhase::Failed);
    assert_eq!(workflow_phase_for(&node(NodePhase::Error)), WorkflowPhase::Error);
  }
}
