use std::sync::Arc;

use tracing::warn;
use weft_workflow::{NodeStatus, PodSpec, Template, Workflow};

use crate::error::PluginError;
use crate::hooks::{NodeLifecycleHook, NodeResult, PodLifecycleHook, TemplateExecutor, WorkflowLifecycleHook};

/// What a round of hook calls produced.
#[derive(Debug, Default)]
pub struct HookOutcome<T> {
  pub value: T,
  /// Failures that were logged and skipped.
  pub errors: Vec<PluginError>,
}

impl<T> HookOutcome<T> {
  fn new(value: T) -> Self {
    Self {
      value,
      errors: Vec::new(),
    }
  }

  fn record(&mut self, error: PluginError) {
    warn!(plugin = %error.plugin, hook = error.hook, error = %error.message, "plugin_hook_failed");
    self.errors.push(error);
  }
}

/// All registered hooks, called in registration order.
///
/// A failing hook never stops the others or the reconcile; its error is
/// logged and handed back so the operator can surface it.
#[derive(Clone, Default)]
pub struct PluginSet {
  workflow_hooks: Vec<Arc<dyn WorkflowLifecycleHook>>,
  template_executors: Vec<Arc<dyn TemplateExecutor>>,
  node_hooks: Vec<Arc<dyn NodeLifecycleHook>>,
  pod_hooks: Vec<Arc<dyn PodLifecycleHook>>,
}

impl PluginSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_workflow_hook(mut self, hook: Arc<dyn WorkflowLifecycleHook>) -> Self {
    self.workflow_hooks.push(hook);
    self
  }

  pub fn with_template_executor(mut self, executor: Arc<dyn TemplateExecutor>) -> Self {
    self.template_executors.push(executor);
    self
  }

  pub fn with_node_hook(mut self, hook: Arc<dyn NodeLifecycleHook>) -> Self {
    self.node_hooks.push(hook);
    self
  }

  pub fn with_pod_hook(mut self, hook: Arc<dyn PodLifecycleHook>) -> Self {
    self.pod_hooks.push(hook);
    self
  }

  pub fn is_empty(&self) -> bool {
    self.workflow_hooks.is_empty()
      && self.template_executors.is_empty()
      && self.node_hooks.is_empty()
      && self.pod_hooks.is_empty()
  }

  pub async fn workflow_pre_operate(&self, wf: &mut Workflow) -> HookOutcome<()> {
    let mut outcome = HookOutcome::new(());
    for hook in &self.workflow_hooks {
      if let Err(e) = hook.workflow_pre_operate(wf).await {
        outcome.record(e);
      }
    }
    outcome
  }

  pub async fn workflow_pre_update(&self, wf: &mut Workflow) -> HookOutcome<()> {
    let mut outcome = HookOutcome::new(());
    for hook in &self.workflow_hooks {
      if let Err(e) = hook.workflow_pre_update(wf).await {
        outcome.record(e);
      }
    }
    outcome
  }

  /// The first executor that claims the template wins.
  pub async fn execute_template(
    &self,
    wf: &Workflow,
    template: &Template,
    node: &NodeStatus,
  ) -> HookOutcome<Option<NodeResult>> {
    let mut outcome = HookOutcome::new(None);
    for executor in &self.template_executors {
      match executor.execute_template(wf, template, node).await {
        Ok(Some(result)) => {
          outcome.value = Some(result);
          break;
        }
        Ok(None) => {}
        Err(e) => outcome.record(e),
      }
    }
    outcome
  }

  /// Stops at the first hook that returns a fulfilled result.
  pub async fn node_pre_execute(
    &self,
    wf: &Workflow,
    template: &Template,
    node: &NodeStatus,
  ) -> HookOutcome<Option<NodeResult>> {
    let mut outcome = HookOutcome::new(None);
    for hook in &self.node_hooks {
      match hook.node_pre_execute(wf, template, node).await {
        Ok(Some(result)) if result.fulfilled() => {
          outcome.value = Some(result);
          break;
        }
        Ok(_) => {}
        Err(e) => outcome.record(e),
      }
    }
    outcome
  }

  pub async fn node_post_execute(&self, wf: &Workflow, node: &NodeStatus) -> HookOutcome<()> {
    let mut outcome = HookOutcome::new(());
    for hook in &self.node_hooks {
      if let Err(e) = hook.node_post_execute(wf, node).await {
        outcome.record(e);
      }
    }
    outcome
  }

  pub async fn pod_pre_create(&self, wf: &Workflow, pod: &mut PodSpec) -> HookOutcome<()> {
    let mut outcome = HookOutcome::new(());
    for hook in &self.pod_hooks {
      if let Err(e) = hook.pod_pre_create(wf, pod).await {
        outcome.record(e);
      }
    }
    outcome
  }

  pub async fn pod_post_create(&self, wf: &Workflow, pod: &PodSpec) -> HookOutcome<()> {
    let mut outcome = HookOutcome::new(());
    for hook in &self.pod_hooks {
      if let Err(e) = hook.pod_post_create(wf, pod).await {
        outcome.record(e);
      }
    }
    outcome
  }
}
