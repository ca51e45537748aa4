use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use weft_workflow::{NodePhase, NodeStatus, Outputs, PodSpec, Progress, Template, Workflow};

use crate::error::PluginError;

/// Node state a hook hands back in place of running a pod.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
  pub phase: NodePhase,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub outputs: Option<Outputs>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub progress: Option<Progress>,
}

impl NodeResult {
  pub fn new(phase: NodePhase) -> Self {
    Self {
      phase,
      ..Default::default()
    }
  }

  pub fn fulfilled(&self) -> bool {
    self.phase.fulfilled()
  }
}

/// Every hook carries a name so failures can be attributed.
pub trait Named {
  fn name(&self) -> &str;
}

/// Called around each reconcile of a workflow.
#[async_trait]
pub trait WorkflowLifecycleHook: Named + Send + Sync {
  /// Before the operator looks at the workflow. May mutate it.
  async fn workflow_pre_operate(&self, _wf: &mut Workflow) -> Result<(), PluginError> {
    Ok(())
  }

  /// Before the reconciled workflow is written back. May mutate it.
  async fn workflow_pre_update(&self, _wf: &mut Workflow) -> Result<(), PluginError> {
    Ok(())
  }
}

/// Runs templates the operator would otherwise turn into pods.
#[async_trait]
pub trait TemplateExecutor: Named + Send + Sync {
  /// `Some` replaces pod creation for this node.
  async fn execute_template(
    &self,
    wf: &Workflow,
    template: &Template,
    node: &NodeStatus,
  ) -> Result<Option<NodeResult>, PluginError>;
}

/// Called before and after a leaf node executes.
#[async_trait]
pub trait NodeLifecycleHook: Named + Send + Sync {
  /// A fulfilled result short-circuits execution of the node.
  async fn node_pre_execute(
    &self,
    _wf: &Workflow,
    _template: &Template,
    _node: &NodeStatus,
  ) -> Result<Option<NodeResult>, PluginError> {
    Ok(None)
  }

  /// Notification only.
  async fn node_post_execute(&self, _wf: &Workflow, _node: &NodeStatus) -> Result<(), PluginError> {
    Ok(())
  }
}

/// Called around pod creation. `pod_pre_create` may rewrite the spec.
#[async_trait]
pub trait PodLifecycleHook: Named + Send + Sync {
  async fn pod_pre_create(&self, _wf: &Workflow, _pod: &mut PodSpec) -> Result<(), PluginError> {
    Ok(())
  }

  async fn pod_post_create(&self, _wf: &Workflow, _pod: &PodSpec) -> Result<(), PluginError> {
    Ok(())
  }
}
