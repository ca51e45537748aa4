use async_trait::async_trait;
use weft_workflow::{Pod, PodSpec};

use crate::error::OperatorError;

/// The operator's view of the pod scheduler.
#[async_trait]
pub trait PodControl: Send + Sync {
  /// Submit a pod. Creating a pod that already exists is not an error.
  async fn create_pod(&self, spec: PodSpec) -> Result<(), OperatorError>;

  /// Pods labelled as belonging to the workflow.
  async fn list_pods(&self, namespace: &str, workflow: &str) -> Result<Vec<Pod>, OperatorError>;

  /// Stop a running pod, failing it with `message`.
  async fn terminate_pod(&self, namespace: &str, name: &str, message: &str) -> Result<(), OperatorError>;
}
