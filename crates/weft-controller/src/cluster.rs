//! An in-process stand-in for the cluster: a workflow store with optimistic
//! concurrency, a pod store the operator drives, and config maps.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;
use weft_config::InMemoryConfigMaps;
use weft_operator::{OperatorError, PodControl};
use weft_workflow::{LABEL_WORKFLOW, Pod, PodPhase, PodSpec, Workflow};

use crate::error::ControllerError;

/// Called with the `namespace/name` key of the workflow a pod belongs to.
pub type PodEventHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Workflows keyed by `namespace/name`.
///
/// Every write bumps `metadata.resourceVersion`; an update carrying a stale
/// version is rejected with [`ControllerError::Conflict`].
#[derive(Debug, Default)]
pub struct WorkflowStore {
  workflows: RwLock<BTreeMap<String, Workflow>>,
}

fn next_version(current: &str) -> String {
  (current.parse::<u64>().unwrap_or(0) + 1).to_string()
}

impl WorkflowStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn create(&self, mut wf: Workflow) -> Result<Workflow, ControllerError> {
    let key = wf.key();
    let mut workflows = self.workflows.write();
    if workflows.contains_key(&key) {
      return Err(ControllerError::AlreadyExists { key });
    }
    wf.metadata.resource_version = next_version("0");
    wf.metadata.creation_timestamp.get_or_insert_with(Utc::now);
    workflows.insert(key, wf.clone());
    Ok(wf)
  }

  pub fn get(&self, key: &str) -> Option<Workflow> {
    self.workflows.read().get(key).cloned()
  }

  pub fn exists(&self, key: &str) -> bool {
    self.workflows.read().contains_key(key)
  }

  pub fn update(&self, mut wf: Workflow) -> Result<Workflow, ControllerError> {
    let key = wf.key();
    let mut workflows = self.workflows.write();
    let stored = workflows
      .get(&key)
      .ok_or_else(|| ControllerError::WorkflowNotFound { key: key.clone() })?;
    if stored.metadata.resource_version != wf.metadata.resource_version {
      return Err(ControllerError::Conflict {
        key,
        expected: wf.metadata.resource_version,
        actual: stored.metadata.resource_version.clone(),
      });
    }
    wf.metadata.resource_version = next_version(&stored.metadata.resource_version);
    workflows.insert(key, wf.clone());
    Ok(wf)
  }

  pub fn delete(&self, key: &str) -> Option<Workflow> {
    self.workflows.write().remove(key)
  }

  pub fn list(&self) -> Vec<Workflow> {
    self.workflows.read().values().cloned().collect()
  }
}

/// Pods keyed by `namespace/name`. Status changes are reported to the
/// registered handler so the owning workflow is reconciled again.
#[derive(Default)]
pub struct PodStore {
  pods: RwLock<BTreeMap<String, Pod>>,
  handler: RwLock<Option<PodEventHandler>>,
}

fn pod_key(namespace: &str, name: &str) -> String {
  format!("{namespace}/{name}")
}

fn owner_key(pod: &Pod) -> Option<String> {
  pod
    .spec
    .labels
    .get(LABEL_WORKFLOW)
    .map(|workflow| format!("{}/{workflow}", pod.spec.namespace))
}

impl PodStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn on_change(&self, handler: PodEventHandler) {
    *self.handler.write() = Some(handler);
  }

  fn changed(&self, pod: &Pod) {
    let handler = self.handler.read().clone();
    if let (Some(handler), Some(owner)) = (handler, owner_key(pod)) {
      handler(owner);
    }
  }

  pub fn get(&self, namespace: &str, name: &str) -> Option<Pod> {
    self.pods.read().get(&pod_key(namespace, name)).cloned()
  }

  pub fn list(&self) -> Vec<Pod> {
    self.pods.read().values().cloned().collect()
  }

  /// Apply `update` to a pod's status and report the change.
  pub fn update_status<F>(&self, namespace: &str, name: &str, update: F) -> bool
  where
    F: FnOnce(&mut Pod),
  {
    let pod = {
      let mut pods = self.pods.write();
      let Some(pod) = pods.get_mut(&pod_key(namespace, name)) else {
        return false;
      };
      update(pod);
      pod.clone()
    };
    self.changed(&pod);
    true
  }

  /// Remove every pod of a workflow.
  pub fn delete_for(&self, namespace: &str, workflow: &str) -> usize {
    let mut pods = self.pods.write();
    let before = pods.len();
    pods.retain(|_, p| {
      p.spec.namespace != namespace || p.spec.labels.get(LABEL_WORKFLOW).map(String::as_str) != Some(workflow)
    });
    before - pods.len()
  }
}

#[async_trait]
impl PodControl for PodStore {
  async fn create_pod(&self, spec: PodSpec) -> Result<(), OperatorError> {
    let key = pod_key(&spec.namespace, &spec.name);
    let created = {
      let mut pods = self.pods.write();
      if pods.contains_key(&key) {
        None
      } else {
        let pod = Pod::new(spec);
        pods.insert(key.clone(), pod.clone());
        Some(pod)
      }
    };
    if let Some(pod) = created {
      debug!(pod = %key, "pod_stored");
      self.changed(&pod);
    }
    Ok(())
  }

  async fn list_pods(&self, namespace: &str, workflow: &str) -> Result<Vec<Pod>, OperatorError> {
    Ok(
      self
        .pods
        .read()
        .values()
        .filter(|p| p.spec.namespace == namespace)
        .filter(|p| p.spec.labels.get(LABEL_WORKFLOW).map(String::as_str) == Some(workflow))
        .cloned()
        .collect(),
    )
  }

  async fn terminate_pod(&self, namespace: &str, name: &str, message: &str) -> Result<(), OperatorError> {
    self.update_status(namespace, name, |pod| {
      if !pod.status.phase.fulfilled() {
        pod.status.phase = PodPhase::Failed;
        pod.status.message = message.to_string();
        pod.status.finished_at = Some(Utc::now());
      }
    });
    Ok(())
  }
}

/// The stores the controller, the operator and the pod runner share.
#[derive(Clone, Default)]
pub struct InMemoryCluster {
  pub workflows: Arc<WorkflowStore>,
  pub pods: Arc<PodStore>,
  pub config_maps: Arc<InMemoryConfigMaps>,
}

impl InMemoryCluster {
  pub fn new() -> Self {
    Self::default()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use parking_lot::Mutex;
  use weft_workflow::{ContainerTemplate, Template, TemplateKind, WorkflowSpec};

  fn spec(name: &str, workflow: &str) -> PodSpec {
    PodSpec {
      name: name.to_string(),
      namespace: "argo".to_string(),
      node_id: name.to_string(),
      template: Template::new("main", TemplateKind::Container(ContainerTemplate::default())),
      labels: BTreeMap::from([(LABEL_WORKFLOW.to_string(), workflow.to_string())]),
      annotations: BTreeMap::new(),
      archive_location: None,
      active_deadline_seconds: None,
    }
  }

  #[test]
  fn test_stale_update_conflicts() {
    let store = WorkflowStore::new();
    let created = store.create(Workflow::new("argo", "wf", WorkflowSpec::default())).unwrap();
    assert_eq!(created.metadata.resource_version, "1");
    assert!(matches!(
      store.create(created.clone()),
      Err(ControllerError::AlreadyExists { .. })
    ));

    let mut first = created.clone();
    first.status.message = "first".into();
    let updated = store.update(first).unwrap();
    assert_eq!(updated.metadata.resource_version, "2");

    let mut stale = created;
    stale.status.message = "stale".into();
    assert!(matches!(store.update(stale), Err(ControllerError::Conflict { .. })));
    assert_eq!(store.get("argo/wf").unwrap().status.message, "first");
  }

  #[tokio::test]
  async fn test_pod_changes_reach_the_owner() {
    let store = PodStore::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    store.on_change(Arc::new(move |key| sink.lock().push(key)));

    store.create_pod(spec("wf-1", "wf")).await.unwrap();
    store.create_pod(spec("wf-1", "wf")).await.unwrap();
    store.terminate_pod("argo", "wf-1", "stopped").await.unwrap();

    assert_eq!(*seen.lock(), vec!["argo/wf".to_string(), "argo/wf".to_string()]);
    let pod = store.get("argo", "wf-1").unwrap();
    assert_eq!(pod.status.phase, PodPhase::Failed);
    assert_eq!(pod.status.message, "stopped");
    assert_eq!(store.list_pods("argo", "wf").await.unwrap().len(), 1);
    assert_eq!(store.list_pods("argo", "other").await.unwrap().len(), 0);
    assert_eq!(store.delete_for("argo", "wf"), 1);
  }
}
