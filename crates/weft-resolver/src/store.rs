use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use weft_workflow::WorkflowTemplate;

use crate::error::ResolveError;

/// Source of workflow templates and cluster workflow templates.
#[async_trait]
pub trait TemplateStore: Send + Sync {
  async fn get_workflow_template(&self, namespace: &str, name: &str) -> Result<Option<WorkflowTemplate>, ResolveError>;

  async fn get_cluster_workflow_template(&self, name: &str) -> Result<Option<WorkflowTemplate>, ResolveError>;
}

/// Templates held in memory, keyed by `namespace/name` (namespaced) or
/// `name` (cluster scoped).
#[derive(Default)]
pub struct InMemoryTemplateStore {
  namespaced: RwLock<HashMap<String, WorkflowTemplate>>,
  cluster: RwLock<HashMap<String, WorkflowTemplate>>,
}

impl InMemoryTemplateStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn put_workflow_template(&self, template: WorkflowTemplate) {
    let key = template.metadata.key();
    self.namespaced.write().insert(key, template);
  }

  pub fn put_cluster_workflow_template(&self, template: WorkflowTemplate) {
    let key = template.metadata.name.clone();
    self.cluster.write().insert(key, template);
  }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
  async fn get_workflow_template(&self, namespace: &str, name: &str) -> Result<Option<WorkflowTemplate>, ResolveError> {
    Ok(self.namespaced.read().get(&format!("{namespace}/{name}")).cloned())
  }

  async fn get_cluster_workflow_template(&self, name: &str) -> Result<Option<WorkflowTemplate>, ResolveError> {
    Ok(self.cluster.read().get(name).cloned())
  }
}

/// Store with nothing in it, for workflows that never use `templateRef`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyTemplateStore;

#[async_trait]
impl TemplateStore for EmptyTemplateStore {
  async fn get_workflow_template(&self, _namespace: &str, _name: &str) -> Result<Option<WorkflowTemplate>, ResolveError> {
    Ok(None)
  }

  async fn get_cluster_workflow_template(&self, _name: &str) -> Result<Option<WorkflowTemplate>, ResolveError> {
    Ok(None)
  }
}
