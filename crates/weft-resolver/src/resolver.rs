use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use weft_workflow::{Template, TemplateHolder, Workflow, WorkflowTemplate};

use crate::error::ResolveError;
use crate::store::TemplateStore;

/// Where a bare template name is looked up.
///
/// A template reached through `templateRef` resolves the names inside it
/// against the workflow template it came from, not against the workflow.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TemplateScope {
  #[default]
  Workflow,
  WorkflowTemplate {
    name: String,
  },
  ClusterWorkflowTemplate {
    name: String,
  },
}

impl TemplateScope {
  fn describe(&self, wf: &Workflow) -> String {
    match self {
      TemplateScope::Workflow => format!("workflow {}", wf.key()),
      TemplateScope::WorkflowTemplate { name } => format!("workflow template {}/{name}", wf.namespace()),
      TemplateScope::ClusterWorkflowTemplate { name } => format!("cluster workflow template {name}"),
    }
  }
}

/// Key of a pinned template in `status.storedTemplates`.
pub fn stored_template_id(cluster_scope: bool, workflow_template: &str, template: &str) -> String {
  let scope = if cluster_scope { "cluster" } else { "namespaced" };
  format!("{scope}/{workflow_template}/{template}")
}

/// A resolved template and the scope its own references resolve in.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
  pub template: Template,
  pub scope: TemplateScope,
  /// Set when the template was fetched fresh and should be pinned under
  /// this id before the workflow is persisted.
  pub newly_stored: Option<String>,
}

impl Resolved {
  /// Pin a freshly fetched template on the workflow. Returns whether the
  /// status changed.
  pub fn store_into(&self, wf: &mut Workflow) -> bool {
    match &self.newly_stored {
      Some(id) => {
        wf.status
          .stored_templates
          .insert(id.clone(), self.template.clone());
        true
      }
      None => false,
    }
  }
}

/// Resolver turns a template name or reference into a concrete template.
#[async_trait]
pub trait Resolver: Send + Sync {
  /// Resolve `holder` as seen from `scope`.
  ///
  /// Lookup order:
  /// 1. a bare name in the workflow scope: the workflow's own templates
  /// 2. a previously pinned copy in `status.storedTemplates`
  /// 3. the referenced workflow template or cluster workflow template
  async fn resolve(
    &self,
    wf: &Workflow,
    holder: TemplateHolder<'_>,
    scope: &TemplateScope,
  ) -> Result<Resolved, ResolveError>;
}

/// Standard resolver backed by a [`TemplateStore`].
#[derive(Clone)]
pub struct TemplateResolver {
  store: Arc<dyn TemplateStore>,
}

impl TemplateResolver {
  pub fn new(store: Arc<dyn TemplateStore>) -> Self {
    Self { store }
  }

  async fn fetch(&self, wf: &Workflow, cluster_scope: bool, name: &str) -> Result<WorkflowTemplate, ResolveError> {
    let found = if cluster_scope {
      self.store.get_cluster_workflow_template(name).await?
    } else {
      self.store.get_workflow_template(wf.namespace(), name).await?
    };
    found.ok_or_else(|| ResolveError::WorkflowTemplateNotFound {
      kind: if cluster_scope {
        "cluster workflow template"
      } else {
        "workflow template"
      },
      name: name.to_string(),
    })
  }

  async fn resolve_in(&self, wf: &Workflow, scope: &TemplateScope, name: &str) -> Result<Resolved, ResolveError> {
    let not_found = || ResolveError::TemplateNotFound {
      name: name.to_string(),
      scope: scope.describe(wf),
    };
    let (cluster_scope, holder_name) = match scope {
      TemplateScope::Workflow => {
        let template = wf.get_template(name).cloned().ok_or_else(not_found)?;
        return Ok(Resolved {
          template,
          scope: TemplateScope::Workflow,
          newly_stored: None,
        });
      }
      TemplateScope::WorkflowTemplate { name: holder } => (false, holder),
      TemplateScope::ClusterWorkflowTemplate { name: holder } => (true, holder),
    };

    let id = stored_template_id(cluster_scope, holder_name, name);
    if let Some(template) = wf.status.stored_templates.get(&id) {
      return Ok(Resolved {
        template: template.clone(),
        scope: scope.clone(),
        newly_stored: None,
      });
    }

    let source = self.fetch(wf, cluster_scope, holder_name).await?;
    let template = source.get_template(name).cloned().ok_or_else(not_found)?;
    debug!(workflow = %wf.key(), stored_id = %id, "template_pinned");
    Ok(Resolved {
      template,
      scope: scope.clone(),
      newly_stored: Some(id),
    })
  }
}

#[async_trait]
impl Resolver for TemplateResolver {
  async fn resolve(
    &self,
    wf: &Workflow,
    holder: TemplateHolder<'_>,
    scope: &TemplateScope,
  ) -> Result<Resolved, ResolveError> {
    match (holder.template_ref, holder.template) {
      (Some(reference), _) => {
        let scope = if reference.cluster_scope {
          TemplateScope::ClusterWorkflowTemplate {
            name: reference.name.clone(),
          }
        } else {
          TemplateScope::WorkflowTemplate {
            name: reference.name.clone(),
          }
        };
        self.resolve_in(wf, &scope, &reference.template).await
      }
      (None, Some(name)) => self.resolve_in(wf, scope, name).await,
      (None, None) => Err(ResolveError::NoTemplate {
        context: wf.key(),
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{EmptyTemplateStore, InMemoryTemplateStore};
  use weft_workflow::{
    ContainerTemplate, ObjectMeta, TemplateKind, TemplateRef, WorkflowSpec, WorkflowStep,
  };

  fn container(name: &str, image: &str) -> Template {
    Template::new(
      name,
      TemplateKind::Container(ContainerTemplate {
        image: image.to_string(),
        ..Default::default()
      }),
    )
  }

  fn steps(name: &str, inner: &str) -> Template {
    Template::new(
      name,
      TemplateKind::Steps(vec![vec![WorkflowStep {
        name: "inner".to_string(),
        template: Some(inner.to_string()),
        ..Default::default()
      }]]),
    )
  }

  fn library(namespace: &str, name: &str, templates: Vec<Template>) -> WorkflowTemplate {
    WorkflowTemplate {
      metadata: ObjectMeta::new(namespace, name),
      spec: WorkflowSpec {
        templates,
        ..Default::default()
      },
    }
  }

  fn workflow() -> Workflow {
    Workflow::new(
      "argo",
      "hello",
      WorkflowSpec {
        templates: vec![container("main", "alpine")],
        entrypoint: "main".to_string(),
        ..Default::default()
      },
    )
  }

  fn reference(name: &str, template: &str, cluster_scope: bool) -> TemplateRef {
    TemplateRef {
      name: name.to_string(),
      template: template.to_string(),
      cluster_scope,
    }
  }

  #[tokio::test]
  async fn test_resolves_local_template() {
    let resolver = TemplateResolver::new(Arc::new(EmptyTemplateStore));
    let wf = workflow();
    let resolved = resolver
      .resolve(&wf, TemplateHolder::local("main"), &TemplateScope::Workflow)
      .await
      .unwrap();
    assert_eq!(resolved.template.name, "main");
    assert_eq!(resolved.scope, TemplateScope::Workflow);
    assert!(resolved.newly_stored.is_none());
  }

  #[tokio::test]
  async fn test_reference_is_pinned_across_store_changes() {
    let store = Arc::new(InMemoryTemplateStore::new());
    store.put_workflow_template(library("argo", "lib", vec![container("build", "golang:1.22")]));
    let resolver = TemplateResolver::new(store.clone());
    let mut wf = workflow();
    let r = reference("lib", "build", false);
    let holder = TemplateHolder {
      template: None,
      template_ref: Some(&r),
    };

    let first = resolver.resolve(&wf, holder, &TemplateScope::Workflow).await.unwrap();
    assert_eq!(first.newly_stored.as_deref(), Some("namespaced/lib/build"));
    assert!(first.store_into(&mut wf));

    store.put_workflow_template(library("argo", "lib", vec![container("build", "golang:1.23")]));
    let second = resolver.resolve(&wf, holder, &TemplateScope::Workflow).await.unwrap();
    assert!(second.newly_stored.is_none());
    let TemplateKind::Container(c) = &second.template.kind else {
      panic!("expected a container template");
    };
    assert_eq!(c.image, "golang:1.22");
  }

  #[tokio::test]
  async fn test_names_inside_reference_resolve_in_its_scope() {
    let store = Arc::new(InMemoryTemplateStore::new());
    store.put_cluster_workflow_template(library(
      "",
      "shared",
      vec![steps("pipeline", "main"), container("main", "busybox")],
    ));
    let resolver = TemplateResolver::new(store);
    let wf = workflow();
    let r = reference("shared", "pipeline", true);
    let outer = resolver
      .resolve(
        &wf,
        TemplateHolder {
          template: None,
          template_ref: Some(&r),
        },
        &TemplateScope::Workflow,
      )
      .await
      .unwrap();
    assert_eq!(
      outer.scope,
      TemplateScope::ClusterWorkflowTemplate {
        name: "shared".to_string()
      }
    );

    // "main" exists in both places; the library's copy wins.
    let inner = resolver
      .resolve(&wf, TemplateHolder::local("main"), &outer.scope)
      .await
      .unwrap();
    let TemplateKind::Container(c) = &inner.template.kind else {
      panic!("expected a container template");
    };
    assert_eq!(c.image, "busybox");
    assert_eq!(inner.newly_stored.as_deref(), Some("cluster/shared/main"));
  }

  #[tokio::test]
  async fn test_missing_templates() {
    let resolver = TemplateResolver::new(Arc::new(EmptyTemplateStore));
    let wf = workflow();
    let err = resolver
      .resolve(&wf, TemplateHolder::local("nope"), &TemplateScope::Workflow)
      .await
      .unwrap_err();
    assert!(matches!(err, ResolveError::TemplateNotFound { .. }));

    let r = reference("lib", "build", false);
    let err = resolver
      .resolve(
        &wf,
        TemplateHolder {
          template: None,
          template_ref: Some(&r),
        },
        &TemplateScope::Workflow,
      )
      .await
      .unwrap_err();
    assert!(matches!(err, ResolveError::WorkflowTemplateNotFound { .. }));
    assert!(!err.is_transient());

    let err = resolver
      .resolve(
        &wf,
        TemplateHolder {
          template: None,
          template_ref: None,
        },
        &TemplateScope::Workflow,
      )
      .await
      .unwrap_err();
    assert!(matches!(err, ResolveError::NoTemplate { .. }));
  }
}
