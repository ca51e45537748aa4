use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::any::AnyRow;
use tracing::{debug, info, instrument};
use weft_workflow::Workflow;

use crate::dialect::format_timestamp;
use crate::error::PersistError;
use crate::marshal::{from_raw_json, to_raw_json};
use crate::migrate::Tables;
use crate::selector::{ListOptions, Predicate, SelectorBuilder};
use crate::session::{Param, Session};

/// Set on every archived copy so readers can tell it apart from a live object.
pub const LABEL_ARCHIVING_STATUS: &str = "weft.dev/workflow-archiving-status";

/// Queryable record of completed workflows.
#[async_trait]
pub trait WorkflowArchive: Send + Sync {
  /// Replace any prior snapshot of this uid together with its labels.
  async fn archive_workflow(&self, wf: &Workflow) -> Result<(), PersistError>;

  /// Matching workflows without their node maps.
  async fn list_workflows(&self, options: &ListOptions) -> Result<Vec<Workflow>, PersistError>;

  async fn count_workflows(&self, options: &ListOptions) -> Result<i64, PersistError>;

  /// Whether a page exists after the one `options` describes.
  async fn has_more_workflows(&self, options: &ListOptions) -> Result<bool, PersistError>;

  /// By uid, or the latest run of `namespace/name` when `uid` is empty.
  async fn get_workflow(&self, uid: &str, namespace: &str, name: &str) -> Result<Option<Workflow>, PersistError>;

  async fn delete_workflow(&self, uid: &str) -> Result<(), PersistError>;

  /// Drop workflows that finished more than `ttl` ago. Returns how many.
  async fn delete_expired_workflows(&self, ttl: Duration) -> Result<u64, PersistError>;

  async fn list_workflows_label_keys(&self) -> Result<Vec<String>, PersistError>;

  async fn list_workflows_label_values(&self, key: &str) -> Result<Vec<String>, PersistError>;

  fn is_enabled(&self) -> bool;
}

fn workflow_column(row: &AnyRow) -> Result<Workflow, PersistError> {
  let raw: String = row.try_get("workflow")?;
  from_raw_json(&raw)
}

pub struct SqlWorkflowArchive {
  session: Session,
  tables: Tables,
  cluster_name: String,
  managed_namespace: Option<String>,
  instance_id: String,
}

impl SqlWorkflowArchive {
  pub fn new(session: Session, tables: Tables, cluster_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
    Self {
      session,
      tables,
      cluster_name: cluster_name.into(),
      managed_namespace: None,
      instance_id: instance_id.into(),
    }
  }

  /// Restrict every query to one namespace.
  pub fn with_managed_namespace(mut self, namespace: impl Into<String>) -> Self {
    self.managed_namespace = Some(namespace.into()).filter(|ns: &String| !ns.is_empty());
    self
  }

  fn builder(&self) -> SelectorBuilder<'_> {
    SelectorBuilder {
      table: &self.tables.archived,
      labels_table: &self.tables.archived_labels,
      dialect: self.session.dialect(),
    }
  }

  /// Cluster, instance and managed-namespace scoping shared by every query.
  fn scope(&self) -> Predicate {
    let predicate = Predicate::new()
      .and("clustername = ?", [Param::from(self.cluster_name.as_str())])
      .and("instanceid = ?", [Param::from(self.instance_id.as_str())]);
    match &self.managed_namespace {
      Some(ns) => predicate.and("namespace = ?", [Param::from(ns.as_str())]),
      None => predicate,
    }
  }

  fn summarize(mut wf: Workflow) -> Workflow {
    wf.status.nodes.clear();
    wf.status.stored_templates.clear();
    wf
  }
}

#[async_trait]
impl WorkflowArchive for SqlWorkflowArchive {
  #[instrument(skip(self, wf), fields(workflow = %wf.key(), uid = %wf.metadata.uid))]
  async fn archive_workflow(&self, wf: &Workflow) -> Result<(), PersistError> {
    if wf.metadata.uid.is_empty() {
      return Err(PersistError::InvalidRequest(format!(
        "workflow {} has no uid and cannot be archived",
        wf.key()
      )));
    }
    let mut wf = wf.clone();
    wf.metadata
      .labels
      .insert(LABEL_ARCHIVING_STATUS.to_string(), "Persisted".to_string());
    let raw = to_raw_json(&wf)?;

    let dialect = self.session.dialect();
    let ts = dialect.timestamp_param();
    let now = Utc::now();
    let started = format_timestamp(wf.status.started_at.unwrap_or(now));
    let finished = format_timestamp(wf.status.finished_at.unwrap_or(now));
    let archived = &self.tables.archived;
    let labels = &self.tables.archived_labels;
    let uid = wf.metadata.uid.as_str();
    let cluster = self.cluster_name.as_str();

    let mut tx = self.session.begin().await?;
    // Labels first: not every backend enforces the cascade.
    self
      .session
      .execute_in(
        &mut tx,
        &format!("delete from {labels} where clustername = ? and uid = ?"),
        &[cluster.into(), uid.into()],
      )
      .await?;
    self
      .session
      .execute_in(
        &mut tx,
        &format!("delete from {archived} where clustername = ? and uid = ?"),
        &[cluster.into(), uid.into()],
      )
      .await?;
    self
      .session
      .execute_in(
        &mut tx,
        &format!(
          "insert into {archived} (clustername, instanceid, uid, name, namespace, phase, workflow, startedat, finishedat, resourceversion) values (?, ?, ?, ?, ?, ?, ?, {ts}, {ts}, ?)"
        ),
        &[
          cluster.into(),
          self.instance_id.as_str().into(),
          uid.into(),
          wf.name().into(),
          wf.namespace().into(),
          wf.status.phase.as_str().into(),
          raw.into(),
          started.into(),
          finished.into(),
          wf.metadata.resource_version.as_str().into(),
        ],
      )
      .await?;
    let insert_label = format!("insert into {labels} (clustername, uid, name, value) values (?, ?, ?, ?)");
    for (key, value) in &wf.metadata.labels {
      self
        .session
        .execute_in(
          &mut tx,
          &insert_label,
          &[cluster.into(), uid.into(), key.as_str().into(), value.as_str().into()],
        )
        .await?;
    }
    tx.commit().await?;
    info!(labels = wf.metadata.labels.len(), "workflow_archived");
    Ok(())
  }

  async fn list_workflows(&self, options: &ListOptions) -> Result<Vec<Workflow>, PersistError> {
    let builder = self.builder();
    let predicate = builder.filter(self.scope(), options);
    let sql = format!(
      "select workflow from {}{}{}",
      self.tables.archived,
      predicate.where_sql(),
      builder.order_and_page(options)
    );
    let rows = self
      .session
      .fetch_all("archive_list", &sql, predicate.params())
      .await?;
    rows
      .iter()
      .map(|row| workflow_column(row).map(Self::summarize))
      .collect()
  }

  async fn count_workflows(&self, options: &ListOptions) -> Result<i64, PersistError> {
    let predicate = self.builder().filter(self.scope(), options);
    let sql = format!(
      "select cast(count(*) as {}) as total from {}{}",
      self.session.dialect().bigint_cast(),
      self.tables.archived,
      predicate.where_sql()
    );
    let row = self
      .session
      .fetch_optional("archive_count", &sql, predicate.params())
      .await?;
    Ok(row.map(|r| r.try_get::<i64, _>("total")).transpose()?.unwrap_or(0))
  }

  async fn has_more_workflows(&self, options: &ListOptions) -> Result<bool, PersistError> {
    if options.limit == 0 {
      return Ok(false);
    }
    let next = ListOptions {
      limit: 1,
      offset: options.offset + options.limit,
      ..options.clone()
    };
    let builder = self.builder();
    let predicate = builder.filter(self.scope(), &next);
    let sql = format!(
      "select uid from {}{}{}",
      self.tables.archived,
      predicate.where_sql(),
      builder.order_and_page(&next)
    );
    let row = self
      .session
      .fetch_optional("archive_has_more", &sql, predicate.params())
      .await?;
    Ok(row.is_some())
  }

  async fn get_workflow(&self, uid: &str, namespace: &str, name: &str) -> Result<Option<Workflow>, PersistError> {
    let dialect = self.session.dialect();
    let (predicate, suffix) = if !uid.is_empty() {
      (self.scope().and("uid = ?", [Param::from(uid)]), String::new())
    } else if !namespace.is_empty() && !name.is_empty() {
      (
        self
          .scope()
          .and("namespace = ?", [Param::from(namespace)])
          .and("name = ?", [Param::from(name)]),
        format!(" order by startedat desc{}", dialect.limit_clause(1, 0)),
      )
    } else {
      return Err(PersistError::InvalidRequest(
        "either a uid or both namespace and name are required".to_string(),
      ));
    };
    let sql = format!(
      "select workflow from {}{}{suffix}",
      self.tables.archived,
      predicate.where_sql()
    );
    let row = self
      .session
      .fetch_optional("archive_get", &sql, predicate.params())
      .await?;
    row.as_ref().map(workflow_column).transpose()
  }

  #[instrument(skip(self))]
  async fn delete_workflow(&self, uid: &str) -> Result<(), PersistError> {
    let scope = self.scope().and("uid = ?", [Param::from(uid)]);
    let mut tx = self.session.begin().await?;
    self
      .session
      .execute_in(
        &mut tx,
        &format!(
          "delete from {} where clustername = ? and uid = ?",
          self.tables.archived_labels
        ),
        &[self.cluster_name.as_str().into(), uid.into()],
      )
      .await?;
    let deleted = self
      .session
      .execute_in(
        &mut tx,
        &format!("delete from {}{}", self.tables.archived, scope.where_sql()),
        scope.params(),
      )
      .await?;
    tx.commit().await?;
    debug!(deleted, "archived_workflow_deleted");
    Ok(())
  }

  #[instrument(skip(self))]
  async fn delete_expired_workflows(&self, ttl: Duration) -> Result<u64, PersistError> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    let cutoff = Utc::now()
      .checked_sub_signed(ttl)
      .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
    let scope = self.scope().and(
      format!("finishedat < {}", self.session.dialect().timestamp_param()),
      [Param::Text(format_timestamp(cutoff))],
    );
    let archived = &self.tables.archived;

    let mut tx = self.session.begin().await?;
    let mut label_params = vec![Param::from(self.cluster_name.as_str())];
    label_params.extend(scope.params().iter().cloned());
    self
      .session
      .execute_in(
        &mut tx,
        &format!(
          "delete from {} where clustername = ? and uid in (select uid from {archived}{})",
          self.tables.archived_labels,
          scope.where_sql()
        ),
        &label_params,
      )
      .await?;
    let deleted = self
      .session
      .execute_in(
        &mut tx,
        &format!("delete from {archived}{}", scope.where_sql()),
        scope.params(),
      )
      .await?;
    tx.commit().await?;
    info!(deleted, "expired_archived_workflows_deleted");
    Ok(deleted)
  }

  async fn list_workflows_label_keys(&self) -> Result<Vec<String>, PersistError> {
    let rows = self
      .session
      .fetch_all(
        "archive_label_keys",
        &format!(
          "select distinct name from {} where clustername = ? order by name",
          self.tables.archived_labels
        ),
        &[self.cluster_name.as_str().into()],
      )
      .await?;
    Ok(rows.iter().map(|r| r.try_get::<String, _>("name")).collect::<Result<_, _>>()?)
  }

  async fn list_workflows_label_values(&self, key: &str) -> Result<Vec<String>, PersistError> {
    let rows = self
      .session
      .fetch_all(
        "archive_label_values",
        &format!(
          "select distinct value from {} where clustername = ? and name = ? order by value",
          self.tables.archived_labels
        ),
        &[self.cluster_name.as_str().into(), key.into()],
      )
      .await?;
    Ok(rows.iter().map(|r| r.try_get::<String, _>("value")).collect::<Result<_, _>>()?)
  }

  fn is_enabled(&self) -> bool {
    true
  }
}

/// Archive used when archiving is switched off: writes vanish, reads are empty.
#[derive(Debug, Clone, Default)]
pub struct NullWorkflowArchive;

#[async_trait]
impl WorkflowArchive for NullWorkflowArchive {
  async fn archive_workflow(&self, _wf: &Workflow) -> Result<(), PersistError> {
    Ok(())
  }

  async fn list_workflows(&self, _options: &ListOptions) -> Result<Vec<Workflow>, PersistError> {
    Ok(Vec::new())
  }

  async fn count_workflows(&self, _options: &ListOptions) -> Result<i64, PersistError> {
    Ok(0)
  }

  async fn has_more_workflows(&self, _options: &ListOptions) -> Result<bool, PersistError> {
    Ok(false)
  }

  async fn get_workflow(&self, _uid: &str, _namespace: &str, _name: &str) -> Result<Option<Workflow>, PersistError> {
    Ok(None)
  }

  async fn delete_workflow(&self, _uid: &str) -> Result<(), PersistError> {
    Ok(())
  }

  async fn delete_expired_workflows(&self, _ttl: Duration) -> Result<u64, PersistError> {
    Ok(0)
  }

  async fn list_workflows_label_keys(&self) -> Result<Vec<String>, PersistError> {
    Ok(Vec::new())
  }

  async fn list_workflows_label_values(&self, _key: &str) -> Result<Vec<String>, PersistError> {
    Ok(Vec::new())
  }

  fn is_enabled(&self) -> bool {
    false
  }
}
