use sqlx::Row;
use tracing::{debug, info, instrument};

use crate::dialect::Dialect;
use crate::error::PersistError;
use crate::session::{Param, Session};

pub const DEFAULT_OFFLOAD_TABLE: &str = "argo_workflows";
pub const ARCHIVE_TABLE: &str = "argo_archived_workflows";
pub const ARCHIVE_LABELS_TABLE: &str = "argo_archived_workflows_labels";
pub const SCHEMA_HISTORY_TABLE: &str = "schema_history";

/// Table names in use. Only the offload table is configurable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tables {
  pub offload: String,
  pub archived: String,
  pub archived_labels: String,
  pub schema_history: String,
}

impl Tables {
  pub fn new(offload: &str) -> Self {
    Self {
      offload: offload.to_string(),
      ..Self::default()
    }
  }
}

impl Default for Tables {
  fn default() -> Self {
    Self {
      offload: DEFAULT_OFFLOAD_TABLE.to_string(),
      archived: ARCHIVE_TABLE.to_string(),
      archived_labels: ARCHIVE_LABELS_TABLE.to_string(),
      schema_history: SCHEMA_HISTORY_TABLE.to_string(),
    }
  }
}

/// Ordered schema changes tracked by a single version row.
///
/// Change `i` runs only if it moves the recorded version from `i - 1` to
/// `i`, inside the same transaction, so a change never applies twice.
/// Entries are append-only: existing databases have already run the
/// earlier ones.
pub struct Migrate<'a> {
  session: &'a Session,
  tables: &'a Tables,
  cluster_name: &'a str,
}

impl<'a> Migrate<'a> {
  pub fn new(session: &'a Session, tables: &'a Tables, cluster_name: &'a str) -> Self {
    Self {
      session,
      tables,
      cluster_name,
    }
  }

  fn changes(&self) -> Vec<String> {
    let d: Dialect = self.session.dialect();
    let ts = d.timestamp_type();
    let text = d.text_type();
    let offload = &self.tables.offload;
    let archived = &self.tables.archived;
    let labels = &self.tables.archived_labels;
    vec![
      format!(
        "create table if not exists {offload} (
    name varchar(256) not null,
    namespace varchar(256) not null,
    version varchar(64) not null,
    nodes {text} not null,
    updatedat {ts} not null,
    primary key (name, namespace, version)
)"
      ),
      format!("create index {offload}_i1 on {offload} (namespace, updatedat)"),
      format!(
        "create table if not exists {archived} (
    clustername varchar(64) not null,
    uid varchar(128) not null,
    name varchar(256) not null,
    namespace varchar(256) not null,
    phase varchar(25) not null,
    workflow {text} not null,
    startedat {ts} not null,
    finishedat {ts} not null,
    primary key (clustername, uid)
)"
      ),
      format!("create index {archived}_i1 on {archived} (clustername, namespace)"),
      format!("alter table {archived} add column resourceversion varchar(64)"),
      format!("alter table {archived} add column instanceid varchar(64)"),
      format!("update {archived} set instanceid = '' where instanceid is null"),
      d.drop_index(&format!("{archived}_i1"), archived),
      format!("create index {archived}_i1 on {archived} (clustername, instanceid, namespace)"),
      // "name" rather than "key", which is reserved.
      format!(
        "create table if not exists {labels} (
    clustername varchar(64) not null,
    uid varchar(128) not null,
    name varchar(317) not null,
    value varchar(63) not null,
    primary key (clustername, uid, name),
    foreign key (clustername, uid) references {archived}(clustername, uid) on delete cascade
)"
      ),
      format!("create index {archived}_i2 on {archived} (clustername, instanceid, finishedat)"),
    ]
  }

  /// Number of schema changes known to this build.
  pub fn latest_version(&self) -> i64 {
    self.changes().len() as i64 - 1
  }

  /// Bring the schema up to date. Returns how many changes were applied.
  #[instrument(skip(self), fields(cluster_name = %self.cluster_name, dialect = self.session.dialect().as_str()))]
  pub async fn exec(&self) -> Result<usize, PersistError> {
    apply_changes(self.session, &self.tables.schema_history, &self.changes()).await
  }

  /// The recorded schema version, or `None` before the first migration.
  pub async fn current_version(&self) -> Result<Option<i64>, PersistError> {
    let sql = format!(
      "select cast(schema_version as {}) as schema_version from {}",
      self.session.dialect().bigint_cast(),
      self.tables.schema_history
    );
    match self.session.fetch_optional("read_schema_version", &sql, &[]).await {
      Ok(row) => Ok(row.map(|r| r.try_get::<i64, _>("schema_version")).transpose()?),
      Err(PersistError::Database(_)) => Ok(None),
      Err(e) => Err(e),
    }
  }
}

/// Run `changes` in order against the version row in `history`. Returns
/// how many were applied.
pub(crate) async fn apply_changes(session: &Session, history: &str, changes: &[String]) -> Result<usize, PersistError> {
  session
    .execute(
      "create_schema_history",
      &format!("create table if not exists {history} (schema_version int not null)"),
      &[],
    )
    .await?;
  let rows = session
    .fetch_all("read_schema_history", &format!("select schema_version from {history}"), &[])
    .await?;
  if rows.is_empty() {
    session
      .execute("seed_schema_history", &format!("insert into {history} values(-1)"), &[])
      .await?;
  }

  info!(history, "migrating_database_schema");
  let update = format!("update {history} set schema_version = ? where schema_version = ?");
  let mut applied = 0;
  for (version, change) in changes.iter().enumerate() {
    let mut tx = session.begin().await?;
    let moved = session
      .execute_in(&mut tx, &update, &[Param::Int(version as i64), Param::Int(version as i64 - 1)])
      .await?;
    if moved == 1 {
      info!(version, "applying_schema_change");
      session
        .execute_in(&mut tx, change, &[])
        .await
        .map_err(|e| match e {
          PersistError::Database(source) => PersistError::Migration { version, source },
          other => other,
        })?;
      applied += 1;
    } else {
      debug!(version, "schema_change_already_applied");
    }
    tx.commit().await?;
  }
  Ok(applied)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_migrate_twice_is_stable() {
    let session = Session::connect("sqlite::memory:", None).await.unwrap();
    let tables = Tables::default();
    let migrate = Migrate::new(&session, &tables, "default");

    assert_eq!(migrate.current_version().await.unwrap(), None);
    let applied = migrate.exec().await.unwrap();
    assert_eq!(applied as i64, migrate.latest_version() + 1);
    assert_eq!(migrate.current_version().await.unwrap(), Some(migrate.latest_version()));

    assert_eq!(migrate.exec().await.unwrap(), 0);
    assert_eq!(migrate.current_version().await.unwrap(), Some(migrate.latest_version()));
  }

  #[tokio::test]
  async fn test_custom_offload_table() {
    let session = Session::connect("sqlite::memory:", None).await.unwrap();
    let tables = Tables::new("my_offload");
    Migrate::new(&session, &tables, "default").exec().await.unwrap();
    let rows = session
      .fetch_all("list_offload_table", "select name from my_offload", &[])
      .await
      .unwrap();
    assert!(rows.is_empty());
  }
}
