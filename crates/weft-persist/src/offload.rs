use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::any::AnyRow;
use tracing::{debug, info, instrument};
use weft_workflow::{Nodes, fnv32a};

use crate::dialect::format_timestamp;
use crate::error::PersistError;
use crate::marshal::{from_raw_json, to_raw_json};
use crate::session::{Param, Session};

/// Offloads untouched for this long are reported by
/// [`OffloadNodeStatusRepo::list_old_offloads`].
pub const DEFAULT_OFFLOAD_TTL: Duration = Duration::from_secs(5 * 60);

/// Identity of one stored node map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OffloadKey {
  pub name: String,
  pub namespace: String,
  pub version: String,
}

/// `fnv:<hash>` of the node map's canonical JSON.
pub fn node_status_version(nodes: &Nodes) -> Result<String, PersistError> {
  let canonical = serde_json::to_string(nodes)?;
  Ok(format!("fnv:{}", fnv32a(canonical.as_bytes())))
}

/// Out-of-band storage for node maps too large to keep on the workflow.
#[async_trait]
pub trait OffloadNodeStatusRepo: Send + Sync {
  /// Store `nodes` and return their version. Older versions of the same
  /// workflow are swept afterwards.
  async fn save(&self, name: &str, namespace: &str, nodes: &Nodes) -> Result<String, PersistError>;

  /// The stored map for `version`, or the most recently written one.
  async fn get(&self, name: &str, namespace: &str, version: Option<&str>) -> Result<Nodes, PersistError>;

  /// Every stored map in `namespace`, or in all namespaces when empty.
  async fn list(&self, namespace: &str) -> Result<BTreeMap<OffloadKey, Nodes>, PersistError>;

  /// Rows not written within the retention window.
  async fn list_old_offloads(&self, namespace: &str) -> Result<Vec<OffloadKey>, PersistError>;

  async fn delete(&self, name: &str, namespace: &str, version: &str) -> Result<(), PersistError>;

  fn is_enabled(&self) -> bool;
}

fn offload_key(row: &AnyRow) -> Result<OffloadKey, PersistError> {
  Ok(OffloadKey {
    name: row.try_get("name")?,
    namespace: row.try_get("namespace")?,
    version: row.try_get("version")?,
  })
}

pub struct SqlOffloadRepo {
  session: Session,
  table: String,
  ttl: Duration,
}

impl SqlOffloadRepo {
  pub fn new(session: Session, table: impl Into<String>) -> Self {
    Self {
      session,
      table: table.into(),
      ttl: DEFAULT_OFFLOAD_TTL,
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  fn decode(&self, raw: &str) -> Result<Nodes, PersistError> {
    from_raw_json(raw)
  }
}

#[async_trait]
impl OffloadNodeStatusRepo for SqlOffloadRepo {
  #[instrument(skip(self, nodes), fields(table = %self.table))]
  async fn save(&self, name: &str, namespace: &str, nodes: &Nodes) -> Result<String, PersistError> {
    let version = node_status_version(nodes)?;
    let raw = to_raw_json(nodes)?;
    let dialect = self.session.dialect();
    let now = format_timestamp(Utc::now());
    let ts = dialect.timestamp_param();

    let insert = dialect.insert_ignore(
      &self.table,
      &["name", "namespace", "version", "nodes", "updatedat"],
      &["?", "?", "?", "?", ts],
    );
    let inserted = self
      .session
      .execute(
        "offload_insert",
        &insert,
        &[
          name.into(),
          namespace.into(),
          version.as_str().into(),
          raw.into(),
          now.as_str().into(),
        ],
      )
      .await?;
    if inserted == 0 {
      // Same logical state written before; mark it current again.
      debug!(name, namespace, version = %version, "offload_duplicate");
      self
        .session
        .execute(
          "offload_touch",
          &format!(
            "update {} set updatedat = {ts} where name = ? and namespace = ? and version = ?",
            self.table
          ),
          &[now.as_str().into(), name.into(), namespace.into(), version.as_str().into()],
        )
        .await?;
    }

    let swept = self
      .session
      .execute(
        "offload_sweep",
        &format!(
          "delete from {} where name = ? and namespace = ? and version <> ? and updatedat < {ts}",
          self.table
        ),
        &[name.into(), namespace.into(), version.as_str().into(), now.into()],
      )
      .await?;
    info!(name, namespace, version = %version, swept, "node_status_offloaded");
    Ok(version)
  }

  async fn get(&self, name: &str, namespace: &str, version: Option<&str>) -> Result<Nodes, PersistError> {
    let dialect = self.session.dialect();
    let row = match version {
      Some(version) => {
        self
          .session
          .fetch_optional(
            "offload_get",
            &format!(
              "select nodes from {} where name = ? and namespace = ? and version = ?",
              self.table
            ),
            &[name.into(), namespace.into(), version.into()],
          )
          .await?
      }
      None => {
        self
          .session
          .fetch_optional(
            "offload_get_latest",
            &format!(
              "select nodes from {} where name = ? and namespace = ? order by updatedat desc{}",
              self.table,
              dialect.limit_clause(1, 0)
            ),
            &[name.into(), namespace.into()],
          )
          .await?
      }
    };
    let row = row.ok_or_else(|| {
      PersistError::NotFound(format!(
        "offloaded nodes for {namespace}/{name} version {}",
        version.unwrap_or("latest")
      ))
    })?;
    self.decode(&row.try_get::<String, _>("nodes")?)
  }

  async fn list(&self, namespace: &str) -> Result<BTreeMap<OffloadKey, Nodes>, PersistError> {
    let (filter, params) = if namespace.is_empty() {
      (String::new(), Vec::new())
    } else {
      (" where namespace = ?".to_string(), vec![Param::from(namespace)])
    };
    let rows = self
      .session
      .fetch_all(
        "offload_list",
        &format!("select name, namespace, version, nodes from {}{filter}", self.table),
        &params,
      )
      .await?;
    let mut out = BTreeMap::new();
    for row in rows {
      let key = offload_key(&row)?;
      let nodes = self.decode(&row.try_get::<String, _>("nodes")?)?;
      out.insert(key, nodes);
    }
    Ok(out)
  }

  async fn list_old_offloads(&self, namespace: &str) -> Result<Vec<OffloadKey>, PersistError> {
    let dialect = self.session.dialect();
    let cutoff = Utc::now() - chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero());
    let mut params = vec![Param::Text(format_timestamp(cutoff))];
    let mut sql = format!(
      "select name, namespace, version from {} where updatedat < {}",
      self.table,
      dialect.timestamp_param()
    );
    if !namespace.is_empty() {
      sql.push_str(" and namespace = ?");
      params.push(namespace.into());
    }
    let rows = self.session.fetch_all("offload_list_old", &sql, &params).await?;
    rows.iter().map(offload_key).collect()
  }

  async fn delete(&self, name: &str, namespace: &str, version: &str) -> Result<(), PersistError> {
    let deleted = self
      .session
      .execute(
        "offload_delete",
        &format!(
          "delete from {} where name = ? and namespace = ? and version = ?",
          self.table
        ),
        &[name.into(), namespace.into(), version.into()],
      )
      .await?;
    debug!(name, namespace, version, deleted, "offload_deleted");
    Ok(())
  }

  fn is_enabled(&self) -> bool {
    true
  }
}

/// Stand-in when offloading is switched off. Every operation fails so a
/// caller can never drop nodes on the floor.
#[derive(Debug, Clone, Default)]
pub struct DisabledOffloadRepo;

#[async_trait]
impl OffloadNodeStatusRepo for DisabledOffloadRepo {
  async fn save(&self, _name: &str, _namespace: &str, _nodes: &Nodes) -> Result<String, PersistError> {
    Err(PersistError::OffloadDisabled)
  }

  async fn get(&self, _name: &str, _namespace: &str, _version: Option<&str>) -> Result<Nodes, PersistError> {
    Err(PersistError::OffloadDisabled)
  }

  async fn list(&self, _namespace: &str) -> Result<BTreeMap<OffloadKey, Nodes>, PersistError> {
    Err(PersistError::OffloadDisabled)
  }

  async fn list_old_offloads(&self, _namespace: &str) -> Result<Vec<OffloadKey>, PersistError> {
    Err(PersistError::OffloadDisabled)
  }

  async fn delete(&self, _name: &str, _namespace: &str, _version: &str) -> Result<(), PersistError> {
    Err(PersistError::OffloadDisabled)
  }

  fn is_enabled(&self) -> bool {
    false
  }
}
