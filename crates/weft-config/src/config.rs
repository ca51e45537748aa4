use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use weft_workflow::{ArtifactCredential, ArtifactRepository, Workflow};

use crate::error::ConfigError;
use crate::ttl::Ttl;

/// Cluster name used to scope archive rows when none is configured.
pub const DEFAULT_CLUSTER_NAME: &str = "default";

/// Encoded node maps larger than this are offloaded.
pub const DEFAULT_OFFLOAD_THRESHOLD: usize = 1024 * 1024;

pub const DEFAULT_WORKFLOW_WORKERS: usize = 8;

/// Controller configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
  /// Default repository for workflows without an `artifactRepositoryRef`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub artifact_repository: Option<ArtifactRepository>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub artifact_credentials: Vec<ArtifactCredential>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub persistence: Option<PersistConfig>,
  /// Cap on workflows running at once.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parallelism: Option<u32>,
  /// Recorded on every pod so the runner knows which executor to use.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub container_runtime_executor: Option<String>,
  #[serde(default)]
  pub metrics_config: MetricsConfig,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub links: Vec<Link>,
  /// Merged under every submitted workflow.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub workflow_defaults: Option<Workflow>,
  #[serde(default)]
  pub pod_spec_log_strategy: PodSpecLogStrategy,
  #[serde(default)]
  pub node_events: NodeEvents,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub workflow_workers: Option<usize>,
  /// Only workflows labelled with this instance id are reconciled.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub instance_id: Option<String>,
  /// Database shared by controllers for `database` semaphores and mutexes.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub synchronization: Option<SyncConfig>,
}

impl Config {
  /// `~/.weft/config.yaml`
  pub fn default_path() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
    Ok(home.join(".weft").join("config.yaml"))
  }

  /// Load from YAML, or JSON when the file ends in `.json`.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
      path: path.display().to_string(),
      source,
    })?;
    Self::parse(path, &raw)
  }

  pub fn parse(path: &Path, raw: &str) -> Result<Self, ConfigError> {
    if raw.trim().is_empty() {
      return Ok(Config::default());
    }
    match path.extension().and_then(|e| e.to_str()) {
      Some("json") => Ok(serde_json::from_str(raw)?),
      _ => Ok(serde_yaml::from_str(raw)?),
    }
  }

  pub fn workflow_workers(&self) -> usize {
    self
      .workflow_workers
      .filter(|w| *w > 0)
      .unwrap_or(DEFAULT_WORKFLOW_WORKERS)
  }

  pub fn node_status_offload_enabled(&self) -> bool {
    self.persistence.as_ref().is_some_and(|p| p.node_status_offload)
  }

  pub fn archive_enabled(&self) -> bool {
    self.persistence.as_ref().is_some_and(|p| p.archive)
  }

  /// Links of `scope` rendered for `wf`.
  pub fn links_for(&self, scope: &str, wf: &Workflow) -> Vec<Link> {
    self
      .links
      .iter()
      .filter(|link| link.scope == scope)
      .map(|link| link.render(wf))
      .collect()
  }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistConfig {
  #[serde(default)]
  pub node_status_offload: bool,
  #[serde(default)]
  pub archive: bool,
  /// Only workflows matching this label selector are archived.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub archive_label_selector: Option<String>,
  /// Archived workflows older than this are deleted. Zero keeps them forever.
  #[serde(default, rename = "archiveTTL")]
  pub archive_ttl: Ttl,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cluster_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub connection_pool: Option<ConnectionPool>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub offload_threshold: Option<usize>,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub skip_migration: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub postgresql: Option<PostgreSqlConfig>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub mysql: Option<MySqlConfig>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sqlite: Option<SqliteConfig>,
}

impl PersistConfig {
  pub fn cluster_name(&self) -> &str {
    match self.cluster_name.as_deref() {
      Some(name) if !name.is_empty() => name,
      _ => DEFAULT_CLUSTER_NAME,
    }
  }

  pub fn offload_threshold(&self) -> usize {
    self.offload_threshold.unwrap_or(DEFAULT_OFFLOAD_THRESHOLD)
  }

  /// The configured database, if exactly one is set.
  pub fn database(&self) -> Option<DatabaseConfig<'_>> {
    DatabaseConfig::pick(&self.postgresql, &self.mysql, &self.sqlite)
  }
}

pub const DEFAULT_SYNC_CONTROLLER_NAME: &str = "weft-controller";

/// Where database-backed locks live and how this controller takes part.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
  /// Identifies this controller's queue entries and heartbeat.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub controller_name: Option<String>,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub skip_migration: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub limit_table_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub state_table_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub controller_table_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub lock_table_name: Option<String>,
  /// How often waiters are re-checked against the database.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub poll_seconds: Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub heartbeat_seconds: Option<u64>,
  /// Queue entries of controllers silent for longer are ignored.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub inactive_controller_seconds: Option<u64>,
  /// Zero reads the limit from the database on every check.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub semaphore_limit_cache_seconds: Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub connection_pool: Option<ConnectionPool>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub postgresql: Option<PostgreSqlConfig>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub mysql: Option<MySqlConfig>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sqlite: Option<SqliteConfig>,
}

fn table_or(name: &Option<String>, default: &'static str) -> String {
  name.as_deref().filter(|n| !n.is_empty()).unwrap_or(default).to_string()
}

impl SyncConfig {
  pub fn database(&self) -> Option<DatabaseConfig<'_>> {
    DatabaseConfig::pick(&self.postgresql, &self.mysql, &self.sqlite)
  }

  pub fn controller_name(&self) -> &str {
    match self.controller_name.as_deref() {
      Some(name) if !name.is_empty() => name,
      _ => DEFAULT_SYNC_CONTROLLER_NAME,
    }
  }

  pub fn limit_table(&self) -> String {
    table_or(&self.limit_table_name, "sync_limit")
  }

  pub fn state_table(&self) -> String {
    table_or(&self.state_table_name, "sync_state")
  }

  pub fn controller_table(&self) -> String {
    table_or(&self.controller_table_name, "sync_controller")
  }

  pub fn lock_table(&self) -> String {
    table_or(&self.lock_table_name, "sync_lock")
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_seconds.filter(|s| *s > 0).unwrap_or(5))
  }

  pub fn heartbeat_interval(&self) -> Duration {
    Duration::from_secs(self.heartbeat_seconds.filter(|s| *s > 0).unwrap_or(60))
  }

  pub fn inactive_controller_timeout(&self) -> Duration {
    Duration::from_secs(self.inactive_controller_seconds.filter(|s| *s > 0).unwrap_or(300))
  }

  pub fn limit_cache_ttl(&self) -> Duration {
    Duration::from_secs(self.semaphore_limit_cache_seconds.unwrap_or(0))
  }
}

/// Borrowed view of whichever database is configured.
#[derive(Debug, Clone, Copy)]
pub enum DatabaseConfig<'a> {
  Postgres(&'a PostgreSqlConfig),
  MySql(&'a MySqlConfig),
  Sqlite(&'a SqliteConfig),
}

impl<'a> DatabaseConfig<'a> {
  /// The one database set, if exactly one is.
  fn pick(
    postgresql: &'a Option<PostgreSqlConfig>,
    mysql: &'a Option<MySqlConfig>,
    sqlite: &'a Option<SqliteConfig>,
  ) -> Option<Self> {
    match (postgresql, mysql, sqlite) {
      (Some(pg), None, None) => Some(DatabaseConfig::Postgres(pg)),
      (None, Some(my), None) => Some(DatabaseConfig::MySql(my)),
      (None, None, Some(lite)) => Some(DatabaseConfig::Sqlite(lite)),
      _ => None,
    }
  }

  /// Connection URL understood by the database driver.
  pub fn url(&self) -> String {
    match self {
      DatabaseConfig::Postgres(pg) => {
        let mut url = format!(
          "postgres://{}:{}@{}:{}/{}",
          pg.db.username,
          pg.db.password,
          pg.db.host,
          pg.db.port.unwrap_or(5432),
          pg.db.database
        );
        if let Some(mode) = pg.ssl_mode.as_deref().filter(|_| pg.ssl) {
          url.push_str(&format!("?sslmode={mode}"));
        }
        url
      }
      DatabaseConfig::MySql(my) => {
        let mut url = format!(
          "mysql://{}:{}@{}:{}/{}",
          my.db.username,
          my.db.password,
          my.db.host,
          my.db.port.unwrap_or(3306),
          my.db.database
        );
        if !my.options.is_empty() {
          let query: Vec<String> = my.options.iter().map(|(k, v)| format!("{k}={v}")).collect();
          url.push('?');
          url.push_str(&query.join("&"));
        }
        url
      }
      DatabaseConfig::Sqlite(lite) => match lite.path.as_deref() {
        Some(path) => format!("sqlite://{path}?mode=rwc"),
        None => "sqlite::memory:".to_string(),
      },
    }
  }

  /// Name of the offload table.
  pub fn table_name(&self) -> &str {
    let name = match self {
      DatabaseConfig::Postgres(pg) => pg.db.table_name.as_deref(),
      DatabaseConfig::MySql(my) => my.db.table_name.as_deref(),
      DatabaseConfig::Sqlite(lite) => lite.table_name.as_deref(),
    };
    name.filter(|n| !n.is_empty()).unwrap_or("argo_workflows")
  }
}

/// Fields shared by the networked databases.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbConfig {
  #[serde(default)]
  pub host: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub port: Option<u16>,
  #[serde(default)]
  pub database: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub table_name: Option<String>,
  #[serde(default)]
  pub username: String,
  #[serde(default, skip_serializing)]
  pub password: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostgreSqlConfig {
  #[serde(flatten)]
  pub db: DbConfig,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub ssl: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ssl_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MySqlConfig {
  #[serde(flatten)]
  pub db: DbConfig,
  /// Extra connection parameters appended to the URL.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqliteConfig {
  /// Database file; in-memory when unset.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub path: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub table_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPool {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_idle_conns: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_open_conns: Option<u32>,
  #[serde(default)]
  pub conn_max_lifetime: Ttl,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub enabled: Option<bool>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub path: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub port: Option<u16>,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub ignore_errors: bool,
}

impl MetricsConfig {
  pub fn enabled(&self) -> bool {
    self.enabled.unwrap_or(true)
  }

  pub fn path(&self) -> &str {
    self.path.as_deref().unwrap_or("/metrics")
  }

  pub fn port(&self) -> u16 {
    self.port.unwrap_or(9090)
  }
}

/// A link shown alongside workflows, e.g. to a log aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Link {
  pub name: String,
  /// `workflow`, `pod` or `workflow-list`.
  #[serde(default)]
  pub scope: String,
  pub url: String,
}

impl Link {
  /// The link with workflow placeholders in its url filled in. Both
  /// `{{workflow.name}}` and `${metadata.name}` forms are understood.
  pub fn render(&self, wf: &Workflow) -> Link {
    let replacements = [
      ("workflow.name", wf.name()),
      ("workflow.namespace", wf.namespace()),
      ("workflow.uid", wf.metadata.uid.as_str()),
      ("metadata.name", wf.name()),
      ("metadata.namespace", wf.namespace()),
      ("metadata.uid", wf.metadata.uid.as_str()),
    ];
    let mut url = self.url.clone();
    for (key, value) in replacements {
      url = url.replace(&format!("{{{{{key}}}}}"), value).replace(&format!("${{{key}}}"), value);
    }
    Link {
      url,
      ..self.clone()
    }
  }
}

/// Which pods to keep for log inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpecLogStrategy {
  #[serde(default)]
  pub failed_pod: bool,
  #[serde(default)]
  pub all_pods: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeEvents {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub enabled: Option<bool>,
}

impl NodeEvents {
  pub fn enabled(&self) -> bool {
    self.enabled.unwrap_or(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const YAML: &str = r#"
artifactRepository:
  archiveLogs: true
  s3:
    endpoint: minio:9000
    bucket: my-bucket
    keyPrefix: artifacts
persistence:
  nodeStatusOffload: true
  archive: true
  archiveTTL: 7d
  clusterName: east
  connectionPool:
    maxIdleConns: 5
    maxOpenConns: 10
    connMaxLifetime: 300s
  postgresql:
    host: db
    port: 5432
    database: weft
    username: weft
    password: secret
parallelism: 10
metricsConfig:
  enabled: true
  port: 9091
links:
  - name: logs
    scope: workflow
    url: http://logs/{{workflow.name}}
podSpecLogStrategy:
  failedPod: true
nodeEvents:
  enabled: false
workflowWorkers: 4
"#;

  #[test]
  fn test_parse_full_config() {
    let config = Config::parse(Path::new("config.yaml"), YAML).unwrap();
    assert!(config.artifact_repository.is_some());
    assert_eq!(config.parallelism, Some(10));
    assert_eq!(config.workflow_workers(), 4);
    assert!(!config.node_events.enabled());
    assert_eq!(config.metrics_config.port(), 9091);

    let persistence = config.persistence.as_ref().unwrap();
    assert!(config.node_status_offload_enabled());
    assert!(config.archive_enabled());
    assert_eq!(persistence.archive_ttl.duration(), Duration::from_secs(7 * 86_400));
    assert_eq!(persistence.cluster_name(), "east");
    assert_eq!(persistence.offload_threshold(), DEFAULT_OFFLOAD_THRESHOLD);

    let db = persistence.database().unwrap();
    assert_eq!(db.url(), "postgres://weft:secret@db:5432/weft");
    assert_eq!(db.table_name(), "argo_workflows");
  }

  #[test]
  fn test_links_render_for_workflow_scope() {
    let config = Config::parse(Path::new("config.yaml"), YAML).unwrap();
    let mut wf = Workflow::default();
    wf.metadata.name = "hello".into();
    wf.metadata.namespace = "argo".into();

    let links = config.links_for("workflow", &wf);
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].url, "http://logs/hello");
    assert!(config.links_for("pod", &wf).is_empty());

    let link = Link {
      name: "ui".into(),
      scope: "workflow".into(),
      url: "https://ui/${metadata.namespace}/${metadata.name}".into(),
    };
    assert_eq!(link.render(&wf).url, "https://ui/argo/hello");
  }

  #[test]
  fn test_defaults() {
    let config = Config::parse(Path::new("config.yaml"), "").unwrap();
    assert_eq!(config.workflow_workers(), DEFAULT_WORKFLOW_WORKERS);
    assert!(!config.archive_enabled());
    assert!(config.node_events.enabled());
    assert_eq!(PersistConfig::default().cluster_name(), DEFAULT_CLUSTER_NAME);
  }

  #[test]
  fn test_json_by_extension() {
    let config = Config::parse(
      Path::new("config.json"),
      r#"{"persistence": {"sqlite": {}, "archive": true}}"#,
    )
    .unwrap();
    let db = config.persistence.as_ref().and_then(|p| p.database()).unwrap();
    assert_eq!(db.url(), "sqlite::memory:");
  }

  #[test]
  fn test_sync_database_defaults() {
    let config = Config::parse(
      Path::new("config.yaml"),
      "synchronization:\n  controllerName: east-1\n  pollSeconds: 2\n  sqlite:\n    path: /tmp/locks.db\n",
    )
    .unwrap();
    let sync = config.synchronization.as_ref().unwrap();
    assert_eq!(sync.controller_name(), "east-1");
    assert_eq!(sync.poll_interval(), Duration::from_secs(2));
    assert_eq!(sync.heartbeat_interval(), Duration::from_secs(60));
    assert_eq!(sync.inactive_controller_timeout(), Duration::from_secs(300));
    assert!(sync.limit_cache_ttl().is_zero());
    assert_eq!(sync.state_table(), "sync_state");
    assert_eq!(sync.database().unwrap().url(), "sqlite:///tmp/locks.db?mode=rwc");
    assert_eq!(SyncConfig::default().controller_name(), DEFAULT_SYNC_CONTROLLER_NAME);
  }

  #[test]
  fn test_two_databases_is_none() {
    let persistence = PersistConfig {
      postgresql: Some(PostgreSqlConfig::default()),
      mysql: Some(MySqlConfig::default()),
      ..Default::default()
    };
    assert!(persistence.database().is_none());
  }
}
