//! Weft Config
//!
//! Controller configuration and the stores it reads through.
//!
//! - [`Config`] is loaded from YAML or JSON (`~/.weft/config.yaml` by default).
//! - [`ConfigWatcher`] hot-reloads it and fires a single callback per change.
//! - [`ConfigMapStore`] is the lookup for semaphore limits and artifact
//!   repository entries.
//! - [`Ttl`] parses retention periods such as `7d`.

mod config;
mod configmap;
mod error;
mod ttl;
mod watcher;

pub use config::{
  Config, ConnectionPool, DEFAULT_CLUSTER_NAME, DEFAULT_OFFLOAD_THRESHOLD, DEFAULT_SYNC_CONTROLLER_NAME,
  DEFAULT_WORKFLOW_WORKERS, DatabaseConfig, DbConfig, Link, MetricsConfig, MySqlConfig, NodeEvents, PersistConfig,
  PodSpecLogStrategy, PostgreSqlConfig, SqliteConfig, SyncConfig,
};
pub use configmap::{ConfigMap, ConfigMapStore, DEFAULT_REPOSITORY_ANNOTATION, InMemoryConfigMaps};
pub use error::ConfigError;
pub use ttl::Ttl;
pub use watcher::{ConfigWatcher, SharedConfig, WatcherHandle};
