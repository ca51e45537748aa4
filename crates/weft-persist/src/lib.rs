//! Weft persistence
//!
//! Relational storage for the workflow controller:
//! - versioned schema migration driven by a single `schema_history` row
//! - node-status offload for node maps too large to keep on the workflow
//! - the archive of completed workflows, queryable by label selector
//! - the semaphore store behind `database` locks shared across controllers
//!
//! Postgres, MySQL and SQLite are reached through one [`Session`]; SQL is
//! written with `?` placeholders and rendered per [`Dialect`].

mod archive;
mod dialect;
mod error;
mod labels;
mod marshal;
mod migrate;
mod offload;
mod persistence;
mod selector;
mod session;
mod sync_store;

pub use archive::{LABEL_ARCHIVING_STATUS, NullWorkflowArchive, SqlWorkflowArchive, WorkflowArchive};
pub use dialect::{Dialect, format_timestamp, parse_timestamp};
pub use error::PersistError;
pub use labels::{Operator, Requirement, Selector};
pub use marshal::{escape_raw, from_raw_json, to_raw_json, unescape_raw};
pub use migrate::{
  ARCHIVE_LABELS_TABLE, ARCHIVE_TABLE, DEFAULT_OFFLOAD_TABLE, Migrate, SCHEMA_HISTORY_TABLE, Tables,
};
pub use offload::{
  DEFAULT_OFFLOAD_TTL, DisabledOffloadRepo, OffloadKey, OffloadNodeStatusRepo, SqlOffloadRepo, node_status_version,
};
pub use persistence::Persistence;
pub use selector::{ListOptions, NameFilter, Predicate, SelectorBuilder};
pub use session::{Param, RetryConfig, Session};
pub use sync_store::{SYNC_SCHEMA_HISTORY_TABLE, SqlSemaphoreStore, SyncMigrate, SyncStoreOptions, SyncTables};
