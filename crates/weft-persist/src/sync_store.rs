use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::Row;
use sqlx::any::AnyRow;
use tracing::{debug, info, instrument, warn};
use weft_config::SyncConfig;
use weft_sync::{
  DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_INACTIVE_CONTROLLER_TIMEOUT, DEFAULT_POLL_INTERVAL, QueuedHolder,
  SemaphoreStore, StoreLockState, SyncError, limit_name,
};

use crate::dialect::format_timestamp;
use crate::error::PersistError;
use crate::migrate::apply_changes;
use crate::selector::escape_like;
use crate::session::{Param, Session};

pub const SYNC_SCHEMA_HISTORY_TABLE: &str = "sync_schema_history";

/// Tables behind `database` locks. They may be shared by controllers of
/// several clusters, so they have their own schema history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTables {
  pub limit: String,
  pub state: String,
  pub controller: String,
  pub lock: String,
  pub schema_history: String,
}

impl SyncTables {
  pub fn from_config(config: &SyncConfig) -> Self {
    Self {
      limit: config.limit_table(),
      state: config.state_table(),
      controller: config.controller_table(),
      lock: config.lock_table(),
      schema_history: SYNC_SCHEMA_HISTORY_TABLE.to_string(),
    }
  }
}

impl Default for SyncTables {
  fn default() -> Self {
    Self::from_config(&SyncConfig::default())
  }
}

/// Schema changes for [`SyncTables`], tracked like [`crate::Migrate`].
pub struct SyncMigrate<'a> {
  session: &'a Session,
  tables: &'a SyncTables,
}

impl<'a> SyncMigrate<'a> {
  pub fn new(session: &'a Session, tables: &'a SyncTables) -> Self {
    Self { session, tables }
  }

  fn changes(&self) -> Vec<String> {
    let ts = self.session.dialect().timestamp_type();
    let SyncTables {
      limit,
      state,
      controller,
      lock,
      ..
    } = self.tables;
    vec![
      format!(
        "create table if not exists {limit} (
    name varchar(256) not null,
    sizelimit int not null,
    primary key (name)
)"
      ),
      format!(
        "create table if not exists {state} (
    name varchar(256) not null,
    workflowkey varchar(256) not null,
    controller varchar(64) not null,
    held int not null,
    priority int not null,
    time {ts} not null,
    primary key (name, workflowkey)
)"
      ),
      format!("create index {state}_i1 on {state} (name, held)"),
      format!(
        "create table if not exists {controller} (
    controller varchar(64) not null,
    time {ts} not null,
    primary key (controller)
)"
      ),
      format!(
        "create table if not exists {lock} (
    name varchar(256) not null,
    controller varchar(64) not null,
    time {ts} not null,
    primary key (name)
)"
      ),
    ]
  }

  #[instrument(skip(self), fields(dialect = self.session.dialect().as_str()))]
  pub async fn exec(&self) -> Result<usize, PersistError> {
    apply_changes(self.session, &self.tables.schema_history, &self.changes()).await
  }
}

/// Timing knobs of a [`SqlSemaphoreStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStoreOptions {
  pub poll_interval: Duration,
  pub heartbeat_interval: Duration,
  /// Controllers silent for longer are left out of queue order.
  pub inactive_controller_timeout: Duration,
  /// How long a read limit is reused. Zero reads it every time.
  pub limit_cache_ttl: Duration,
}

impl Default for SyncStoreOptions {
  fn default() -> Self {
    Self {
      poll_interval: DEFAULT_POLL_INTERVAL,
      heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
      inactive_controller_timeout: DEFAULT_INACTIVE_CONTROLLER_TIMEOUT,
      limit_cache_ttl: Duration::ZERO,
    }
  }
}

impl SyncStoreOptions {
  pub fn from_config(config: &SyncConfig) -> Self {
    Self {
      poll_interval: config.poll_interval(),
      heartbeat_interval: config.heartbeat_interval(),
      inactive_controller_timeout: config.inactive_controller_timeout(),
      limit_cache_ttl: config.limit_cache_ttl(),
    }
  }
}

fn store_error(operation: &'static str) -> impl FnOnce(PersistError) -> SyncError {
  move |e| SyncError::store(operation, e.to_string(), e.is_transient())
}

fn text(row: &AnyRow, column: &str) -> Result<String, PersistError> {
  Ok(row.try_get::<String, _>(column)?)
}

/// A [`weft_sync::SemaphoreStore`] on a relational database.
///
/// Waiters and holders are rows of the state table. Moving a waiter to the
/// holders happens in a transaction guarded by a row in the lock table, so
/// two controllers never admit past the limit together.
pub struct SqlSemaphoreStore {
  session: Session,
  tables: SyncTables,
  controller: String,
  options: SyncStoreOptions,
  limits: Mutex<HashMap<String, (usize, Instant)>>,
}

impl SqlSemaphoreStore {
  pub fn new(session: Session, tables: SyncTables, controller: impl Into<String>, options: SyncStoreOptions) -> Self {
    Self {
      session,
      tables,
      controller: controller.into(),
      options,
      limits: Mutex::new(HashMap::new()),
    }
  }

  /// Connect to the configured database and migrate unless told not to.
  /// `None` when no database is configured.
  pub async fn from_config(config: &SyncConfig) -> Result<Option<Self>, PersistError> {
    let Some(database) = config.database() else {
      warn!("synchronization_without_database");
      return Ok(None);
    };
    let session = Session::connect(&database.url(), config.connection_pool.as_ref()).await?;
    let tables = SyncTables::from_config(config);
    if config.skip_migration {
      info!("sync_schema_migration_skipped");
    } else {
      SyncMigrate::new(&session, &tables).exec().await?;
    }
    info!(controller = config.controller_name(), "semaphore_store_ready");
    Ok(Some(Self::new(
      session,
      tables,
      config.controller_name(),
      SyncStoreOptions::from_config(config),
    )))
  }

  /// Create or change the limit of `ns/key`.
  pub async fn set_limit(&self, name: &str, limit: usize) -> Result<(), PersistError> {
    let limit = Param::Int(limit as i64);
    let table = &self.tables.limit;
    let updated = self
      .session
      .execute(
        "update_sync_limit",
        &format!("update {table} set sizelimit = ? where name = ?"),
        &[limit.clone(), name.into()],
      )
      .await?;
    if updated == 0 {
      let insert = self
        .session
        .dialect()
        .insert_ignore(table, &["name", "sizelimit"], &["?", "?"]);
      self
        .session
        .execute("insert_sync_limit", &insert, &[name.into(), limit])
        .await?;
    }
    self.limits.lock().remove(name);
    info!(name, "sync_limit_set");
    Ok(())
  }

  pub async fn delete_limit(&self, name: &str) -> Result<bool, PersistError> {
    let deleted = self
      .session
      .execute(
        "delete_sync_limit",
        &format!("delete from {} where name = ?", self.tables.limit),
        &[name.into()],
      )
      .await?;
    self.limits.lock().remove(name);
    Ok(deleted > 0)
  }

  fn cached_limit(&self, name: &str) -> Option<usize> {
    if self.options.limit_cache_ttl.is_zero() {
      return None;
    }
    let limits = self.limits.lock();
    let (limit, read_at) = limits.get(name)?;
    (read_at.elapsed() < self.options.limit_cache_ttl).then_some(*limit)
  }

  fn live_cutoff(&self) -> String {
    let cutoff = chrono::Duration::from_std(self.options.inactive_controller_timeout)
      .ok()
      .and_then(|d| Utc::now().checked_sub_signed(d))
      .unwrap_or(DateTime::UNIX_EPOCH);
    format_timestamp(cutoff)
  }

  /// `where` clause for waiters of live controllers, with its parameters.
  fn waiting_clause(&self) -> (String, Vec<Param>) {
    let ts = self.session.dialect().timestamp_param();
    (
      format!(
        "name = ? and held = 0 and (controller = ? or controller in (select controller from {} where time > {ts}))",
        self.tables.controller
      ),
      vec![Param::from(self.controller.as_str()), Param::from(self.live_cutoff())],
    )
  }

  fn queue_sql(&self, clause: &str, limit: u64) -> String {
    format!(
      "select workflowkey, controller from {} where {clause} order by priority desc, time asc, workflowkey asc{}",
      self.tables.state,
      self.session.dialect().limit_clause(limit, 0)
    )
  }

  /// Hold `holder` if it heads the queue and the lock has room. Runs inside
  /// `tx` while the lock row is owned.
  async fn hold_in(
    &self,
    tx: &mut sqlx::Transaction<'static, sqlx::Any>,
    lock: &str,
    holder: &str,
    limit: usize,
  ) -> Result<bool, PersistError> {
    let state = &self.tables.state;
    let int = self.session.dialect().bigint_cast();
    let row = self
      .session
      .fetch_optional_in(
        tx,
        &format!("select cast(held as {int}) as held from {state} where name = ? and workflowkey = ?"),
        &[lock.into(), holder.into()],
      )
      .await?;
    match row {
      None => return Ok(false),
      Some(row) if row.try_get::<i64, _>("held")? == 1 => return Ok(true),
      Some(_) => {}
    }

    let count = self
      .session
      .fetch_optional_in(
        tx,
        &format!("select cast(count(*) as {int}) as holders from {state} where name = ? and held = 1"),
        &[lock.into()],
      )
      .await?
      .map(|row| row.try_get::<i64, _>("holders"))
      .transpose()?
      .unwrap_or(0);
    if count as usize >= limit {
      return Ok(false);
    }

    let (clause, live) = self.waiting_clause();
    let mut params = vec![Param::from(lock)];
    params.extend(live);
    let head = self
      .session
      .fetch_optional_in(tx, &self.queue_sql(&clause, 1), &params)
      .await?
      .map(|row| text(&row, "workflowkey"))
      .transpose()?;
    if head.as_deref() != Some(holder) {
      return Ok(false);
    }
    self
      .session
      .execute_in(
        tx,
        &format!("update {state} set held = 1 where name = ? and workflowkey = ?"),
        &[lock.into(), holder.into()],
      )
      .await?;
    Ok(true)
  }

  async fn try_hold_once(&self, lock: &str, holder: &str, limit: usize) -> Result<bool, PersistError> {
    let dialect = self.session.dialect();
    let ts = dialect.timestamp_param();
    let table = &self.tables.lock;
    // A guard row left behind by a controller that died mid-update.
    let stale = chrono::Duration::from_std(self.options.inactive_controller_timeout)
      .ok()
      .and_then(|d| Utc::now().checked_sub_signed(d))
      .map(format_timestamp);
    if let Some(stale) = stale {
      self
        .session
        .execute(
          "expire_sync_lock",
          &format!("delete from {table} where name = ? and time < {ts}"),
          &[lock.into(), stale.into()],
        )
        .await?;
    }

    let mut tx = self.session.begin().await?;
    let guard = dialect.insert_ignore(table, &["name", "controller", "time"], &["?", "?", ts]);
    let owned = self
      .session
      .execute_in(
        &mut tx,
        &guard,
        &[lock.into(), self.controller.as_str().into(), format_timestamp(Utc::now()).into()],
      )
      .await?;
    if owned == 0 {
      debug!(lock, "sync_lock_busy");
      return Ok(false);
    }
    let held = self.hold_in(&mut tx, lock, holder, limit).await?;
    self
      .session
      .execute_in(
        &mut tx,
        &format!("delete from {table} where name = ? and controller = ?"),
        &[lock.into(), self.controller.as_str().into()],
      )
      .await?;
    tx.commit().await?;
    Ok(held)
  }

  async fn read_limit(&self, name: &str) -> Result<usize, PersistError> {
    if let Some(limit) = self.cached_limit(name) {
      return Ok(limit);
    }
    let row = self
      .session
      .fetch_optional(
        "read_sync_limit",
        &format!(
          "select cast(sizelimit as {}) as sizelimit from {} where name = ?",
          self.session.dialect().bigint_cast(),
          self.tables.limit
        ),
        &[name.into()],
      )
      .await?
      .ok_or_else(|| PersistError::NotFound(format!("sync limit '{name}'")))?;
    let limit = row.try_get::<i64, _>("sizelimit")?.max(0) as usize;
    if !self.options.limit_cache_ttl.is_zero() {
      self.limits.lock().insert(name.to_string(), (limit, Instant::now()));
    }
    Ok(limit)
  }

  async fn read_state(&self, lock: &str) -> Result<StoreLockState, PersistError> {
    let holders = self
      .session
      .fetch_all(
        "read_sync_holders",
        &format!(
          "select workflowkey from {} where name = ? and held = 1 order by workflowkey",
          self.tables.state
        ),
        &[lock.into()],
      )
      .await?
      .iter()
      .map(|row| text(row, "workflowkey"))
      .collect::<Result<Vec<_>, _>>()?;
    let (clause, live) = self.waiting_clause();
    let mut params = vec![Param::from(lock)];
    params.extend(live);
    let queue = self
      .session
      .fetch_all("read_sync_queue", &self.queue_sql(&clause, 0), &params)
      .await?
      .iter()
      .map(|row| {
        Ok(QueuedHolder {
          holder: text(row, "workflowkey")?,
          controller: text(row, "controller")?,
        })
      })
      .collect::<Result<Vec<_>, PersistError>>()?;
    Ok(StoreLockState { holders, queue })
  }

  async fn write_heartbeat(&self) -> Result<(), PersistError> {
    let dialect = self.session.dialect();
    let ts = dialect.timestamp_param();
    let table = &self.tables.controller;
    let now = format_timestamp(Utc::now());
    let updated = self
      .session
      .execute(
        "update_controller_heartbeat",
        &format!("update {table} set time = {ts} where controller = ?"),
        &[now.as_str().into(), self.controller.as_str().into()],
      )
      .await?;
    if updated == 0 {
      let insert = dialect.insert_ignore(table, &["controller", "time"], &["?", ts]);
      self
        .session
        .execute(
          "insert_controller_heartbeat",
          &insert,
          &[self.controller.as_str().into(), now.into()],
        )
        .await?;
    }
    debug!(controller = %self.controller, "controller_heartbeat");
    Ok(())
  }

  async fn drop_workflow(&self, wf_key: &str) -> Result<Vec<String>, PersistError> {
    let state = &self.tables.state;
    let clause = "controller = ? and (workflowkey = ? or workflowkey like ? escape '!')";
    let params = [
      Param::from(self.controller.as_str()),
      Param::from(wf_key),
      Param::Text(format!("{}/%", escape_like(wf_key))),
    ];
    let mut locks = self
      .session
      .fetch_all(
        "list_workflow_sync_rows",
        &format!("select name from {state} where {clause}"),
        &params,
      )
      .await?
      .iter()
      .map(|row| text(row, "name"))
      .collect::<Result<Vec<_>, _>>()?;
    locks.sort();
    locks.dedup();
    if !locks.is_empty() {
      self
        .session
        .execute(
          "delete_workflow_sync_rows",
          &format!("delete from {state} where {clause}"),
          &params,
        )
        .await?;
    }
    Ok(locks)
  }
}

#[async_trait]
impl SemaphoreStore for SqlSemaphoreStore {
  fn controller_name(&self) -> &str {
    &self.controller
  }

  fn poll_interval(&self) -> Duration {
    self.options.poll_interval
  }

  fn heartbeat_interval(&self) -> Duration {
    self.options.heartbeat_interval
  }

  async fn limit(&self, lock: &str) -> Result<usize, SyncError> {
    let Some(name) = limit_name(lock) else {
      return Ok(1);
    };
    self.read_limit(name).await.map_err(store_error("read_limit"))
  }

  async fn state(&self, lock: &str) -> Result<StoreLockState, SyncError> {
    self.read_state(lock).await.map_err(store_error("read_state"))
  }

  async fn enqueue(&self, lock: &str, holder: &str, priority: i32, created: DateTime<Utc>) -> Result<(), SyncError> {
    let dialect = self.session.dialect();
    let insert = dialect.insert_ignore(
      &self.tables.state,
      &["name", "workflowkey", "controller", "held", "priority", "time"],
      &["?", "?", "?", "0", "?", dialect.timestamp_param()],
    );
    self
      .session
      .execute(
        "enqueue",
        &insert,
        &[
          lock.into(),
          holder.into(),
          self.controller.as_str().into(),
          Param::Int(priority.into()),
          format_timestamp(created).into(),
        ],
      )
      .await
      .map_err(store_error("enqueue"))?;
    Ok(())
  }

  async fn try_hold(&self, lock: &str, holder: &str, limit: usize) -> Result<bool, SyncError> {
    let held = self
      .try_hold_once(lock, holder, limit)
      .await
      .map_err(store_error("try_hold"))?;
    if held {
      info!(lock, holder, "store_lock_held");
    }
    Ok(held)
  }

  async fn release(&self, lock: &str, holder: &str) -> Result<bool, SyncError> {
    let deleted = self
      .session
      .execute(
        "release",
        &format!(
          "delete from {} where name = ? and workflowkey = ? and controller = ?",
          self.tables.state
        ),
        &[lock.into(), holder.into(), self.controller.as_str().into()],
      )
      .await
      .map_err(store_error("release"))?;
    Ok(deleted > 0)
  }

  async fn release_workflow(&self, workflow_key: &str) -> Result<Vec<String>, SyncError> {
    self
      .drop_workflow(workflow_key)
      .await
      .map_err(store_error("release_workflow"))
  }

  async fn entries(&self) -> Result<Vec<(String, String)>, SyncError> {
    let rows = self
      .session
      .fetch_all(
        "list_sync_rows",
        &format!("select name, workflowkey from {} where controller = ?", self.tables.state),
        &[self.controller.as_str().into()],
      )
      .await
      .map_err(store_error("entries"))?;
    rows
      .iter()
      .map(|row| Ok((text(row, "name")?, text(row, "workflowkey")?)))
      .collect::<Result<Vec<_>, PersistError>>()
      .map_err(store_error("entries"))
  }

  async fn heartbeat(&self) -> Result<(), SyncError> {
    self.write_heartbeat().await.map_err(store_error("heartbeat"))
  }
}
