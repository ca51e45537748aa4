use std::future::Future;
use std::time::Duration;

use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Executor, Transaction};
use tracing::{info, warn};
use weft_config::ConnectionPool;

use crate::dialect::Dialect;
use crate::error::{PersistError, is_network_error};

/// A bound statement parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
  Text(String),
  Int(i64),
}

impl From<&str> for Param {
  fn from(s: &str) -> Self {
    Param::Text(s.to_string())
  }
}

impl From<String> for Param {
  fn from(s: String) -> Self {
    Param::Text(s)
  }
}

impl From<i64> for Param {
  fn from(i: i64) -> Self {
    Param::Int(i)
  }
}

fn bind_params<'q>(mut query: Query<'q, Any, AnyArguments<'q>>, params: &'q [Param]) -> Query<'q, Any, AnyArguments<'q>> {
  for param in params {
    query = match param {
      Param::Text(s) => query.bind(s.as_str()),
      Param::Int(i) => query.bind(*i),
    };
  }
  query
}

/// Reconnect policy for network failures outside transactions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
  pub multiplier: f64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 5,
      base_delay: Duration::from_millis(100),
      max_delay: Duration::from_secs(30),
      multiplier: 2.0,
    }
  }
}

impl RetryConfig {
  /// Delay before retry number `attempt` (zero-based).
  pub fn delay(&self, attempt: u32) -> Duration {
    let factor = self.multiplier.powi(attempt as i32);
    let delay = self.base_delay.mul_f64(factor.max(0.0));
    delay.min(self.max_delay)
  }
}

/// Pooled database handle shared by the repositories.
///
/// Statements outside a transaction are retried on network errors with
/// exponential backoff. An optional deadline bounds each operation including
/// its retries; running past it yields [`PersistError::DeadlineExceeded`].
#[derive(Debug, Clone)]
pub struct Session {
  pool: AnyPool,
  dialect: Dialect,
  retry: RetryConfig,
  deadline: Option<Duration>,
}

impl Session {
  /// Open a pool for `url`. The dialect is taken from the URL scheme.
  pub async fn connect(url: &str, pool: Option<&ConnectionPool>) -> Result<Self, PersistError> {
    sqlx::any::install_default_drivers();
    let dialect = Dialect::from_url(url)?;
    let retry = RetryConfig::default();

    let mut options = AnyPoolOptions::new();
    if let Some(pool) = pool {
      if let Some(max) = pool.max_open_conns.filter(|n| *n > 0) {
        options = options.max_connections(max);
      }
      if let Some(idle) = pool.max_idle_conns {
        let cap = pool.max_open_conns.filter(|n| *n > 0).unwrap_or(idle);
        options = options.min_connections(idle.min(cap));
      }
      if !pool.conn_max_lifetime.is_zero() {
        options = options.max_lifetime(pool.conn_max_lifetime.duration());
      }
    }
    if dialect == Dialect::Sqlite && url.contains(":memory:") {
      // Each connection would otherwise see its own empty database.
      options = options
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None);
    }
    if dialect == Dialect::MySql {
      options = options.after_connect(|conn, _meta| {
        Box::pin(async move {
          conn.execute("SET NAMES 'utf8mb4'").await?;
          Ok(())
        })
      });
    }

    let mut attempt = 0;
    let pool = loop {
      match options.clone().connect(url).await {
        Ok(pool) => break pool,
        Err(e) if attempt < retry.max_retries && is_network_error(&e) => {
          let delay = retry.delay(attempt);
          warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "database_connect_retry");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(e) => return Err(e.into()),
      }
    };
    info!(dialect = dialect.as_str(), "database_connected");
    Ok(Self::from_pool(pool, dialect))
  }

  pub fn from_pool(pool: AnyPool, dialect: Dialect) -> Self {
    Self {
      pool,
      dialect,
      retry: RetryConfig::default(),
      deadline: None,
    }
  }

  pub fn with_retry(mut self, retry: RetryConfig) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_deadline(mut self, deadline: Duration) -> Self {
    self.deadline = Some(deadline);
    self
  }

  pub fn dialect(&self) -> Dialect {
    self.dialect
  }

  pub fn pool(&self) -> &AnyPool {
    &self.pool
  }

  pub async fn close(&self) {
    self.pool.close().await;
  }

  async fn run<T, F, Fut>(&self, operation: &str, mut attempt_fn: F) -> Result<T, PersistError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
  {
    let retrying = async {
      let mut attempt = 0;
      loop {
        match attempt_fn().await {
          Ok(value) => return Ok(value),
          Err(e) if attempt < self.retry.max_retries && is_network_error(&e) => {
            let delay = self.retry.delay(attempt);
            warn!(operation, attempt, error = %e, delay_ms = delay.as_millis() as u64, "database_retry");
            tokio::time::sleep(delay).await;
            attempt += 1;
          }
          Err(e) => return Err(PersistError::Database(e)),
        }
      }
    };
    match self.deadline {
      Some(deadline) => tokio::time::timeout(deadline, retrying)
        .await
        .map_err(|_| PersistError::DeadlineExceeded {
          operation: operation.to_string(),
        })?,
      None => retrying.await,
    }
  }

  /// Run a statement, returning the number of affected rows.
  pub async fn execute(&self, operation: &str, sql: &str, params: &[Param]) -> Result<u64, PersistError> {
    let sql = self.dialect.rebind(sql);
    let result = self
      .run(operation, || bind_params(sqlx::query(&sql), params).execute(&self.pool))
      .await?;
    Ok(result.rows_affected())
  }

  pub async fn fetch_all(&self, operation: &str, sql: &str, params: &[Param]) -> Result<Vec<AnyRow>, PersistError> {
    let sql = self.dialect.rebind(sql);
    self
      .run(operation, || bind_params(sqlx::query(&sql), params).fetch_all(&self.pool))
      .await
  }

  pub async fn fetch_optional(
    &self,
    operation: &str,
    sql: &str,
    params: &[Param],
  ) -> Result<Option<AnyRow>, PersistError> {
    let sql = self.dialect.rebind(sql);
    self
      .run(operation, || bind_params(sqlx::query(&sql), params).fetch_optional(&self.pool))
      .await
  }

  /// Start a transaction. Statements inside it are never retried.
  pub async fn begin(&self) -> Result<Transaction<'static, Any>, PersistError> {
    Ok(self.pool.begin().await?)
  }

  /// Run a statement inside `tx`.
  pub async fn execute_in(
    &self,
    tx: &mut Transaction<'static, Any>,
    sql: &str,
    params: &[Param],
  ) -> Result<u64, PersistError> {
    let sql = self.dialect.rebind(sql);
    let result = bind_params(sqlx::query(&sql), params).execute(&mut **tx).await?;
    Ok(result.rows_affected())
  }

  pub async fn fetch_all_in(
    &self,
    tx: &mut Transaction<'static, Any>,
    sql: &str,
    params: &[Param],
  ) -> Result<Vec<AnyRow>, PersistError> {
    let sql = self.dialect.rebind(sql);
    Ok(bind_params(sqlx::query(&sql), params).fetch_all(&mut **tx).await?)
  }

  pub async fn fetch_optional_in(
    &self,
    tx: &mut Transaction<'static, Any>,
    sql: &str,
    params: &[Param],
  ) -> Result<Option<AnyRow>, PersistError> {
    let sql = self.dialect.rebind(sql);
    Ok(bind_params(sqlx::query(&sql), params).fetch_optional(&mut **tx).await?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_retry_delay_backoff_and_cap() {
    let retry = RetryConfig::default();
    assert_eq!(retry.delay(0), Duration::from_millis(100));
    assert_eq!(retry.delay(1), Duration::from_millis(200));
    assert_eq!(retry.delay(3), Duration::from_millis(800));
    assert_eq!(retry.delay(20), Duration::from_secs(30));
  }

  #[tokio::test]
  async fn test_execute_and_fetch_on_sqlite() {
    let session = Session::connect("sqlite::memory:", None).await.unwrap();
    session
      .execute("create", "create table kv (k text primary key, v integer)", &[])
      .await
      .unwrap();
    let inserted = session
      .execute("insert", "insert into kv (k, v) values (?, ?)", &["a".into(), 7.into()])
      .await
      .unwrap();
    assert_eq!(inserted, 1);

    let row = session
      .fetch_optional("get", "select v from kv where k = ?", &["a".into()])
      .await
      .unwrap()
      .unwrap();
    let v: i64 = sqlx::Row::try_get(&row, "v").unwrap();
    assert_eq!(v, 7);
  }

  #[tokio::test]
  async fn test_transaction_rolls_back_on_drop() {
    let session = Session::connect("sqlite::memory:", None).await.unwrap();
    session
      .execute("create", "create table kv (k text primary key)", &[])
      .await
      .unwrap();
    {
      let mut tx = session.begin().await.unwrap();
      session
        .execute_in(&mut tx, "insert into kv (k) values (?)", &["a".into()])
        .await
        .unwrap();
    }
    let rows = session.fetch_all("list", "select k from kv", &[]).await.unwrap();
    assert!(rows.is_empty());
  }

  #[tokio::test]
  async fn test_reads_inside_transaction_see_its_writes() {
    let session = Session::connect("sqlite::memory:", None).await.unwrap();
    session
      .execute("create", "create table kv (k text primary key)", &[])
      .await
      .unwrap();
    let mut tx = session.begin().await.unwrap();
    session
      .execute_in(&mut tx, "insert into kv (k) values (?)", &["a".into()])
      .await
      .unwrap();
    let rows = session.fetch_all_in(&mut tx, "select k from kv", &[]).await.unwrap();
    assert_eq!(rows.len(), 1);
    let missing = session
      .fetch_optional_in(&mut tx, "select k from kv where k = ?", &["b".into()])
      .await
      .unwrap();
    assert!(missing.is_none());
    tx.commit().await.unwrap();
  }
}
