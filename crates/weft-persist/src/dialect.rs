use std::borrow::Cow;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::PersistError;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// SQL differences between the supported databases.
///
/// Statements are written with `?` placeholders and rebound for Postgres.
/// Timestamps travel as `YYYY-MM-DD HH:MM:SS.ffffff` text in both
/// directions, so the same row decoding works on every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
  Postgres,
  MySql,
  Sqlite,
}

impl Dialect {
  pub fn from_url(url: &str) -> Result<Self, PersistError> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
      Ok(Dialect::Postgres)
    } else if url.starts_with("mysql://") || url.starts_with("mariadb://") {
      Ok(Dialect::MySql)
    } else if url.starts_with("sqlite:") {
      Ok(Dialect::Sqlite)
    } else {
      Err(PersistError::UnsupportedDatabase { url: url.to_string() })
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Dialect::Postgres => "postgres",
      Dialect::MySql => "mysql",
      Dialect::Sqlite => "sqlite",
    }
  }

  /// Integer type for `cast(value as ...)` in numeric label comparisons.
  pub fn int_cast(self) -> &'static str {
    match self {
      Dialect::Postgres => "int",
      Dialect::MySql => "signed",
      Dialect::Sqlite => "integer",
    }
  }

  /// 64-bit integer type for `cast(... as ...)` when reading numbers back.
  pub fn bigint_cast(self) -> &'static str {
    match self {
      Dialect::Postgres => "bigint",
      Dialect::MySql => "signed",
      Dialect::Sqlite => "integer",
    }
  }

  pub fn timestamp_type(self) -> &'static str {
    match self {
      Dialect::Postgres => "timestamp",
      Dialect::MySql => "datetime(6)",
      Dialect::Sqlite => "text",
    }
  }

  /// Large text column for JSON documents.
  pub fn text_type(self) -> &'static str {
    match self {
      Dialect::MySql => "longtext",
      Dialect::Postgres | Dialect::Sqlite => "text",
    }
  }

  /// Placeholder for a timestamp bound as text.
  pub fn timestamp_param(self) -> &'static str {
    match self {
      Dialect::Postgres => "cast(? as timestamp)",
      Dialect::MySql => "cast(? as datetime(6))",
      Dialect::Sqlite => "?",
    }
  }

  /// Select expression reading a timestamp column as text.
  pub fn timestamp_column(self, column: &str) -> String {
    match self {
      Dialect::Postgres => format!("to_char({column}, 'YYYY-MM-DD HH24:MI:SS.US') as {column}"),
      Dialect::MySql => format!("date_format({column}, '%Y-%m-%d %H:%i:%s.%f') as {column}"),
      Dialect::Sqlite => column.to_string(),
    }
  }

  /// Text value at `path` inside a JSON document column.
  pub fn json_text(self, column: &str, path: &[&str]) -> String {
    match self {
      Dialect::Postgres => {
        let (last, init) = path.split_last().map_or(("", &[][..]), |(l, i)| (*l, i));
        let mut expr = format!("cast({column} as json)");
        for segment in init {
          expr.push_str(&format!("->'{segment}'"));
        }
        format!("{expr}->>'{last}'")
      }
      Dialect::MySql => format!("json_unquote(json_extract({column}, '$.{}'))", path.join(".")),
      Dialect::Sqlite => format!("json_extract({column}, '$.{}')", path.join(".")),
    }
  }

  /// `insert` that silently skips rows whose primary key already exists.
  pub fn insert_ignore(self, table: &str, columns: &[&str], values: &[&str]) -> String {
    let columns = columns.join(", ");
    let values = values.join(", ");
    match self {
      Dialect::MySql => format!("insert ignore into {table} ({columns}) values ({values})"),
      Dialect::Postgres | Dialect::Sqlite => {
        format!("insert into {table} ({columns}) values ({values}) on conflict do nothing")
      }
    }
  }

  /// `limit`/`offset` suffix. A zero limit is unbounded.
  pub fn limit_clause(self, limit: u64, offset: u64) -> String {
    match (limit, offset) {
      (0, 0) => String::new(),
      (0, offset) => match self {
        Dialect::Postgres => format!(" offset {offset}"),
        Dialect::MySql => format!(" limit 18446744073709551615 offset {offset}"),
        Dialect::Sqlite => format!(" limit -1 offset {offset}"),
      },
      (limit, offset) => format!(" limit {limit} offset {offset}"),
    }
  }

  /// Dropping an index needs the table name on MySQL.
  pub fn drop_index(self, index: &str, table: &str) -> String {
    match self {
      Dialect::MySql => format!("drop index {index} on {table}"),
      Dialect::Postgres | Dialect::Sqlite => format!("drop index {index}"),
    }
  }

  /// Rewrite `?` placeholders for the backend. Quoted text is left alone.
  pub fn rebind<'a>(self, sql: &'a str) -> Cow<'a, str> {
    if self != Dialect::Postgres || !sql.contains('?') {
      return Cow::Borrowed(sql);
    }
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    let mut in_quote = false;
    for c in sql.chars() {
      match c {
        '\'' => {
          in_quote = !in_quote;
          out.push(c);
        }
        '?' if !in_quote => {
          n += 1;
          out.push('$');
          out.push_str(&n.to_string());
        }
        _ => out.push(c),
      }
    }
    Cow::Owned(out)
  }
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
  ts.naive_utc().format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, PersistError> {
  NaiveDateTime::parse_from_str(value.trim(), "%Y-%m-%d %H:%M:%S%.f")
    .map(|naive| naive.and_utc())
    .map_err(|_| PersistError::InvalidTimestamp {
      column: column.to_string(),
      value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_from_url() {
    assert_eq!(Dialect::from_url("postgres://u:p@h/db").unwrap(), Dialect::Postgres);
    assert_eq!(Dialect::from_url("mysql://u:p@h/db").unwrap(), Dialect::MySql);
    assert_eq!(Dialect::from_url("sqlite::memory:").unwrap(), Dialect::Sqlite);
    assert!(Dialect::from_url("redis://h").is_err());
  }

  #[test]
  fn test_rebind_postgres_only() {
    let sql = "select * from t where a = ? and b = '?' and c = ?";
    assert_eq!(
      Dialect::Postgres.rebind(sql),
      "select * from t where a = $1 and b = '?' and c = $2"
    );
    assert_eq!(Dialect::MySql.rebind(sql), sql);
  }

  #[test]
  fn test_limit_clause() {
    assert_eq!(Dialect::Sqlite.limit_clause(0, 0), "");
    assert_eq!(Dialect::Sqlite.limit_clause(0, 5), " limit -1 offset 5");
    assert_eq!(Dialect::Postgres.limit_clause(0, 5), " offset 5");
    assert_eq!(Dialect::MySql.limit_clause(10, 0), " limit 10 offset 0");
  }

  #[test]
  fn test_json_text() {
    assert_eq!(
      Dialect::Postgres.json_text("workflow", &["metadata", "creationTimestamp"]),
      "cast(workflow as json)->'metadata'->>'creationTimestamp'"
    );
    assert_eq!(
      Dialect::Sqlite.json_text("workflow", &["metadata", "creationTimestamp"]),
      "json_extract(workflow, '$.metadata.creationTimestamp')"
    );
  }

  #[test]
  fn test_timestamp_text_round_trip() {
    let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap() + chrono::Duration::microseconds(42);
    let text = format_timestamp(ts);
    assert_eq!(text, "2024-03-01 12:30:05.000042");
    assert_eq!(parse_timestamp("startedat", &text).unwrap(), ts);
    assert!(parse_timestamp("startedat", "yesterday").is_err());
  }
}
