use chrono::{DateTime, SecondsFormat, Utc};

use crate::dialect::{Dialect, format_timestamp};
use crate::labels::Requirement;
use crate::session::Param;

/// How [`ListOptions::name`] is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameFilter {
  #[default]
  Exact,
  Contains,
  Prefix,
  NotEquals,
}

/// Filters and paging for archive queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListOptions {
  pub namespace: Option<String>,
  pub name: Option<String>,
  pub name_filter: NameFilter,
  pub name_prefix: Option<String>,
  pub min_started_at: Option<DateTime<Utc>>,
  pub max_started_at: Option<DateTime<Utc>>,
  pub created_after: Option<DateTime<Utc>>,
  pub finished_before: Option<DateTime<Utc>>,
  pub label_requirements: Vec<Requirement>,
  /// Zero is unbounded.
  pub limit: u64,
  pub offset: u64,
  pub started_at_ascending: bool,
}

/// A `where` clause under construction with its bound parameters.
#[derive(Debug, Clone, Default)]
pub struct Predicate {
  clauses: Vec<String>,
  params: Vec<Param>,
}

impl Predicate {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a clause whose `?` placeholders take `params` in order.
  pub fn and(mut self, clause: impl Into<String>, params: impl IntoIterator<Item = Param>) -> Self {
    self.clauses.push(clause.into());
    self.params.extend(params);
    self
  }

  pub fn is_empty(&self) -> bool {
    self.clauses.is_empty()
  }

  /// ` where a and b`, or nothing.
  pub fn where_sql(&self) -> String {
    if self.clauses.is_empty() {
      String::new()
    } else {
      format!(" where {}", self.clauses.join(" and "))
    }
  }

  pub fn params(&self) -> &[Param] {
    &self.params
  }

  pub fn into_params(self) -> Vec<Param> {
    self.params
  }
}

/// Escape character for `like` patterns. Not a backslash, which MySQL
/// string literals would swallow.
pub(crate) const LIKE_ESCAPE: char = '!';
const NAME_LIKE: &str = "name like ? escape '!'";

/// `value` with `like` wildcards taken literally.
pub(crate) fn escape_like(value: &str) -> String {
  let mut out = String::with_capacity(value.len());
  for c in value.chars() {
    if matches!(c, '%' | '_') || c == LIKE_ESCAPE {
      out.push(LIKE_ESCAPE);
    }
    out.push(c);
  }
  out
}

/// Builds archive predicates from [`ListOptions`].
#[derive(Debug, Clone, Copy)]
pub struct SelectorBuilder<'a> {
  pub table: &'a str,
  pub labels_table: &'a str,
  pub dialect: Dialect,
}

impl SelectorBuilder<'_> {
  fn timestamp(&self, predicate: Predicate, column: &str, op: &str, ts: Option<DateTime<Utc>>) -> Predicate {
    match ts {
      Some(ts) => predicate.and(
        format!("{column} {op} {}", self.dialect.timestamp_param()),
        [Param::Text(format_timestamp(ts))],
      ),
      None => predicate,
    }
  }

  /// Add every filter in `options` to `predicate`.
  pub fn filter(&self, mut predicate: Predicate, options: &ListOptions) -> Predicate {
    if let Some(ns) = options.namespace.as_deref().filter(|ns| !ns.is_empty()) {
      predicate = predicate.and("namespace = ?", [Param::from(ns)]);
    }
    if let Some(prefix) = options.name_prefix.as_deref().filter(|p| !p.is_empty()) {
      predicate = predicate.and(NAME_LIKE, [Param::Text(format!("{}%", escape_like(prefix)))]);
    }
    if let Some(name) = options.name.as_deref().filter(|n| !n.is_empty()) {
      predicate = match options.name_filter {
        NameFilter::Exact => predicate.and("name = ?", [Param::from(name)]),
        NameFilter::NotEquals => predicate.and("name != ?", [Param::from(name)]),
        NameFilter::Prefix => predicate.and(NAME_LIKE, [Param::Text(format!("{}%", escape_like(name)))]),
        NameFilter::Contains => predicate.and(NAME_LIKE, [Param::Text(format!("%{}%", escape_like(name)))]),
      };
    }
    predicate = self.timestamp(predicate, "startedat", ">=", options.min_started_at);
    predicate = self.timestamp(predicate, "startedat", "<=", options.max_started_at);
    predicate = self.timestamp(predicate, "finishedat", "<=", options.finished_before);
    if let Some(created) = options.created_after {
      let column = self
        .dialect
        .json_text("workflow", &["metadata", "creationTimestamp"]);
      let created = created.to_rfc3339_opts(SecondsFormat::AutoSi, true);
      predicate = predicate.and(format!("{column} >= ?"), [Param::Text(created)]);
    }
    for requirement in &options.label_requirements {
      predicate = predicate.and(requirement.to_sql(self.table, self.labels_table, self.dialect), []);
    }
    predicate
  }

  /// `order by` plus paging for a listing.
  pub fn order_and_page(&self, options: &ListOptions) -> String {
    let direction = if options.started_at_ascending { "asc" } else { "desc" };
    format!(
      " order by startedat {direction}{}",
      self.dialect.limit_clause(options.limit, options.offset)
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::labels::Operator;
  use chrono::TimeZone;

  fn builder() -> SelectorBuilder<'static> {
    SelectorBuilder {
      table: "argo_archived_workflows",
      labels_table: "argo_archived_workflows_labels",
      dialect: Dialect::Sqlite,
    }
  }

  #[test]
  fn test_empty_options_add_nothing() {
    let predicate = builder().filter(Predicate::new(), &ListOptions::default());
    assert!(predicate.is_empty());
    assert_eq!(predicate.where_sql(), "");
  }

  #[test]
  fn test_name_filters() {
    let options = ListOptions {
      name: Some("build".into()),
      name_filter: NameFilter::Contains,
      ..Default::default()
    };
    let predicate = builder().filter(Predicate::new(), &options);
    assert_eq!(predicate.where_sql(), " where name like ? escape '!'");
    assert_eq!(predicate.params(), &[Param::Text("%build%".into())]);

    let options = ListOptions {
      name: Some("build".into()),
      name_filter: NameFilter::NotEquals,
      ..Default::default()
    };
    assert_eq!(
      builder().filter(Predicate::new(), &options).where_sql(),
      " where name != ?"
    );
  }

  #[test]
  fn test_like_wildcards_are_literal() {
    assert_eq!(escape_like("100%_done!"), "100!%!_done!!");
    let options = ListOptions {
      name_prefix: Some("a_b".into()),
      ..Default::default()
    };
    let predicate = builder().filter(Predicate::new(), &options);
    assert_eq!(predicate.params(), &[Param::Text("a!_b%".into())]);
  }

  #[test]
  fn test_time_bounds_and_labels() {
    let options = ListOptions {
      namespace: Some("ns".into()),
      min_started_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
      created_after: Some(Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap()),
      label_requirements: vec![Requirement::new("env", Operator::Equals, vec!["prod".into()]).unwrap()],
      ..Default::default()
    };
    let predicate = builder().filter(Predicate::new().and("clustername = ?", [Param::from("c")]), &options);
    let sql = predicate.where_sql();
    assert!(sql.starts_with(" where clustername = ? and namespace = ? and startedat >= ?"));
    assert!(sql.contains("json_extract(workflow, '$.metadata.creationTimestamp') >= ?"));
    assert!(sql.ends_with("and value = 'prod')"));
    assert_eq!(predicate.params().len(), 4);
    assert_eq!(predicate.params()[2], Param::Text("2024-01-01 00:00:00.000000".into()));
  }

  #[test]
  fn test_order_and_page() {
    let options = ListOptions {
      limit: 10,
      offset: 20,
      ..Default::default()
    };
    assert_eq!(
      builder().order_and_page(&options),
      " order by startedat desc limit 10 offset 20"
    );
    let options = ListOptions {
      started_at_ascending: true,
      ..Default::default()
    };
    assert_eq!(builder().order_and_page(&options), " order by startedat asc");
  }
}
