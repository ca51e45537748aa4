use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::dialect::Dialect;
use crate::error::PersistError;

static LABEL_NAME: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.]{0,61}[A-Za-z0-9])?$").expect("label name pattern"));
static LABEL_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("label prefix pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
  Equals,
  DoubleEquals,
  NotEquals,
  In,
  NotIn,
  Exists,
  DoesNotExist,
  GreaterThan,
  LessThan,
}

/// One clause of a label selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
  pub key: String,
  pub operator: Operator,
  pub values: Vec<String>,
}

fn invalid(selector: &str, message: impl Into<String>) -> PersistError {
  PersistError::InvalidSelector {
    selector: selector.to_string(),
    message: message.into(),
  }
}

fn validate_key(selector: &str, key: &str) -> Result<(), PersistError> {
  let (prefix, name) = match key.split_once('/') {
    Some((prefix, name)) => (Some(prefix), name),
    None => (None, key),
  };
  if let Some(prefix) = prefix
    && (prefix.len() > 253 || !LABEL_PREFIX.is_match(prefix))
  {
    return Err(invalid(selector, format!("invalid label key prefix '{prefix}'")));
  }
  if !LABEL_NAME.is_match(name) {
    return Err(invalid(selector, format!("invalid label key '{key}'")));
  }
  Ok(())
}

fn validate_value(selector: &str, value: &str) -> Result<(), PersistError> {
  if value.is_empty() || LABEL_NAME.is_match(value) {
    Ok(())
  } else {
    Err(invalid(selector, format!("invalid label value '{value}'")))
  }
}

impl Requirement {
  /// Build a checked requirement. Keys and values must follow the label
  /// grammar since they end up inside SQL text.
  pub fn new(key: &str, operator: Operator, values: Vec<String>) -> Result<Self, PersistError> {
    let context = format!("{key} {operator:?}");
    validate_key(&context, key)?;
    match operator {
      Operator::Equals | Operator::DoubleEquals | Operator::NotEquals if values.len() != 1 => {
        return Err(invalid(&context, "exactly one value is required"));
      }
      Operator::In | Operator::NotIn if values.is_empty() => {
        return Err(invalid(&context, "at least one value is required"));
      }
      Operator::Exists | Operator::DoesNotExist if !values.is_empty() => {
        return Err(invalid(&context, "values are not allowed"));
      }
      Operator::GreaterThan | Operator::LessThan => {
        if values.len() != 1 || values[0].parse::<i64>().is_err() {
          return Err(invalid(&context, "exactly one integer value is required"));
        }
      }
      _ => {}
    }
    for value in &values {
      validate_value(&context, value)?;
    }
    Ok(Self {
      key: key.to_string(),
      operator,
      values,
    })
  }

  /// Whether a label map satisfies this requirement.
  pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(&self.key);
    match self.operator {
      Operator::Equals | Operator::DoubleEquals | Operator::In => value.is_some_and(|v| self.values.contains(v)),
      Operator::NotEquals | Operator::NotIn => value.is_none_or(|v| !self.values.contains(v)),
      Operator::Exists => value.is_some(),
      Operator::DoesNotExist => value.is_none(),
      Operator::GreaterThan | Operator::LessThan => {
        let (Some(actual), Some(bound)) = (
          value.and_then(|v| v.parse::<i64>().ok()),
          self.values.first().and_then(|v| v.parse::<i64>().ok()),
        ) else {
          return false;
        };
        if self.operator == Operator::GreaterThan {
          actual > bound
        } else {
          actual < bound
        }
      }
    }
  }

  /// Correlated subquery on the labels table for a row of `table`.
  pub fn to_sql(&self, table: &str, labels_table: &str, dialect: Dialect) -> String {
    let base = format!(
      "select 1 from {labels_table} where clustername = {table}.clustername and uid = {table}.uid and name = '{}'",
      self.key
    );
    let quoted = || {
      self
        .values
        .iter()
        .map(|v| format!("'{v}'"))
        .collect::<Vec<_>>()
        .join(", ")
    };
    match self.operator {
      Operator::Equals | Operator::DoubleEquals => format!("exists ({base} and value = '{}')", self.values[0]),
      Operator::NotEquals => format!("not exists ({base} and value = '{}')", self.values[0]),
      Operator::In => format!("exists ({base} and value in ({}))", quoted()),
      Operator::NotIn => format!("not exists ({base} and value in ({}))", quoted()),
      Operator::Exists => format!("exists ({base})"),
      Operator::DoesNotExist => format!("not exists ({base})"),
      Operator::GreaterThan => format!(
        "exists ({base} and cast(value as {}) > {})",
        dialect.int_cast(),
        self.values[0]
      ),
      Operator::LessThan => format!(
        "exists ({base} and cast(value as {}) < {})",
        dialect.int_cast(),
        self.values[0]
      ),
    }
  }
}

/// A parsed label selector: requirements joined by `and`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selector {
  pub requirements: Vec<Requirement>,
}

impl Selector {
  pub fn is_empty(&self) -> bool {
    self.requirements.is_empty()
  }

  pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
    self.requirements.iter().all(|r| r.matches(labels))
  }
}

fn split_top_level(s: &str) -> Vec<&str> {
  let mut parts = Vec::new();
  let mut depth = 0usize;
  let mut start = 0;
  for (i, c) in s.char_indices() {
    match c {
      '(' => depth += 1,
      ')' => depth = depth.saturating_sub(1),
      ',' if depth == 0 => {
        parts.push(&s[start..i]);
        start = i + 1;
      }
      _ => {}
    }
  }
  parts.push(&s[start..]);
  parts
}

fn parse_set(selector: &str, rest: &str) -> Result<Vec<String>, PersistError> {
  let inner = rest
    .trim()
    .strip_prefix('(')
    .and_then(|r| r.strip_suffix(')'))
    .ok_or_else(|| invalid(selector, "expected a parenthesised value list"))?;
  Ok(
    inner
      .split(',')
      .map(|v| v.trim().to_string())
      .filter(|v| !v.is_empty())
      .collect(),
  )
}

fn parse_requirement(selector: &str, clause: &str) -> Result<Requirement, PersistError> {
  let clause = clause.trim();
  if let Some(key) = clause.strip_prefix('!') {
    return Requirement::new(key.trim(), Operator::DoesNotExist, Vec::new());
  }
  for (word, operator) in [(" notin ", Operator::NotIn), (" in ", Operator::In)] {
    if let Some((key, rest)) = clause.split_once(word) {
      return Requirement::new(key.trim(), operator, parse_set(selector, rest)?);
    }
  }
  for (symbol, operator) in [
    ("!=", Operator::NotEquals),
    ("==", Operator::DoubleEquals),
    ("=", Operator::Equals),
    (">", Operator::GreaterThan),
    ("<", Operator::LessThan),
  ] {
    if let Some((key, value)) = clause.split_once(symbol) {
      return Requirement::new(key.trim(), operator, vec![value.trim().to_string()]);
    }
  }
  Requirement::new(clause, Operator::Exists, Vec::new())
}

impl FromStr for Selector {
  type Err = PersistError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if s.trim().is_empty() {
      return Ok(Selector::default());
    }
    let requirements = split_top_level(s)
      .into_iter()
      .map(|clause| parse_requirement(s, clause))
      .collect::<Result<Vec<_>, _>>()?;
    Ok(Selector { requirements })
  }
}

impl fmt::Display for Operator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Operator::Equals => "=",
      Operator::DoubleEquals => "==",
      Operator::NotEquals => "!=",
      Operator::In => "in",
      Operator::NotIn => "notin",
      Operator::Exists => "exists",
      Operator::DoesNotExist => "!",
      Operator::GreaterThan => ">",
      Operator::LessThan => "<",
    };
    f.write_str(s)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
  }

  #[test]
  fn test_parse_all_operators() {
    let selector: Selector = "env=prod,tier in (fe, be),!legacy,team notin (x),priority>2,size<10,app,a==b,c!=d"
      .parse()
      .unwrap();
    let ops: Vec<Operator> = selector.requirements.iter().map(|r| r.operator).collect();
    assert_eq!(
      ops,
      vec![
        Operator::Equals,
        Operator::In,
        Operator::DoesNotExist,
        Operator::NotIn,
        Operator::GreaterThan,
        Operator::LessThan,
        Operator::Exists,
        Operator::DoubleEquals,
        Operator::NotEquals,
      ]
    );
    assert_eq!(selector.requirements[1].values, vec!["fe", "be"]);
  }

  #[test]
  fn test_rejects_values_outside_label_grammar() {
    assert!("env=prod' or '1'='1".parse::<Selector>().is_err());
    assert!("priority>high".parse::<Selector>().is_err());
    assert!("tier in fe".parse::<Selector>().is_err());
    assert!("example.com/env=prod".parse::<Selector>().is_ok());
  }

  #[test]
  fn test_matches() {
    let selector: Selector = "env in (prod,dev),!legacy,priority>2".parse().unwrap();
    assert!(selector.matches(&labels(&[("env", "prod"), ("priority", "3")])));
    assert!(!selector.matches(&labels(&[("env", "prod"), ("priority", "2")])));
    assert!(!selector.matches(&labels(&[("env", "dev"), ("priority", "9"), ("legacy", "y")])));
    assert!(Selector::default().matches(&labels(&[])));
  }

  #[test]
  fn test_to_sql_uses_dialect_cast() {
    let r = Requirement::new("priority", Operator::GreaterThan, vec!["2".into()]).unwrap();
    let sql = r.to_sql("w", "l", Dialect::MySql);
    assert_eq!(
      sql,
      "exists (select 1 from l where clustername = w.clustername and uid = w.uid and name = 'priority' and cast(value as signed) > 2)"
    );
    assert!(r.to_sql("w", "l", Dialect::Postgres).contains("cast(value as int) > 2"));

    let r = Requirement::new("tier", Operator::DoesNotExist, vec![]).unwrap();
    assert!(r.to_sql("w", "l", Dialect::Sqlite).starts_with("not exists (select 1 from l"));
  }
}
