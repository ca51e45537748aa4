//! Loop inputs for `withItems`, `withParam` and `withSequence`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::template::any_string;

/// One element of a loop. Maps expose their keys as `{{item.<key>}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Item {
  String(String),
  Number(serde_json::Number),
  Bool(bool),
  Map(BTreeMap<String, serde_json::Value>),
  List(Vec<serde_json::Value>),
}

impl Item {
  pub fn from_json(value: serde_json::Value) -> Result<Self, WorkflowError> {
    Ok(match value {
      serde_json::Value::String(s) => Item::String(s),
      serde_json::Value::Number(n) => Item::Number(n),
      serde_json::Value::Bool(b) => Item::Bool(b),
      serde_json::Value::Object(map) => Item::Map(map.into_iter().collect()),
      serde_json::Value::Array(list) => Item::List(list),
      serde_json::Value::Null => {
        return Err(WorkflowError::validation("null is not a valid loop item"));
      }
    })
  }

  /// String used for `{{item}}` and for the `(i:item)` node-name suffix.
  pub fn to_item_string(&self) -> String {
    match self {
      Item::String(s) => s.clone(),
      Item::Number(n) => n.to_string(),
      Item::Bool(b) => b.to_string(),
      Item::Map(map) => serde_json::to_string(map).unwrap_or_default(),
      Item::List(list) => serde_json::to_string(list).unwrap_or_default(),
    }
  }

  /// `(key, value)` pairs for map items, rendered as strings.
  pub fn map_entries(&self) -> Vec<(String, String)> {
    match self {
      Item::Map(map) => map
        .iter()
        .map(|(k, v)| {
          let rendered = match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
          };
          (k.clone(), rendered)
        })
        .collect(),
      _ => Vec::new(),
    }
  }
}

/// Parse the JSON list carried by `withParam`.
pub fn items_from_param(raw: &str) -> Result<Vec<Item>, WorkflowError> {
  let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
    WorkflowError::validation(format!("withParam value could not be parsed as a JSON list: {raw}: {e}"))
  })?;
  match value {
    serde_json::Value::Array(values) => values.into_iter().map(Item::from_json).collect(),
    _ => Err(WorkflowError::validation(format!(
      "withParam value is not a JSON list: {raw}"
    ))),
  }
}

/// A numeric range rendered through a printf-style format.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Sequence {
  #[serde(default, deserialize_with = "any_string", skip_serializing_if = "Option::is_none")]
  pub count: Option<String>,
  #[serde(default, deserialize_with = "any_string", skip_serializing_if = "Option::is_none")]
  pub start: Option<String>,
  #[serde(default, deserialize_with = "any_string", skip_serializing_if = "Option::is_none")]
  pub end: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub format: Option<String>,
}

impl Sequence {
  /// Expand to items. `count` yields `start..start+count`; `end` yields the
  /// inclusive range `[start, end]`, counting down when `end < start`.
  pub fn expand(&self) -> Result<Vec<Item>, WorkflowError> {
    let parse = |field: &str, value: &str| {
      value.trim().parse::<i64>().map_err(|_| WorkflowError::InvalidSequence {
        message: format!("{field} '{value}' is not an integer"),
      })
    };
    let start = match self.start.as_deref() {
      Some(s) => parse("start", s)?,
      None => 0,
    };

    let values: Vec<i64> = match (self.count.as_deref(), self.end.as_deref()) {
      (Some(_), Some(_)) => {
        return Err(WorkflowError::InvalidSequence {
          message: "only one of count or end can be defined".to_string(),
        });
      }
      (Some(count), None) => {
        let count = parse("count", count)?;
        if count < 0 {
          return Err(WorkflowError::InvalidSequence {
            message: format!("count '{count}' must be non-negative"),
          });
        }
        (start..start + count).collect()
      }
      (None, Some(end)) => {
        let end = parse("end", end)?;
        if end >= start {
          (start..=end).collect()
        } else {
          (end..=start).rev().collect()
        }
      }
      (None, None) => {
        return Err(WorkflowError::InvalidSequence {
          message: "either count or end must be defined".to_string(),
        });
      }
    };

    let format = self.format.as_deref().unwrap_or("%d");
    values
      .into_iter()
      .map(|v| printf(format, v).map(Item::String))
      .collect()
  }
}

/// Minimal printf supporting `%d`, `%s`, `%x`, `%X`, `%o`, zero padding,
/// width and `%%`.
fn printf(format: &str, value: i64) -> Result<String, WorkflowError> {
  let mut out = String::new();
  let mut chars = format.chars().peekable();
  while let Some(c) = chars.next() {
    if c != '%' {
      out.push(c);
      continue;
    }
    if chars.peek() == Some(&'%') {
      chars.next();
      out.push('%');
      continue;
    }
    let mut zero = false;
    if chars.peek() == Some(&'0') {
      zero = true;
      chars.next();
    }
    let mut width = String::new();
    while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
      width.push(*d);
      chars.next();
    }
    let width: usize = width.parse().unwrap_or(0);
    let rendered = match chars.next() {
      Some('d') | Some('s') | Some('v') => value.to_string(),
      Some('x') => format!("{value:x}"),
      Some('X') => format!("{value:X}"),
      Some('o') => format!("{value:o}"),
      other => {
        return Err(WorkflowError::InvalidSequence {
          message: format!("unsupported format verb {other:?} in '{format}'"),
        });
      }
    };
    if rendered.len() < width {
      let pad = if zero { '0' } else { ' ' };
      let padding: String = std::iter::repeat_n(pad, width - rendered.len()).collect();
      if zero && rendered.starts_with('-') {
        out.push('-');
        out.push_str(&padding);
        out.push_str(&rendered[1..]);
      } else {
        out.push_str(&padding);
        out.push_str(&rendered);
      }
    } else {
      out.push_str(&rendered);
    }
  }
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn strings(items: Vec<Item>) -> Vec<String> {
    items.iter().map(Item::to_item_string).collect()
  }

  #[test]
  fn test_sequence_count() {
    let seq = Sequence {
      count: Some("3".into()),
      ..Default::default()
    };
    assert_eq!(strings(seq.expand().unwrap()), vec!["0", "1", "2"]);
  }

  #[test]
  fn test_sequence_start_end_with_format() {
    let seq = Sequence {
      start: Some("8".into()),
      end: Some("11".into()),
      format: Some("node-%02d".into()),
      ..Default::default()
    };
    assert_eq!(
      strings(seq.expand().unwrap()),
      vec!["node-08", "node-09", "node-10", "node-11"]
    );
  }

  #[test]
  fn test_sequence_counts_down() {
    let seq = Sequence {
      start: Some("3".into()),
      end: Some("1".into()),
      ..Default::default()
    };
    assert_eq!(strings(seq.expand().unwrap()), vec!["3", "2", "1"]);
  }

  #[test]
  fn test_sequence_rejects_count_and_end() {
    let seq = Sequence {
      count: Some("2".into()),
      end: Some("5".into()),
      ..Default::default()
    };
    assert!(seq.expand().is_err());
  }

  #[test]
  fn test_items_from_param_mixed() {
    let items = items_from_param(r#"["a", 1, true, {"os": "linux"}]"#).unwrap();
    assert_eq!(items.len(), 4);
    assert_eq!(items[1].to_item_string(), "1");
    assert_eq!(items[3].map_entries(), vec![("os".to_string(), "linux".to_string())]);
  }

  #[test]
  fn test_items_from_param_rejects_object() {
    assert!(items_from_param(r#"{"a": 1}"#).is_err());
  }
}
