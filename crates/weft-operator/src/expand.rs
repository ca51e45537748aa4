//! Loop expansion for `withItems`, `withParam` and `withSequence`.

use serde::Serialize;
use serde::de::DeserializeOwned;
use weft_workflow::{Arguments, DagTask, Item, Sequence, WorkflowStep, items_from_param};

use crate::error::OperatorError;
use crate::substitute::{ITEM_REQUIRED, Params, substitute};

/// A step or DAG task that may carry a loop.
pub(crate) trait Expandable: Serialize + DeserializeOwned + Clone {
  fn name(&self) -> &str;
  fn set_name(&mut self, name: String);
  fn loop_source(&self) -> LoopSource<'_>;
  fn clear_loop(&mut self);
  fn arguments_mut(&mut self) -> &mut Arguments;
}

pub(crate) struct LoopSource<'a> {
  items: Option<&'a Vec<Item>>,
  param: Option<&'a str>,
  sequence: Option<&'a Sequence>,
}

impl LoopSource<'_> {
  fn items(&self) -> Result<Option<Vec<Item>>, OperatorError> {
    Ok(match (self.items, self.param, self.sequence) {
      (Some(items), _, _) => Some(items.clone()),
      (None, Some(raw), _) => Some(items_from_param(raw)?),
      (None, None, Some(sequence)) => Some(sequence.expand()?),
      (None, None, None) => None,
    })
  }
}

impl Expandable for WorkflowStep {
  fn name(&self) -> &str {
    &self.name
  }

  fn set_name(&mut self, name: String) {
    self.name = name;
  }

  fn loop_source(&self) -> LoopSource<'_> {
    LoopSource {
      items: self.with_items.as_ref(),
      param: self.with_param.as_deref(),
      sequence: self.with_sequence.as_ref(),
    }
  }

  fn clear_loop(&mut self) {
    self.with_items = None;
    self.with_param = None;
    self.with_sequence = None;
  }

  fn arguments_mut(&mut self) -> &mut Arguments {
    &mut self.arguments
  }
}

impl Expandable for DagTask {
  fn name(&self) -> &str {
    &self.name
  }

  fn set_name(&mut self, name: String) {
    self.name = name;
  }

  fn loop_source(&self) -> LoopSource<'_> {
    LoopSource {
      items: self.with_items.as_ref(),
      param: self.with_param.as_deref(),
      sequence: self.with_sequence.as_ref(),
    }
  }

  fn clear_loop(&mut self) {
    self.with_items = None;
    self.with_param = None;
    self.with_sequence = None;
  }

  fn arguments_mut(&mut self) -> &mut Arguments {
    &mut self.arguments
  }
}

/// `item` and, for map items, `item.<key>`.
fn item_params(item: &Item) -> Params {
  let mut params = Params::new();
  params.insert("item".to_string(), item.to_item_string());
  for (key, value) in item.map_entries() {
    params.insert(format!("item.{key}"), value);
  }
  params
}

/// `name(i:item)`
pub(crate) fn expanded_name(name: &str, index: usize, item: &Item) -> String {
  format!("{name}({index}:{})", item.to_item_string())
}

/// One copy per loop item with `{{item...}}` substituted and the loop
/// fields cleared. A step without a loop comes back unchanged; an empty
/// loop yields no copies.
pub(crate) fn expand<T: Expandable>(step: &T) -> Result<Vec<T>, OperatorError> {
  let Some(items) = step.loop_source().items()? else {
    return Ok(vec![step.clone()]);
  };
  let mut base = step.clone();
  base.clear_loop();

  let mut expanded = Vec::with_capacity(items.len());
  for (index, item) in items.iter().enumerate() {
    let mut copy = substitute(&base, &item_params(item), ITEM_REQUIRED)?;
    copy.set_name(expanded_name(step.name(), index, item));
    expanded.push(copy);
  }
  Ok(expanded)
}

#[cfg(test)]
mod tests {
  use super::*;
  use weft_workflow::Parameter;

  fn step_with_items(items: Vec<Item>) -> WorkflowStep {
    WorkflowStep {
      name: "print".into(),
      template: Some("echo".into()),
      arguments: Arguments {
        parameters: vec![Parameter::with_value("msg", "{{item}}")],
        ..Default::default()
      },
      with_items: Some(items),
      ..Default::default()
    }
  }

  #[test]
  fn test_scalar_items_expand_in_order() {
    let step = step_with_items(vec![
      Item::String("a".into()),
      Item::Number(2.into()),
      Item::Bool(true),
    ]);
    let out = expand(&step).unwrap();
    let names: Vec<&str> = out.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["print(0:a)", "print(1:2)", "print(2:true)"]);
    assert_eq!(out[1].arguments.parameters[0].value.as_deref(), Some("2"));
    assert!(out.iter().all(|s| !s.is_expanded()));
  }

  #[test]
  fn test_map_items_expose_keys() {
    let item = Item::from_json(serde_json::json!({"os": "debian", "version": 9})).unwrap();
    let mut step = step_with_items(vec![item]);
    step.arguments.parameters[0].value = Some("{{item.os}}-{{item.version}}".into());
    let out = expand(&step).unwrap();
    assert_eq!(out[0].arguments.parameters[0].value.as_deref(), Some("debian-9"));
  }

  #[test]
  fn test_missing_item_key_is_an_error() {
    let mut step = step_with_items(vec![Item::String("a".into())]);
    step.arguments.parameters[0].value = Some("{{item.nope}}".into());
    assert!(matches!(expand(&step), Err(OperatorError::Validation { .. })));
  }

  #[test]
  fn test_with_param_and_sequence() {
    let task = DagTask {
      name: "t".into(),
      template: Some("echo".into()),
      with_param: Some(r#"["x","y"]"#.into()),
      ..Default::default()
    };
    let out = expand(&task).unwrap();
    assert_eq!(out[1].name, "t(1:y)");

    let task = DagTask {
      name: "n".into(),
      template: Some("echo".into()),
      with_sequence: Some(Sequence {
        count: Some("3".into()),
        ..Default::default()
      }),
      ..Default::default()
    };
    let names: Vec<String> = expand(&task).unwrap().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["n(0:0)", "n(1:1)", "n(2:2)"]);

    let empty = step_with_items(Vec::new());
    assert!(expand(&empty).unwrap().is_empty());

    let plain = WorkflowStep {
      name: "once".into(),
      ..Default::default()
    };
    assert_eq!(expand(&plain).unwrap(), vec![plain]);
  }
}
