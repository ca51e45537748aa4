//! `{{ ... }}` placeholder expansion.
//!
//! Placeholder names contain `.` and `-` (`steps.gen-data.outputs.result`),
//! so they are matched with a plain regex rather than a template engine.
//! Expansion walks every string of a value through its JSON form.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::OperatorError;

static PLACEHOLDER: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("placeholder pattern is valid"));

/// Flat parameter table: `inputs.parameters.x` -> value.
pub type Params = BTreeMap<String, String>;

/// Placeholder roots that must resolve during the template pass.
pub(crate) const TEMPLATE_REQUIRED: &[&str] = &["inputs"];
/// ... during loop expansion.
pub(crate) const ITEM_REQUIRED: &[&str] = &["item"];
/// ... when a step or task's references to earlier nodes are resolved.
pub(crate) const REFERENCE_REQUIRED: &[&str] = &["steps", "tasks"];

fn is_required(key: &str, roots: &[&str]) -> bool {
  roots
    .iter()
    .any(|root| key == *root || key.strip_prefix(root).is_some_and(|rest| rest.starts_with('.')))
}

/// Expand the placeholders in `input`. Unknown placeholders stay literal
/// unless their root is listed in `required`.
pub fn substitute_str(input: &str, params: &Params, required: &[&str]) -> Result<String, OperatorError> {
  if !input.contains("{{") {
    return Ok(input.to_string());
  }
  let mut missing: Option<String> = None;
  let out = PLACEHOLDER.replace_all(input, |caps: &Captures| {
    let key = caps[1].trim();
    match params.get(key) {
      Some(value) => value.clone(),
      None => {
        if missing.is_none() && is_required(key, required) {
          missing = Some(key.to_string());
        }
        caps[0].to_string()
      }
    }
  });
  match missing {
    Some(key) => Err(OperatorError::validation(format!("failed to resolve {{{{{key}}}}}"))),
    None => Ok(out.into_owned()),
  }
}

/// Expand an expression that must resolve completely, as used by
/// `valueFrom.parameter`.
pub fn resolve_expression(expr: &str, params: &Params) -> Option<String> {
  let mut unresolved = false;
  let out = PLACEHOLDER.replace_all(expr, |caps: &Captures| match params.get(caps[1].trim()) {
    Some(value) => value.clone(),
    None => {
      unresolved = true;
      String::new()
    }
  });
  (!unresolved).then(|| out.into_owned())
}

/// The placeholder name if `expr` is exactly one placeholder.
pub fn placeholder_name(expr: &str) -> Option<&str> {
  let caps = PLACEHOLDER.captures(expr.trim())?;
  let whole = caps.get(0)?;
  (whole.as_str().len() == expr.trim().len()).then(|| caps.get(1).map(|m| m.as_str().trim()))?
}

fn substitute_value(value: &mut Value, params: &Params, required: &[&str]) -> Result<(), OperatorError> {
  match value {
    Value::String(s) => {
      *s = substitute_str(s, params, required)?;
    }
    Value::Array(values) => {
      for v in values {
        substitute_value(v, params, required)?;
      }
    }
    Value::Object(map) => {
      for v in map.values_mut() {
        substitute_value(v, params, required)?;
      }
    }
    Value::Null | Value::Bool(_) | Value::Number(_) => {}
  }
  Ok(())
}

/// Expand every string field of `value`.
pub fn substitute<T>(value: &T, params: &Params, required: &[&str]) -> Result<T, OperatorError>
where
  T: Serialize + DeserializeOwned,
{
  let mut json = serde_json::to_value(value)?;
  substitute_value(&mut json, params, required)?;
  Ok(serde_json::from_value(json)?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use weft_workflow::{ContainerTemplate, Template, TemplateKind};

  fn params(pairs: &[(&str, &str)]) -> Params {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
  }

  #[test]
  fn test_known_placeholders_expand_with_whitespace() {
    let p = params(&[("inputs.parameters.msg", "hi"), ("workflow.name", "wf-1")]);
    let out = substitute_str("echo {{ inputs.parameters.msg }} from {{workflow.name}}", &p, TEMPLATE_REQUIRED).unwrap();
    assert_eq!(out, "echo hi from wf-1");
  }

  #[test]
  fn test_unknown_optional_placeholders_stay_literal() {
    let out = substitute_str("{{steps.a.outputs.result}} {{item}}", &Params::new(), TEMPLATE_REQUIRED).unwrap();
    assert_eq!(out, "{{steps.a.outputs.result}} {{item}}");
  }

  #[test]
  fn test_unknown_required_placeholder_is_validation_error() {
    let err = substitute_str("{{inputs.parameters.missing}}", &Params::new(), TEMPLATE_REQUIRED).unwrap_err();
    assert!(matches!(err, OperatorError::Validation { .. }));
    assert!(err.to_string().contains("inputs.parameters.missing"));

    // "items" is not under the "item" root
    assert!(substitute_str("{{items}}", &Params::new(), ITEM_REQUIRED).is_ok());
    assert!(substitute_str("{{item.os}}", &Params::new(), ITEM_REQUIRED).is_err());
  }

  #[test]
  fn test_substitute_walks_nested_fields() {
    let template = Template::new(
      "echo",
      TemplateKind::Container(ContainerTemplate {
        image: "alpine:{{inputs.parameters.tag}}".into(),
        args: vec!["{{inputs.parameters.msg}}".into()],
        ..Default::default()
      }),
    );
    let p = params(&[("inputs.parameters.tag", "3.19"), ("inputs.parameters.msg", "hello")]);
    let out = substitute(&template, &p, TEMPLATE_REQUIRED).unwrap();
    let TemplateKind::Container(c) = out.kind else {
      panic!("expected a container template");
    };
    assert_eq!(c.image, "alpine:3.19");
    assert_eq!(c.args, vec!["hello".to_string()]);
  }

  #[test]
  fn test_expression_resolution_is_all_or_nothing() {
    let p = params(&[("steps.a.outputs.result", "42")]);
    assert_eq!(resolve_expression("{{steps.a.outputs.result}}", &p).as_deref(), Some("42"));
    assert_eq!(resolve_expression("{{steps.b.outputs.result}}", &p), None);
    assert_eq!(placeholder_name(" {{ steps.a.outputs.artifacts.out }} "), Some("steps.a.outputs.artifacts.out"));
    assert_eq!(placeholder_name("x-{{steps.a}}"), None);
  }
}
