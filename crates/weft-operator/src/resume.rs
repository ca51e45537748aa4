//! Resuming suspended workflows and suspend nodes.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use tracing::info;
use weft_workflow::{NodePhase, NodeStatus, NodeType, Workflow};

use crate::error::OperatorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
  Equals,
  NotEquals,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Requirement {
  field: String,
  op: Op,
  value: String,
}

/// Picks nodes by field, e.g. `displayName=approve,phase!=Succeeded`.
///
/// Supported fields: `id`, `name`, `displayName`, `templateName`, `phase`
/// and `inputs.parameters.<name>.value`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeFieldSelector {
  requirements: Vec<Requirement>,
}

impl FromStr for NodeFieldSelector {
  type Err = OperatorError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut requirements = Vec::new();
    for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
      let (field, op, value) = if let Some((field, value)) = term.split_once("!=") {
        (field, Op::NotEquals, value)
      } else if let Some((field, value)) = term.split_once("==") {
        (field, Op::Equals, value)
      } else if let Some((field, value)) = term.split_once('=') {
        (field, Op::Equals, value)
      } else {
        return Err(OperatorError::validation(format!("invalid node field selector term '{term}'")));
      };
      let field = field.trim();
      if !is_known_field(field) {
        return Err(OperatorError::validation(format!("unsupported node field '{field}'")));
      }
      requirements.push(Requirement {
        field: field.to_string(),
        op,
        value: value.trim().to_string(),
      });
    }
    Ok(Self { requirements })
  }
}

fn is_known_field(field: &str) -> bool {
  matches!(field, "id" | "name" | "displayName" | "templateName" | "phase")
    || field
      .strip_prefix("inputs.parameters.")
      .and_then(|rest| rest.strip_suffix(".value"))
      .is_some_and(|name| !name.is_empty())
}

fn field_value(node: &NodeStatus, field: &str) -> Option<String> {
  match field {
    "id" => Some(node.id.clone()),
    "name" => Some(node.name.clone()),
    "displayName" => Some(node.display_name.clone()),
    "templateName" => node.template_name.clone(),
    "phase" => Some(node.phase.as_str().to_string()),
    _ => {
      let name = field.strip_prefix("inputs.parameters.")?.strip_suffix(".value")?;
      node
        .inputs
        .as_ref()?
        .parameters
        .iter()
        .find(|p| p.name == name)
        .and_then(|p| p.value.clone())
    }
  }
}

impl NodeFieldSelector {
  pub fn matches(&self, node: &NodeStatus) -> bool {
    self.requirements.iter().all(|r| {
      let actual = field_value(node, &r.field);
      match r.op {
        Op::Equals => actual.as_deref() == Some(r.value.as_str()),
        Op::NotEquals => actual.as_deref() != Some(r.value.as_str()),
      }
    })
  }
}

/// Clear `spec.suspend` and succeed the running suspend nodes the selector
/// picks (all of them without a selector). Returns whether anything changed.
pub fn resume_workflow(wf: &mut Workflow, selector: Option<&str>, now: DateTime<Utc>) -> Result<bool, OperatorError> {
  let selector: NodeFieldSelector = selector.unwrap_or("").parse()?;
  let mut changed = wf.spec.suspend.take().is_some_and(|suspended| suspended);

  for node in wf.status.nodes.values_mut() {
    if node.node_type == NodeType::Suspend && node.phase == NodePhase::Running && selector.matches(node) {
      node.mark_phase(NodePhase::Succeeded, None, now);
      info!(node = %node.name, "node_resumed");
      changed = true;
    }
  }
  Ok(changed)
}

#[cfg(test)]
mod tests {
  use super::*;
  use weft_workflow::{Inputs, Parameter, WorkflowSpec};

  fn suspended(id: &str, display: &str) -> NodeStatus {
    let mut node = NodeStatus::new(id, id, display, NodeType::Suspend, NodePhase::Running, Utc::now());
    node.inputs = Some(Inputs {
      parameters: vec![Parameter::with_value("who", display)],
      ..Default::default()
    });
    node
  }

  #[test]
  fn test_selector_parsing() {
    let selector: NodeFieldSelector = "displayName=approve, phase!=Succeeded".parse().unwrap();
    assert_eq!(selector.requirements.len(), 2);
    assert!("bogus".parse::<NodeFieldSelector>().is_err());
    assert!("color=red".parse::<NodeFieldSelector>().is_err());
    assert!("inputs.parameters.who.value==ops".parse::<NodeFieldSelector>().is_ok());
  }

  #[test]
  fn test_resume_only_selected_nodes() {
    let mut wf = Workflow::new("ns", "wf", WorkflowSpec::default());
    for node in [suspended("wf-1", "approve"), suspended("wf-2", "review")] {
      wf.status.nodes.insert(node.id.clone(), node);
    }
    let changed = resume_workflow(&mut wf, Some("inputs.parameters.who.value=approve"), Utc::now()).unwrap();
    assert!(changed);
    assert_eq!(wf.status.nodes["wf-1"].phase, NodePhase::Succeeded);
    assert_eq!(wf.status.nodes["wf-2"].phase, NodePhase::Running);

    assert!(resume_workflow(&mut wf, None, Utc::now()).unwrap());
    assert_eq!(wf.status.nodes["wf-2"].phase, NodePhase::Succeeded);
    assert!(!resume_workflow(&mut wf, None, Utc::now()).unwrap());
  }

  #[test]
  fn test_resume_clears_workflow_suspend() {
    let mut wf = Workflow::new("ns", "wf", WorkflowSpec::default());
    wf.spec.suspend = Some(true);
    assert!(resume_workflow(&mut wf, None, Utc::now()).unwrap());
    assert_eq!(wf.spec.suspend, None);
  }
}
