//! DAG templates: tasks started as soon as their dependencies allow.

use std::collections::{HashMap, VecDeque};

use weft_resolver::TemplateScope;
use weft_workflow::{ContinueOn, DagGraph, DagTask, DagTemplate, NodePhase, NodeStatus, NodeType, Template};

use crate::context::{NodeRequest, Operation};
use crate::error::OperatorError;
use crate::expand::expand;
use crate::scope::Scope;
use crate::steps::{SKIPPED_EMPTY, template_outputs};

const OMITTED: &str = "omitted: depends condition not met";

/// Kahn's algorithm, breaking ties by declaration order.
fn topological_order(graph: &DagGraph) -> Vec<String> {
  let mut indegree: HashMap<&str, usize> = graph
    .tasks()
    .iter()
    .map(|t| (t.as_str(), graph.dependencies(t).len()))
    .collect();
  let mut ready: VecDeque<&str> = graph
    .tasks()
    .iter()
    .map(String::as_str)
    .filter(|t| indegree.get(t) == Some(&0))
    .collect();
  let mut order = Vec::with_capacity(graph.tasks().len());
  while let Some(task) = ready.pop_front() {
    order.push(task.to_string());
    for next in graph.downstream(task) {
      if let Some(degree) = indegree.get_mut(next.as_str()) {
        *degree -= 1;
        if *degree == 0 {
          ready.push_back(next.as_str());
        }
      }
    }
  }
  order
}

/// A finished dependency lets its dependents run.
fn satisfies(task: &DagTask, node: &NodeStatus) -> bool {
  matches!(node.phase, NodePhase::Succeeded | NodePhase::Skipped)
    || ContinueOn::continues(task.continue_on.as_ref(), node.phase)
}

/// A finished task whose failure is not excused by `continueOn`.
fn uncovered_failure(task: &DagTask, node: &NodeStatus) -> bool {
  node.phase.failed_or_errored() && !ContinueOn::continues(task.continue_on.as_ref(), node.phase)
}

impl Operation<'_> {
  pub(crate) async fn execute_dag(
    &mut self,
    req: &NodeRequest,
    node_id: &str,
    existing: Option<NodeStatus>,
    template: &Template,
    dag: &DagTemplate,
    scope: &TemplateScope,
  ) -> Result<NodeStatus, OperatorError> {
    if existing.is_none() {
      let node = self.new_node(req, node_id, NodeType::Dag, NodePhase::Running);
      self.put_node(node);
    }
    let graph = match DagGraph::new(&template.name, dag).and_then(|g| g.detect_cycle(&template.name).map(|_| g)) {
      Ok(graph) => graph,
      Err(e) => return Ok(self.finish(node_id, NodePhase::Failed, Some(&e.to_string()), None)),
    };
    let order = topological_order(&graph);
    let task_name = |task: &str| format!("{}.{task}", req.node_name);

    let mut values = Scope::new(&self.globals);
    let mut failure_seen = false;
    for name in &order {
      let Some(task) = dag.task(name) else {
        continue;
      };
      if let Some(node) = self.node_by_name(&task_name(name)).filter(|n| n.fulfilled()) {
        failure_seen |= uncovered_failure(task, node);
        self.expose_task(&mut values, task, node);
      }
    }

    for name in &order {
      let Some(task) = dag.task(name) else {
        continue;
      };
      let node_name = task_name(name);
      let existing = self.node_by_name(&node_name).cloned();
      match &existing {
        Some(node) if node.fulfilled() => continue,
        Some(_) => {}
        None => {
          let deps = graph.dependencies(name);
          let dep_nodes: Vec<Option<&NodeStatus>> = deps.iter().map(|d| self.node_by_name(&task_name(d))).collect();
          if dep_nodes.iter().any(|n| n.is_none_or(|n| !n.fulfilled())) {
            continue;
          }
          let blocked = deps.iter().zip(&dep_nodes).any(|(dep, node)| match (dag.task(dep), node) {
            (Some(dep_task), Some(node)) => !satisfies(dep_task, node),
            _ => true,
          });
          if blocked {
            let omitted = self.omit(req, node_id, &node_name, &task.name);
            self.link_task(node_id, &graph, name, &omitted.id, &task_name);
            continue;
          }
          if failure_seen && dag.fail_fast() {
            continue;
          }
        }
      }

      let task_node = match self
        .execute_task(req, node_id, template, &node_name, task, &values, scope)
        .await
      {
        Ok(node) => node,
        Err(OperatorError::ParallelismReached) => break,
        Err(e) => return Err(e),
      };
      if existing.is_none() {
        self.link_task(node_id, &graph, name, &task_node.id, &task_name);
      }
      if task_node.fulfilled() {
        failure_seen |= uncovered_failure(task, &task_node);
        self.expose_task(&mut values, task, &task_node);
      }
    }

    let mut running = false;
    let mut all_done = true;
    let mut failed: Option<NodeStatus> = None;
    for name in &order {
      let Some(task) = dag.task(name) else {
        continue;
      };
      match self.node_by_name(&task_name(name)) {
        None => all_done = false,
        Some(node) if !node.fulfilled() => {
          all_done = false;
          running = true;
        }
        Some(node) => {
          if failed.is_none() && uncovered_failure(task, node) {
            failed = Some(node.clone());
          }
        }
      }
    }
    let stopped_early = failed.is_some() && dag.fail_fast();
    if running || (!all_done && !stopped_early) {
      return self.get(node_id);
    }

    let outbound: Vec<String> = graph
      .leaves()
      .iter()
      .filter_map(|leaf| self.node_by_name(&task_name(leaf)).map(|n| n.id.clone()))
      .flat_map(|id| self.outbound(&id))
      .collect();
    self.set_outbound(node_id, outbound);

    if let Some(failed) = failed {
      let message = format!("child '{}' failed", failed.id);
      return Ok(self.finish(node_id, failed.phase, Some(&message), None));
    }
    match template_outputs(template, &values) {
      Ok(outputs) => Ok(self.finish(node_id, NodePhase::Succeeded, None, outputs)),
      Err(e) => Ok(self.finish(node_id, NodePhase::Failed, Some(&e.to_string()), None)),
    }
  }

  fn omit(&mut self, req: &NodeRequest, dag_id: &str, node_name: &str, display: &str) -> NodeStatus {
    let id = self.wf.node_id(node_name);
    let mut node = NodeStatus::new(&id, node_name, display, NodeType::Skipped, NodePhase::Omitted, self.now);
    node.message = OMITTED.to_string();
    node.boundary_id = Some(dag_id.to_string());
    node.template_name = req.template.clone();
    self.put_node(node)
  }

  /// Root tasks hang off the DAG node; the rest off the outbound nodes of
  /// their dependencies.
  fn link_task(&mut self, dag_id: &str, graph: &DagGraph, task: &str, task_id: &str, task_name: &dyn Fn(&str) -> String) {
    let deps = graph.dependencies(task);
    if deps.is_empty() {
      self.add_child(dag_id, task_id);
      return;
    }
    let parents: Vec<String> = deps
      .iter()
      .filter_map(|d| self.node_by_name(&task_name(d)).map(|n| n.id.clone()))
      .flat_map(|id| self.outbound(&id))
      .collect();
    for parent in parents {
      self.add_child(&parent, task_id);
    }
  }

  #[allow(clippy::too_many_arguments)]
  async fn execute_task(
    &mut self,
    req: &NodeRequest,
    dag_id: &str,
    template: &Template,
    node_name: &str,
    task: &DagTask,
    values: &Scope,
    scope: &TemplateScope,
  ) -> Result<NodeStatus, OperatorError> {
    let child_req = |name: String, task: &DagTask| NodeRequest {
      node_name: name,
      display_name: task.name.clone(),
      template: task.template.clone(),
      template_ref: task.template_ref.clone(),
      scope: scope.clone(),
      arguments: task.arguments.clone(),
      boundary_id: Some(dag_id.to_string()),
      boundary_parallelism: template.parallelism,
      on_exit: req.on_exit,
    };
    let group_req = child_req(node_name.to_string(), task);
    let group_id = self.wf.node_id(node_name);

    let expanded = match values.resolve(task).and_then(|t| expand(&t)) {
      Ok(expanded) => expanded,
      Err(e) if e.is_node_failure() => {
        return Ok(self.settle(&group_req, &group_id, NodeType::Skipped, NodePhase::Failed, &e.to_string()));
      }
      Err(e) => return Err(e),
    };
    if !task.is_expanded() {
      let Some(resolved) = expanded.into_iter().next() else {
        return Ok(self.settle(&group_req, &group_id, NodeType::Skipped, NodePhase::Skipped, SKIPPED_EMPTY));
      };
      return self.execute_template(child_req(node_name.to_string(), &resolved)).await;
    }
    if expanded.is_empty() {
      return Ok(self.settle(&group_req, &group_id, NodeType::Skipped, NodePhase::Skipped, SKIPPED_EMPTY));
    }

    if self.node(&group_id).is_none() {
      let node = self.new_node(&group_req, &group_id, NodeType::TaskGroup, NodePhase::Running);
      self.put_node(node);
    }
    for child in &expanded {
      let name = format!("{}.{}", req.node_name, child.name);
      match self.execute_template(child_req(name, child)).await {
        Ok(node) => self.add_child(&group_id, &node.id),
        Err(OperatorError::ParallelismReached) => break,
        Err(e) => return Err(e),
      }
    }

    let mut failure: Option<NodeStatus> = None;
    for child in &expanded {
      let name = format!("{}.{}", req.node_name, child.name);
      match self.node_by_name(&name) {
        Some(node) if node.fulfilled() => {
          if failure.is_none() && uncovered_failure(task, node) {
            failure = Some(node.clone());
          }
        }
        _ => return self.get(&group_id),
      }
    }
    Ok(match failure {
      Some(failed) => {
        let message = format!("child '{}' failed", failed.id);
        self.finish(&group_id, failed.phase, Some(&message), None)
      }
      None => self.finish(&group_id, NodePhase::Succeeded, None, None),
    })
  }

  fn expose_task(&self, values: &mut Scope, task: &DagTask, node: &NodeStatus) {
    let prefix = format!("tasks.{}", task.name);
    if task.is_expanded() {
      let children: Vec<&NodeStatus> = node.children.iter().filter_map(|id| self.node(id)).collect();
      values.add_aggregate(&prefix, &children);
    } else {
      values.add_node(&prefix, node);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn task(name: &str, deps: &[&str]) -> DagTask {
    DagTask {
      name: name.to_string(),
      template: Some("echo".to_string()),
      dependencies: deps.iter().map(|d| d.to_string()).collect(),
      ..Default::default()
    }
  }

  #[test]
  fn test_topological_order_respects_dependencies() {
    let dag = DagTemplate {
      tasks: vec![task("d", &["b", "c"]), task("c", &["a"]), task("b", &["a"]), task("a", &[])],
      fail_fast: None,
    };
    let graph = DagGraph::new("main", &dag).unwrap();
    assert_eq!(topological_order(&graph), vec!["a", "c", "b", "d"]);
  }

  #[test]
  fn test_dependency_satisfaction() {
    let now = chrono::Utc::now();
    let failed = NodeStatus::new("x", "x", "x", NodeType::Pod, NodePhase::Failed, now);
    let mut lenient = task("a", &[]);
    assert!(!satisfies(&lenient, &failed));
    assert!(uncovered_failure(&lenient, &failed));
    lenient.continue_on = Some(ContinueOn {
      failed: true,
      ..Default::default()
    });
    assert!(satisfies(&lenient, &failed));
    assert!(!uncovered_failure(&lenient, &failed));
  }
}
