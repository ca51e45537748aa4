use std::collections::{HashMap, HashSet};

use crate::error::WorkflowError;
use crate::template::DagTemplate;

/// Dependency graph of the tasks in a DAG template.
#[derive(Debug, Clone)]
pub struct DagGraph {
  /// Task name -> tasks that depend on it, in declaration order.
  adjacency: HashMap<String, Vec<String>>,
  /// Task name -> its dependencies.
  reverse_adjacency: HashMap<String, Vec<String>>,
  /// Tasks with no dependencies.
  entry_points: Vec<String>,
  /// Tasks nothing depends on; the DAG's outbound targets.
  leaves: Vec<String>,
  order: Vec<String>,
}

impl DagGraph {
  /// Build the graph, rejecting dependencies on unknown tasks.
  pub fn new(template_name: &str, dag: &DagTemplate) -> Result<Self, WorkflowError> {
    let names: HashSet<&str> = dag.tasks.iter().map(|t| t.name.as_str()).collect();
    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut reverse_adjacency: HashMap<String, Vec<String>> = HashMap::new();

    for task in &dag.tasks {
      adjacency.entry(task.name.clone()).or_default();
      reverse_adjacency.entry(task.name.clone()).or_default();
    }

    for task in &dag.tasks {
      for dep in &task.dependencies {
        if !names.contains(dep.as_str()) {
          return Err(WorkflowError::UnknownDependency {
            template: template_name.to_string(),
            task: task.name.clone(),
            dependency: dep.clone(),
          });
        }
        adjacency.entry(dep.clone()).or_default().push(task.name.clone());
        reverse_adjacency
          .entry(task.name.clone())
          .or_default()
          .push(dep.clone());
      }
    }

    let order: Vec<String> = dag.tasks.iter().map(|t| t.name.clone()).collect();
    let entry_points = order
      .iter()
      .filter(|n| reverse_adjacency.get(*n).is_none_or(|v| v.is_empty()))
      .cloned()
      .collect();
    let leaves = order
      .iter()
      .filter(|n| adjacency.get(*n).is_none_or(|v| v.is_empty()))
      .cloned()
      .collect();

    Ok(Self {
      adjacency,
      reverse_adjacency,
      entry_points,
      leaves,
      order,
    })
  }

  pub fn entry_points(&self) -> &[String] {
    &self.entry_points
  }

  pub fn leaves(&self) -> &[String] {
    &self.leaves
  }

  /// Task names in declaration order.
  pub fn tasks(&self) -> &[String] {
    &self.order
  }

  pub fn downstream(&self, task: &str) -> &[String] {
    self.adjacency.get(task).map(|v| v.as_slice()).unwrap_or(&[])
  }

  pub fn dependencies(&self, task: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(task)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// DFS colouring; a back edge is a cycle.
  pub fn detect_cycle(&self, template_name: &str) -> Result<(), WorkflowError> {
    // 0 = unvisited, 1 = on the stack, 2 = done
    let mut color: HashMap<&str, u8> = self.order.iter().map(|n| (n.as_str(), 0u8)).collect();

    fn dfs<'a>(
      task: &'a str,
      adjacency: &'a HashMap<String, Vec<String>>,
      color: &mut HashMap<&'a str, u8>,
    ) -> bool {
      color.insert(task, 1);
      if let Some(next) = adjacency.get(task) {
        for neighbor in next {
          match color.get(neighbor.as_str()) {
            Some(1) => return true,
            Some(0) => {
              if dfs(neighbor, adjacency, color) {
                return true;
              }
            }
            _ => {}
          }
        }
      }
      color.insert(task, 2);
      false
    }

    for task in &self.order {
      if color.get(task.as_str()) == Some(&0) && dfs(task, &self.adjacency, &mut color) {
        return Err(WorkflowError::CycleDetected {
          template: template_name.to_string(),
        });
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::template::DagTask;

  fn task(name: &str, deps: &[&str]) -> DagTask {
    DagTask {
      name: name.to_string(),
      template: Some("echo".to_string()),
      dependencies: deps.iter().map(|d| d.to_string()).collect(),
      ..Default::default()
    }
  }

  #[test]
  fn test_diamond() {
    let dag = DagTemplate {
      tasks: vec![
        task("a", &[]),
        task("b", &["a"]),
        task("c", &["a"]),
        task("d", &["b", "c"]),
      ],
      fail_fast: None,
    };
    let graph = DagGraph::new("main", &dag).unwrap();
    assert_eq!(graph.entry_points(), ["a"]);
    assert_eq!(graph.leaves(), ["d"]);
    assert_eq!(graph.downstream("a"), ["b", "c"]);
    assert_eq!(graph.dependencies("d"), ["b", "c"]);
    assert!(graph.detect_cycle("main").is_ok());
  }

  #[test]
  fn test_cycle_is_detected() {
    let dag = DagTemplate {
      tasks: vec![task("a", &["c"]), task("b", &["a"]), task("c", &["b"])],
      fail_fast: None,
    };
    let graph = DagGraph::new("main", &dag).unwrap();
    assert!(matches!(
      graph.detect_cycle("main"),
      Err(WorkflowError::CycleDetected { .. })
    ));
  }

  #[test]
  fn test_unknown_dependency() {
    let dag = DagTemplate {
      tasks: vec![task("a", &["ghost"])],
      fail_fast: None,
    };
    assert!(matches!(
      DagGraph::new("main", &dag),
      Err(WorkflowError::UnknownDependency { .. })
    ));
  }
}
