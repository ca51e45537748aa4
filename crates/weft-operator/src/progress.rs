use std::collections::HashSet;

use weft_workflow::{Nodes, Progress};

/// Recompute `progress` on every node and return the workflow total.
///
/// Leaf work nodes count `1/1` once fulfilled, `0/1` before. Every other
/// node sums the leaves below it, counting each leaf once even when it is
/// reachable along several paths (DAG fan-in). A subtree with no leaves has
/// no progress.
pub fn update_progress(nodes: &mut Nodes) -> Option<Progress> {
  let ids: Vec<String> = nodes.keys().cloned().collect();
  for id in &ids {
    let progress = match nodes.get(id) {
      Some(node) if node.node_type.is_leaf_work() => leaf_progress(node),
      Some(_) => subtree_progress(nodes, id),
      None => continue,
    };
    if let Some(node) = nodes.get_mut(id) {
      node.progress = progress.is_valid().then_some(progress);
    }
  }

  let total = nodes
    .values()
    .filter(|n| n.node_type.is_leaf_work())
    .fold(Progress::default(), |acc, n| acc + leaf_progress(n));
  total.is_valid().then_some(total)
}

fn subtree_progress(nodes: &Nodes, id: &str) -> Progress {
  let mut visited = HashSet::new();
  let mut stack = vec![id.to_string()];
  let mut sum = Progress::default();
  while let Some(current) = stack.pop() {
    if !visited.insert(current.clone()) {
      continue;
    }
    let Some(node) = nodes.get(&current) else {
      continue;
    };
    if node.node_type.is_leaf_work() {
      sum = sum + leaf_progress(node);
    }
    stack.extend(node.children.iter().cloned());
  }
  sum
}

fn leaf_progress(node: &weft_workflow::NodeStatus) -> Progress {
  // A plugin may report finer-grained progress of its own.
  match node.progress.filter(|p| p.is_valid() && !node.fulfilled()) {
    Some(reported) => reported,
    None => Progress::for_leaf(node.fulfilled()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;
  use weft_workflow::{NodePhase, NodeStatus, NodeType};

  fn node(id: &str, node_type: NodeType, phase: NodePhase, children: &[&str]) -> NodeStatus {
    let mut node = NodeStatus::new(id, id, id, node_type, phase, Utc::now());
    node.children = children.iter().map(|c| c.to_string()).collect();
    node
  }

  fn nodes(list: Vec<NodeStatus>) -> Nodes {
    list.into_iter().map(|n| (n.id.clone(), n)).collect()
  }

  #[test]
  fn test_fan_in_counts_leaf_once() {
    // root -> a, b ; a -> c ; b -> c
    let mut map = nodes(vec![
      node("root", NodeType::Dag, NodePhase::Running, &["a", "b"]),
      node("a", NodeType::Pod, NodePhase::Succeeded, &["c"]),
      node("b", NodeType::Pod, NodePhase::Succeeded, &["c"]),
      node("c", NodeType::Pod, NodePhase::Running, &[]),
    ]);
    let total = update_progress(&mut map);
    assert_eq!(total, Some(Progress::new(2, 3)));
    assert_eq!(map["root"].progress, Some(Progress::new(2, 3)));
    assert_eq!(map["a"].progress, Some(Progress::new(1, 1)));
    assert_eq!(map["c"].progress, Some(Progress::new(0, 1)));
  }

  #[test]
  fn test_no_leaves_means_no_progress() {
    let mut map = nodes(vec![
      node("root", NodeType::Steps, NodePhase::Running, &["s"]),
      node("s", NodeType::Suspend, NodePhase::Running, &[]),
    ]);
    assert_eq!(update_progress(&mut map), None);
    assert_eq!(map["root"].progress, None);
  }
}
