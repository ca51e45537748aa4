//! Leaf nodes backed by a pod or claimed by a template executor, and the
//! assessment of pods the scheduler reports.

use std::collections::HashSet;

use tracing::{debug, info, warn};
use weft_plugin::NodeResult;
use weft_workflow::{
  LABEL_WORKFLOW, NodePhase, NodeStatus, NodeType, Outputs, Pod, PodPhase, PodSpec, Template, TerminationMessage,
};

use crate::context::{NodeRequest, Operation};
use crate::error::OperatorError;
use crate::substitute::{Params, substitute};

/// Annotation carrying the display path of the node a pod runs.
pub const ANNOTATION_NODE_NAME: &str = "weft.dev/node-name";

/// Annotation naming the container runtime executor the pod runs under.
pub const ANNOTATION_EXECUTOR: &str = "weft.dev/executor";

fn pod_phase_to_node(phase: PodPhase) -> NodePhase {
  match phase {
    PodPhase::Pending => NodePhase::Pending,
    PodPhase::Running => NodePhase::Running,
    PodPhase::Succeeded => NodePhase::Succeeded,
    PodPhase::Failed => NodePhase::Failed,
    PodPhase::Unknown => NodePhase::Error,
  }
}

/// Fill the declared outputs with what the container reported. A declared
/// parameter the container did not report falls back to its
/// `valueFrom.default`.
fn merge_reported(declared: Option<Outputs>, reported: Option<Outputs>) -> Option<Outputs> {
  let Some(mut outputs) = declared else {
    return reported;
  };
  let reported = reported.unwrap_or_default();
  for param in &mut outputs.parameters {
    let value = reported
      .parameters
      .iter()
      .find(|p| p.name == param.name)
      .and_then(|p| p.value.clone())
      .or_else(|| param.value_from.as_ref().and_then(|vf| vf.default.clone()));
    if value.is_some() {
      param.value = value;
    }
  }
  for artifact in &mut outputs.artifacts {
    if let Some(location) = reported
      .artifacts
      .iter()
      .find(|a| a.name == artifact.name)
      .and_then(|a| a.location.clone())
    {
      artifact.location = Some(location);
    }
  }
  if reported.result.is_some() {
    outputs.result = reported.result;
  }
  Some(outputs)
}

/// Write the full pod spec to the log, for debugging what a pod was given.
fn log_pod_spec(spec: &PodSpec, event: &'static str) {
  match serde_json::to_string(spec) {
    Ok(json) => info!(pod = %spec.name, spec = %json, "{event}"),
    Err(e) => warn!(pod = %spec.name, error = %e, "pod_spec_not_encoded"),
  }
}

impl Operation<'_> {
  pub(crate) async fn execute_pod(
    &mut self,
    req: &NodeRequest,
    node_id: &str,
    existing: Option<NodeStatus>,
    template: &Template,
  ) -> Result<NodeStatus, OperatorError> {
    let claimed_before = existing.as_ref().is_some_and(|n| n.node_type == NodeType::Plugin);
    if existing.is_none() || claimed_before {
      if existing.is_none()
        && let Some(reason) = self.stop_reason(req.on_exit)
      {
        return Ok(self.settle(req, node_id, NodeType::Pod, NodePhase::Failed, &reason));
      }
      let candidate = existing
        .clone()
        .unwrap_or_else(|| self.new_node(req, node_id, NodeType::Pod, NodePhase::Pending));

      if existing.is_none()
        && let Some(result) = self.op.plugins.node_pre_execute(&self.wf, template, &candidate).await.value
      {
        return Ok(self.apply_result(candidate, result));
      }
      if let Some(result) = self.op.plugins.execute_template(&self.wf, template, &candidate).await.value {
        let mut node = candidate;
        node.node_type = NodeType::Plugin;
        return Ok(self.apply_result(node, result));
      }
      if claimed_before {
        return Ok(candidate);
      }
    }

    if let Some(node) = &existing
      && self.pods_seen.contains(node_id)
    {
      return Ok(node.clone());
    }

    let mut spec = match self.build_pod_spec(node_id, &req.node_name, template) {
      Ok(spec) => spec,
      Err(e) if e.is_node_failure() => {
        return Ok(self.settle(req, node_id, NodeType::Pod, NodePhase::Failed, &e.to_string()));
      }
      Err(e) => return Err(e),
    };
    self.op.plugins.pod_pre_create(&self.wf, &mut spec).await;
    self.op.pods.create_pod(spec.clone()).await?;
    self.pods_seen.insert(node_id.to_string());
    info!(pod = %spec.name, node = %req.node_name, "pod_created");
    if self.config.pod_spec_log_strategy.all_pods {
      log_pod_spec(&spec, "pod_spec_created");
    }

    let node = match existing {
      Some(node) => node,
      None => {
        let mut node = self.new_node(req, node_id, NodeType::Pod, NodePhase::Pending);
        node.inputs = Some(spec.template.inputs.clone()).filter(|i| !i.is_empty());
        node.outputs = Some(spec.template.outputs.clone()).filter(|o| !o.is_empty());
        self.active_pods += 1;
        self.put_node(node)
      }
    };
    self.op.plugins.pod_post_create(&self.wf, &spec).await;
    Ok(node)
  }

  fn apply_result(&mut self, mut node: NodeStatus, result: NodeResult) -> NodeStatus {
    let message = (!result.message.is_empty()).then_some(result.message.as_str());
    node.mark_phase(result.phase, message, self.now);
    if result.outputs.is_some() {
      node.outputs = result.outputs;
    }
    if result.progress.is_some() {
      node.progress = result.progress;
    }
    debug!(node = %node.name, phase = %node.phase, "node_result_from_plugin");
    self.put_node(node)
  }

  /// The pod for a leaf node: output artifact locations stamped, pod-level
  /// placeholders expanded, workflow label applied.
  fn build_pod_spec(&self, node_id: &str, node_name: &str, template: &Template) -> Result<PodSpec, OperatorError> {
    let mut template = template.clone();
    let archive_location = template
      .archive_location
      .clone()
      .filter(|l| l.has_location())
      .or_else(|| self.default_archive.clone());
    self.artifacts.resolve_outputs(
      &mut template.outputs,
      template.archive_location.as_ref(),
      self.default_archive.as_ref(),
    )?;

    let mut params = Params::new();
    params.insert("pod.name".to_string(), node_id.to_string());
    params.insert("workflow.name".to_string(), self.wf.name().to_string());
    params.insert("node.name".to_string(), node_name.to_string());
    let template = substitute(&template, &params, &[])?;
    let archive_location = archive_location.map(|l| substitute(&l, &params, &[])).transpose()?;

    let mut labels = template.metadata.as_ref().map(|m| m.labels.clone()).unwrap_or_default();
    labels.insert(LABEL_WORKFLOW.to_string(), self.wf.name().to_string());
    let mut annotations = template
      .metadata
      .as_ref()
      .map(|m| m.annotations.clone())
      .unwrap_or_default();
    annotations.insert(ANNOTATION_NODE_NAME.to_string(), node_name.to_string());
    if let Some(executor) = self.config.container_runtime_executor.as_ref().filter(|e| !e.is_empty()) {
      annotations.insert(ANNOTATION_EXECUTOR.to_string(), executor.clone());
    }

    Ok(PodSpec {
      name: node_id.to_string(),
      namespace: self.wf.namespace().to_string(),
      node_id: node_id.to_string(),
      active_deadline_seconds: template.active_deadline_seconds,
      template,
      labels,
      annotations,
      archive_location,
    })
  }

  /// Bring pod nodes in line with the pods the scheduler reports.
  pub(crate) async fn reconcile_pods(&mut self) -> Result<(), OperatorError> {
    let pods = self.op.pods.list_pods(self.wf.namespace(), self.wf.name()).await?;
    self.pods_seen = pods.iter().map(|p| p.node_id().to_string()).collect::<HashSet<_>>();

    let unfulfilled: Vec<String> = self
      .wf
      .status
      .nodes
      .values()
      .filter(|n| n.is_pod() && !n.fulfilled())
      .map(|n| n.id.clone())
      .collect();
    for id in unfulfilled {
      match pods.iter().find(|p| p.node_id() == id) {
        Some(pod) => self.assess_pod(&id, pod),
        None => {
          let now = self.now;
          if let Some(node) = self.wf.status.nodes.get_mut(&id)
            && node.phase == NodePhase::Running
          {
            node.mark_phase(NodePhase::Error, Some("pod deleted"), now);
            info!(node = %node.name, "pod_deleted");
          }
        }
      }
    }

    let active = self
      .wf
      .status
      .nodes
      .values()
      .filter(|n| n.is_pod() && !n.fulfilled())
      .count();
    self.active_pods = u32::try_from(active).unwrap_or(u32::MAX);
    Ok(())
  }

  fn assess_pod(&mut self, id: &str, pod: &Pod) {
    let now = self.now;
    let Some(node) = self.wf.status.nodes.get_mut(id) else {
      return;
    };
    if let Some(host) = &pod.status.host_node_name {
      node.host_node_name = Some(host.clone());
    }
    let phase = pod_phase_to_node(pod.status.phase);
    if !phase.fulfilled() {
      node.mark_phase(phase, None, now);
      return;
    }

    let (reported_message, reported) = pod
      .status
      .termination_message
      .as_deref()
      .map(TerminationMessage::demux)
      .unwrap_or_default();
    let mut outputs = merge_reported(node.outputs.take(), reported).unwrap_or_default();
    if let Some(code) = pod.status.exit_code {
      outputs.exit_code = Some(code.to_string());
    }
    node.outputs = Some(outputs).filter(|o| !o.is_empty());

    let message = if !pod.status.message.is_empty() {
      pod.status.message.clone()
    } else if !reported_message.is_empty() {
      reported_message
    } else if phase == NodePhase::Failed {
      format!("Error (exit code {})", pod.status.exit_code.unwrap_or(1))
    } else if pod.status.phase == PodPhase::Unknown {
      "pod phase unknown".to_string()
    } else {
      String::new()
    };
    node.mark_phase(phase, Some(&message), now);
    if let Some(finished) = pod.status.finished_at {
      node.finished_at = Some(finished);
    }
    debug!(node = %node.name, phase = %phase, "pod_assessed");
    let strategy = self.config.pod_spec_log_strategy;
    if phase.failed_or_errored() && strategy.failed_pod && !strategy.all_pods {
      log_pod_spec(&pod.spec, "pod_spec_failed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use weft_workflow::{Parameter, ValueFrom};

  #[test]
  fn test_pod_phase_mapping() {
    assert_eq!(pod_phase_to_node(PodPhase::Unknown), NodePhase::Error);
    assert_eq!(pod_phase_to_node(PodPhase::Succeeded), NodePhase::Succeeded);
    assert_eq!(pod_phase_to_node(PodPhase::Pending), NodePhase::Pending);
  }

  #[test]
  fn test_reported_outputs_fill_declared() {
    let declared = Outputs {
      parameters: vec![
        Parameter {
          name: "count".into(),
          value_from: Some(ValueFrom {
            path: Some("/tmp/count".into()),
            ..Default::default()
          }),
          ..Default::default()
        },
        Parameter {
          name: "fallback".into(),
          value_from: Some(ValueFrom {
            path: Some("/tmp/missing".into()),
            default: Some("none".into()),
            ..Default::default()
          }),
          ..Default::default()
        },
      ],
      ..Default::default()
    };
    let reported = Outputs {
      parameters: vec![Parameter::with_value("count", "7")],
      result: Some("ok".into()),
      ..Default::default()
    };
    let merged = merge_reported(Some(declared), Some(reported)).unwrap();
    assert_eq!(merged.parameters[0].value.as_deref(), Some("7"));
    assert_eq!(merged.parameters[1].value.as_deref(), Some("none"));
    assert_eq!(merged.result.as_deref(), Some("ok"));
  }

  #[test]
  fn test_undeclared_outputs_pass_through() {
    let reported = Outputs {
      result: Some("hi".into()),
      ..Default::default()
    };
    assert_eq!(merge_reported(None, Some(reported.clone())), Some(reported));
  }
}
