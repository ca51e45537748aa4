//! A pod runner that plays pods through a script instead of running
//! containers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use weft_workflow::{Outputs, Pod, PodPhase, TerminationMessage};

use crate::cluster::PodStore;

const SIM_NODE: &str = "weft-sim";
const DEADLINE_MESSAGE: &str = "Pod was active on the node longer than the specified deadline";

/// How one pod ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodOutcome {
  pub phase: PodPhase,
  pub exit_code: Option<i32>,
  /// Reported through the termination message.
  pub message: String,
  pub outputs: Option<Outputs>,
  /// Time spent Running, in milliseconds.
  pub run_millis: u64,
}

impl Default for PodOutcome {
  fn default() -> Self {
    Self {
      phase: PodPhase::Succeeded,
      exit_code: None,
      message: String::new(),
      outputs: None,
      run_millis: 0,
    }
  }
}

impl PodOutcome {
  pub fn failed(message: impl Into<String>) -> Self {
    Self {
      phase: PodPhase::Failed,
      exit_code: Some(1),
      message: message.into(),
      ..Self::default()
    }
  }

  fn exit_code(&self) -> i32 {
    self
      .exit_code
      .unwrap_or(if self.phase == PodPhase::Succeeded { 0 } else { 1 })
  }
}

/// Outcomes by template name.
///
/// The n-th pod of a template gets the n-th outcome; the last one repeats.
/// Templates not listed get `default`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodScript {
  pub default: PodOutcome,
  pub templates: BTreeMap<String, Vec<PodOutcome>>,
}

impl PodScript {
  pub fn with_template(mut self, template: impl Into<String>, outcomes: Vec<PodOutcome>) -> Self {
    self.templates.insert(template.into(), outcomes);
    self
  }

  pub fn outcome(&self, template: &str, n: usize) -> &PodOutcome {
    match self.templates.get(template) {
      Some(outcomes) if !outcomes.is_empty() => &outcomes[n.min(outcomes.len() - 1)],
      _ => &self.default,
    }
  }
}

#[derive(Default)]
struct RunnerState {
  assigned: HashMap<String, PodOutcome>,
  started: HashMap<String, usize>,
}

/// Moves pods Pending → Running → the scripted phase.
pub struct PodRunner {
  pods: Arc<PodStore>,
  script: PodScript,
  state: Mutex<RunnerState>,
}

impl PodRunner {
  pub fn new(pods: Arc<PodStore>, script: PodScript) -> Self {
    Self {
      pods,
      script,
      state: Mutex::new(RunnerState::default()),
    }
  }

  fn outcome_for(&self, pod: &Pod) -> PodOutcome {
    let key = format!("{}/{}", pod.spec.namespace, pod.name());
    let mut state = self.state.lock();
    if let Some(outcome) = state.assigned.get(&key) {
      return outcome.clone();
    }
    let template = pod.spec.template.name.clone();
    let count = state.started.entry(template.clone()).or_insert(0);
    let outcome = self.script.outcome(&template, *count).clone();
    *count += 1;
    state.assigned.insert(key, outcome.clone());
    outcome
  }

  /// Advance every unfinished pod by one step. Returns how many changed.
  pub fn step(&self, now: DateTime<Utc>) -> usize {
    let mut changed = 0;
    for pod in self.pods.list() {
      let (namespace, name) = (pod.spec.namespace.clone(), pod.name().to_string());
      match pod.status.phase {
        PodPhase::Pending => {
          self.outcome_for(&pod);
          self.pods.update_status(&namespace, &name, |pod| {
            pod.status.phase = PodPhase::Running;
            pod.status.started_at = Some(now);
            pod.status.host_node_name = Some(SIM_NODE.to_string());
          });
          debug!(pod = %name, "pod_running");
          changed += 1;
        }
        PodPhase::Running => {
          let outcome = self.outcome_for(&pod);
          let started = pod.status.started_at.unwrap_or(now);
          let past_deadline = pod
            .spec
            .active_deadline_seconds
            .and_then(chrono::Duration::try_seconds)
            .and_then(|d| started.checked_add_signed(d))
            .is_some_and(|deadline| now >= deadline);
          if past_deadline {
            self.pods.update_status(&namespace, &name, |pod| {
              pod.status.phase = PodPhase::Failed;
              pod.status.message = DEADLINE_MESSAGE.to_string();
              pod.status.finished_at = Some(now);
            });
            changed += 1;
            continue;
          }
          let run_for = chrono::Duration::milliseconds(i64::try_from(outcome.run_millis).unwrap_or(i64::MAX));
          if started.checked_add_signed(run_for).is_some_and(|done_at| now < done_at) {
            continue;
          }
          self.pods.update_status(&namespace, &name, |pod| finish(pod, &outcome, now));
          info!(pod = %name, phase = ?outcome.phase, "pod_finished");
          changed += 1;
        }
        PodPhase::Succeeded | PodPhase::Failed | PodPhase::Unknown => {}
      }
    }
    changed
  }

  /// Step every `tick` until cancelled.
  pub async fn run(&self, cancel: CancellationToken, tick: Duration) {
    let mut interval = tokio::time::interval(tick);
    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          debug!("pod_runner_stopped");
          break;
        }
        _ = interval.tick() => {
          self.step(Utc::now());
        }
      }
    }
  }
}

fn finish(pod: &mut Pod, outcome: &PodOutcome, now: DateTime<Utc>) {
  pod.status.phase = outcome.phase;
  pod.status.exit_code = Some(outcome.exit_code());
  if !outcome.message.is_empty() || outcome.outputs.is_some() {
    pod.status.termination_message = Some(TerminationMessage::mux(&outcome.message, outcome.outputs.as_ref()));
  }
  pod.status.finished_at = Some(now);
}
