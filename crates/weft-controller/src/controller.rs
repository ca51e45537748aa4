//! The reconcile driver: a pool of workers pulling workflow keys off the
//! queue, running the operator and writing the result back.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use weft_config::Config;
use weft_metrics::ControllerMetrics;
use weft_operator::Operator;
use weft_workflow::{PodPhase, Workflow, WorkflowPhase};

use crate::cluster::InMemoryCluster;
use crate::error::ControllerError;
use crate::events::{ControllerEvent, ControllerNotifier, NoopNotifier};
use crate::queue::WorkQueue;

/// Workflows carrying this label are reconciled only by the controller with
/// the matching `instanceID`.
pub const LABEL_INSTANCE_ID: &str = "weft.dev/controller-instanceid";

const POSTPONED: &str = "Workflow processing has been postponed because too many workflows are already running";
const DEFAULT_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);
const WORKFLOW_QUEUE: &str = "workflow_queue";
const RECONCILE_FAILED: &str = "ReconcileFailed";

/// Where a finished workflow stands against its TTL strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ttl {
  Keep,
  ExpiresIn(Duration),
  Expired,
}

pub struct Controller {
  operator: Arc<Operator>,
  cluster: InMemoryCluster,
  queue: Arc<WorkQueue>,
  notifier: Arc<dyn ControllerNotifier>,
  housekeeping_interval: Duration,
  // Serializes starting workflows so the running count stays accurate.
  admission: Mutex<()>,
}

impl Controller {
  pub fn new(operator: Arc<Operator>, cluster: InMemoryCluster) -> Self {
    Self {
      operator,
      cluster,
      queue: Arc::new(WorkQueue::new()),
      notifier: Arc::new(NoopNotifier),
      housekeeping_interval: DEFAULT_HOUSEKEEPING_INTERVAL,
      admission: Mutex::new(()),
    }
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn ControllerNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  /// How often lock holders of deleted workflows are evicted, expired
  /// workflows and archive rows removed, stale offloads dropped and gauges
  /// refreshed.
  pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
    self.housekeeping_interval = interval;
    self
  }

  pub fn cluster(&self) -> &InMemoryCluster {
    &self.cluster
  }

  pub fn queue(&self) -> &Arc<WorkQueue> {
    &self.queue
  }

  /// Store a new workflow and queue it.
  pub fn submit(&self, wf: Workflow) -> Result<Workflow, ControllerError> {
    if self.queue.is_shutting_down() {
      return Err(ControllerError::ShutDown);
    }
    let wf = self.cluster.workflows.create(wf)?;
    let key = wf.key();
    info!(workflow = %key, "workflow_submitted");
    self.notifier.notify(ControllerEvent::WorkflowSubmitted { key: key.clone() });
    self.queue.add(key);
    Ok(wf)
  }

  /// Reconcile every unfinished workflow against the new configuration.
  /// Semaphore limits are read again on the next acquire.
  pub fn on_config_change(&self, config: &Config) {
    info!(
      parallelism = ?config.parallelism,
      workers = config.workflow_workers(),
      "controller_config_reloaded"
    );
    self.enqueue_where(|wf| !wf.status.phase.fulfilled());
  }

  fn enqueue_where<F>(&self, filter: F) -> usize
  where
    F: Fn(&Workflow) -> bool,
  {
    let mut queued = 0;
    for wf in self.cluster.workflows.list() {
      if filter(&wf) {
        self.queue.add(wf.key());
        queued += 1;
      }
    }
    queued
  }

  fn metrics(&self) -> Option<&ControllerMetrics> {
    self.operator.metrics()
  }

  fn ttl(&self, wf: &Workflow) -> Ttl {
    if !wf.status.phase.fulfilled() {
      return Ttl::Keep;
    }
    let Some(expires) = wf.expires_at() else {
      return Ttl::Keep;
    };
    match (expires - self.operator.clock().now()).to_std() {
      Ok(left) if !left.is_zero() => Ttl::ExpiresIn(left),
      _ => Ttl::Expired,
    }
  }

  /// Requeue a finished workflow in time for its TTL.
  fn requeue_for_ttl(&self, wf: &Workflow, requeue_after: Option<Duration>) -> Option<Duration> {
    let ttl = match self.ttl(wf) {
      Ttl::Keep => return requeue_after,
      Ttl::ExpiresIn(left) => left,
      Ttl::Expired => Duration::ZERO,
    };
    Some(requeue_after.map_or(ttl, |after| after.min(ttl)))
  }

  /// Delete a workflow whose TTL ran out, with its pods.
  fn delete_expired(&self, wf: &Workflow) {
    let key = wf.key();
    if self.cluster.workflows.delete(&key).is_none() {
      return;
    }
    let pods = self.cluster.pods.delete_for(wf.namespace(), wf.name());
    info!(workflow = %key, phase = %wf.status.phase, pods, "workflow_ttl_expired");
    self.notifier.notify(ControllerEvent::WorkflowDeleted { key });
  }

  /// Delete every finished workflow past its TTL. Covers workflows that
  /// finished before this controller started.
  fn collect_expired(&self) -> usize {
    let expired: Vec<Workflow> = self
      .cluster
      .workflows
      .list()
      .into_iter()
      .filter(|wf| self.owns(wf) && self.ttl(wf) == Ttl::Expired)
      .collect();
    for wf in &expired {
      self.delete_expired(wf);
    }
    expired.len()
  }

  /// Drop offloaded node maps that no stored workflow points at anymore.
  async fn collect_offloads(&self) {
    let offload = &self.operator.persistence().offload;
    if !offload.is_enabled() {
      return;
    }
    let old = match offload.list_old_offloads("").await {
      Ok(old) => old,
      Err(e) => {
        warn!(error = %e, "offload_gc_failed");
        return;
      }
    };
    if old.is_empty() {
      return;
    }
    let live: HashSet<(String, String, String)> = self
      .cluster
      .workflows
      .list()
      .into_iter()
      .filter_map(|wf| {
        let version = wf.status.offload_node_status_version.clone()?;
        Some((wf.namespace().to_string(), wf.name().to_string(), version))
      })
      .collect();
    let mut deleted = 0;
    for key in old {
      if live.contains(&(key.namespace.clone(), key.name.clone(), key.version.clone())) {
        continue;
      }
      match offload.delete(&key.name, &key.namespace, &key.version).await {
        Ok(()) => deleted += 1,
        Err(e) => warn!(name = %key.name, namespace = %key.namespace, error = %e, "offload_delete_failed"),
      }
    }
    if deleted > 0 {
      info!(deleted, "offloaded_nodes_collected");
    }
  }

  /// Report workflow and pod counts per phase and the queue depth.
  fn refresh_gauges(&self) {
    let Some(metrics) = self.metrics() else {
      return;
    };
    let workflows = self.cluster.workflows.list();
    metrics.workflows_by_phase(
      &WorkflowPhase::ALL.map(WorkflowPhase::as_str),
      workflows.iter().map(|wf| (wf.status.phase.as_str(), 1)),
    );
    let pods = self.cluster.pods.list();
    metrics.pods_by_phase(
      &PodPhase::ALL.map(PodPhase::as_str),
      pods.iter().map(|pod| (pod.status.phase.as_str(), 1)),
    );
    metrics.queue_depth(WORKFLOW_QUEUE, self.queue.len());
  }

  fn owns(&self, wf: &Workflow) -> bool {
    let config = self.operator.config().current();
    wf.metadata.labels.get(LABEL_INSTANCE_ID).map(String::as_str) == config.instance_id.as_deref()
  }

  /// Message to hold a not-yet-started workflow back with, if the
  /// controller-wide parallelism is used up.
  fn postponed(&self, wf: &Workflow) -> Option<&'static str> {
    let limit = self.operator.config().current().parallelism.filter(|p| *p > 0)?;
    let key = wf.key();
    let running = self
      .cluster
      .workflows
      .list()
      .iter()
      .filter(|other| other.status.phase == WorkflowPhase::Running && other.key() != key)
      .count();
    (running >= limit as usize).then_some(POSTPONED)
  }

  /// Run the operator once for `key` and store the result. Returns when to
  /// look at the workflow again.
  pub async fn reconcile(&self, key: &str) -> Result<Option<Duration>, ControllerError> {
    let Some(mut wf) = self.cluster.workflows.get(key) else {
      debug!(workflow = %key, "workflow_not_found");
      return Ok(None);
    };
    if !self.owns(&wf) {
      debug!(workflow = %key, "workflow_not_owned");
      return Ok(None);
    }
    if self.ttl(&wf) == Ttl::Expired {
      self.delete_expired(&wf);
      return Ok(None);
    }

    let starting = wf.status.phase == WorkflowPhase::Pending && wf.status.started_at.is_none();
    let _admission = if starting { Some(self.admission.lock().await) } else { None };
    if starting && let Some(message) = self.postponed(&wf) {
      if wf.status.message != message {
        wf.status.message = message.to_string();
        self.cluster.workflows.update(wf)?;
        info!(workflow = %key, "workflow_postponed");
      }
      return Ok(None);
    }

    let before = wf.status.phase;
    let reconciled = self.operator.operate(wf).await?;
    if !reconciled.updated {
      return Ok(self.requeue_for_ttl(&reconciled.workflow, reconciled.requeue_after));
    }

    let wf = self.cluster.workflows.update(reconciled.workflow)?;
    for event in reconciled.node_events {
      self.notifier.notify(ControllerEvent::NodePhaseChanged {
        key: key.to_string(),
        node: event.node_name,
        phase: event.phase,
        message: event.message,
      });
    }
    let phase = wf.status.phase;
    if phase != before {
      self.refresh_gauges();
    }
    self.notifier.notify(ControllerEvent::WorkflowUpdated {
      key: key.to_string(),
      phase,
    });
    if phase.fulfilled() && !before.fulfilled() {
      info!(workflow = %key, phase = %phase, "workflow_finished");
      self.notifier.notify(ControllerEvent::WorkflowCompleted {
        key: key.to_string(),
        phase,
        message: wf.status.message.clone(),
      });
      self.enqueue_where(|other| other.status.phase == WorkflowPhase::Pending);
    }
    Ok(self.requeue_for_ttl(&wf, reconciled.requeue_after))
  }

  async fn process(&self, key: &str) {
    let started = Instant::now();
    let result = self.reconcile(key).await;
    if let Some(metrics) = self.metrics() {
      metrics.operation(started.elapsed());
      if result.is_err() {
        metrics.error(RECONCILE_FAILED);
      }
    }
    match result {
      Ok(requeue_after) => {
        self.queue.forget(key);
        if let Some(delay) = requeue_after {
          self.queue.add_after(key, delay);
        }
      }
      Err(e) if e.is_transient() => {
        let delay = self.queue.add_rate_limited(key);
        warn!(
          workflow = %key,
          error = %e,
          retries = self.queue.retries(key),
          retry_in_ms = delay.as_millis() as u64,
          "workflow_reconcile_retrying"
        );
        self.notifier.notify(ControllerEvent::ReconcileFailed {
          key: key.to_string(),
          error: e.to_string(),
          retry_in_ms: Some(delay.as_millis() as u64),
        });
      }
      Err(e) => {
        error!(workflow = %key, error = %e, "workflow_reconcile_failed");
        self.queue.forget(key);
        self.notifier.notify(ControllerEvent::ReconcileFailed {
          key: key.to_string(),
          error: e.to_string(),
          retry_in_ms: None,
        });
      }
    }
  }

  async fn worker(self: Arc<Self>, id: usize) {
    debug!(worker = id, "workflow_worker_started");
    while let Some(key) = self.queue.get().await {
      self.process(&key).await;
      self.queue.done(&key);
    }
    debug!(worker = id, "workflow_worker_stopped");
  }

  async fn housekeeping(self: Arc<Self>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(self.housekeeping_interval);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = interval.tick() => {
          let expired = self.collect_expired();
          if expired > 0 {
            info!(expired, "expired_workflows_collected");
          }
          let workflows = &self.cluster.workflows;
          self.operator.sync().check_workflow_existence(|key| workflows.exists(key));
          self.collect_archive().await;
          self.collect_offloads().await;
          self.refresh_gauges();
        }
      }
    }
  }

  /// Heartbeat into the shared lock store and poll it for freed slots.
  async fn lock_store_upkeep(self: Arc<Self>, cancel: CancellationToken) {
    let sync = self.operator.sync();
    let Some(store) = sync.store() else {
      return;
    };
    let mut poll = tokio::time::interval(store.poll_interval());
    let mut heartbeat = tokio::time::interval(store.heartbeat_interval());
    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = heartbeat.tick() => {
          if let Err(e) = sync.heartbeat().await {
            warn!(error = %e, "controller_heartbeat_failed");
          }
        }
        _ = poll.tick() => {
          let workflows = &self.cluster.workflows;
          if let Err(e) = sync.poll(|key| workflows.exists(key)).await {
            warn!(error = %e, "lock_store_poll_failed");
          }
        }
      }
    }
  }

  async fn collect_archive(&self) {
    let persistence = self.operator.persistence();
    if !persistence.archive.is_enabled() || persistence.archive_ttl.is_zero() {
      return;
    }
    match persistence.archive.delete_expired_workflows(persistence.archive_ttl).await {
      Ok(0) => {}
      Ok(deleted) => info!(deleted, "archived_workflows_expired"),
      Err(e) => warn!(error = %e, "archive_gc_failed"),
    }
  }

  /// Rebuild lock state from stored workflows, then start the workers.
  ///
  /// Returns once `cancel` fires and every worker has drained.
  pub async fn run(self: Arc<Self>, cancel: CancellationToken, releases: Option<mpsc::UnboundedReceiver<String>>) {
    let mut workflows = self.cluster.workflows.list();
    self.operator.sync().initialize(&mut workflows).await;
    for wf in workflows {
      if self.cluster.workflows.get(&wf.key()).as_ref() == Some(&wf) {
        continue;
      }
      if let Err(e) = self.cluster.workflows.update(wf) {
        warn!(error = %e, "workflow_lock_state_not_saved");
      }
    }
    let queued = self.enqueue_where(|wf| !wf.status.phase.fulfilled());

    let queue = self.queue.clone();
    self.cluster.pods.on_change(Arc::new(move |key| queue.add(key)));

    let workers = self.operator.config().current().workflow_workers();
    info!(workers, queued, "controller_started");

    let mut handles: Vec<JoinHandle<()>> = (0..workers)
      .map(|id| tokio::spawn(self.clone().worker(id)))
      .collect();
    if let Some(mut releases) = releases {
      let queue = self.queue.clone();
      let cancel = cancel.clone();
      handles.push(tokio::spawn(async move {
        loop {
          tokio::select! {
            _ = cancel.cancelled() => break,
            key = releases.recv() => match key {
              Some(key) => {
                debug!(workflow = %key, "lock_release_received");
                queue.add(key);
              }
              None => break,
            },
          }
        }
      }));
    }
    handles.push(tokio::spawn(self.clone().housekeeping(cancel.clone())));
    if self.operator.sync().store().is_some() {
      handles.push(tokio::spawn(self.clone().lock_store_upkeep(cancel.clone())));
    }

    cancel.cancelled().await;
    self.queue.shut_down();
    join_all(handles).await;
    info!("controller_stopped");
  }
}
