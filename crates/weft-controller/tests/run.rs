use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use weft_config::{Config, SharedConfig};
use weft_controller::{
  ChannelNotifier, Controller, ControllerEvent, InMemoryCluster, LABEL_INSTANCE_ID, PodOutcome, PodRunner, PodScript,
};
use weft_metrics::{ControllerMetrics, ERROR_COUNT, MetricsRegistry, WORKFLOWS_COUNT, WORKFLOWS_PROCESSED, labels};
use weft_operator::Operator;
use weft_persist::{Migrate, OffloadNodeStatusRepo, Persistence, Session, SqlOffloadRepo, Tables};
use weft_resolver::{EmptyTemplateStore, TemplateResolver};
use weft_sync::{ChannelReleaseNotifier, InMemorySemaphoreStore, SemaphoreStore, SyncManager};
use weft_workflow::{
  NodePhase, Nodes, Outputs, Parameter, TemplateKind, Workflow, WorkflowPhase, workflow_from_value,
};

struct Running {
  controller: Arc<Controller>,
  cluster: InMemoryCluster,
  sync: Arc<SyncManager>,
  events: mpsc::UnboundedReceiver<ControllerEvent>,
  cancel: CancellationToken,
}

fn start(config: Config, script: PodScript) -> Running {
  start_with(config, script, None, |operator| operator)
}

fn start_with(
  config: Config,
  script: PodScript,
  store: Option<InMemorySemaphoreStore>,
  extend: impl FnOnce(Operator) -> Operator,
) -> Running {
  let cluster = InMemoryCluster::new();
  let (release_tx, release_rx) = mpsc::unbounded_channel();
  let mut sync = SyncManager::new(
    cluster.config_maps.clone(),
    Arc::new(ChannelReleaseNotifier::new(release_tx)),
  );
  if let Some(store) = store {
    sync = sync.with_store(Arc::new(store));
  }
  let sync = Arc::new(sync);
  let operator = Operator::new(
    Arc::new(TemplateResolver::new(Arc::new(EmptyTemplateStore))),
    cluster.pods.clone(),
    sync.clone(),
    cluster.config_maps.clone(),
    SharedConfig::new(config),
  );
  let operator = extend(operator);
  let (tx, events) = mpsc::unbounded_channel();
  let controller = Arc::new(
    Controller::new(Arc::new(operator), cluster.clone())
      .with_notifier(Arc::new(ChannelNotifier::new(tx)))
      .with_housekeeping_interval(Duration::from_millis(20)),
  );

  let cancel = CancellationToken::new();
  let runner = PodRunner::new(cluster.pods.clone(), script);
  let runner_cancel = cancel.clone();
  tokio::spawn(async move { runner.run(runner_cancel, Duration::from_millis(5)).await });
  tokio::spawn(controller.clone().run(cancel.clone(), Some(release_rx)));

  Running {
    controller,
    cluster,
    sync,
    events,
    cancel,
  }
}

impl Running {
  /// Collect events until `count` workflows have completed.
  async fn wait_completed(&mut self, count: usize) -> Vec<ControllerEvent> {
    let mut seen = Vec::new();
    let mut completed = BTreeSet::new();
    let wait = async {
      while completed.len() < count {
        let event = self.events.recv().await.expect("event channel closed");
        if let ControllerEvent::WorkflowCompleted { key, .. } = &event {
          completed.insert(key.clone());
        }
        seen.push(event);
      }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
      .await
      .expect("workflows did not complete in time");
    seen
  }

  fn workflow(&self, key: &str) -> Workflow {
    self.cluster.workflows.get(key).expect("workflow stored")
  }
}

impl Drop for Running {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}

async fn eventually<F: Fn() -> bool>(check: F) {
  tokio::time::timeout(Duration::from_secs(5), async {
    while !check() {
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .expect("condition not reached in time");
}

fn with_semaphore(mut wf: Workflow) -> Workflow {
  wf.spec.synchronization = Some(
    serde_json::from_value(json!({ "semaphore": { "configMapKeyRef": { "name": "limits", "key": "workflow" } } }))
      .unwrap(),
  );
  wf
}

fn workflow(name: &str, spec: serde_json::Value) -> Workflow {
  let mut value = json!({ "metadata": { "name": name, "namespace": "argo" }, "spec": spec });
  value["spec"]["entrypoint"] = json!("main");
  workflow_from_value(value).unwrap()
}

fn single_pod(name: &str) -> Workflow {
  workflow(
    name,
    json!({ "templates": [{ "name": "main", "container": { "image": "alpine" } }] }),
  )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_steps_pass_outputs_between_pods() {
  let answer = PodOutcome {
    outputs: Some(Outputs {
      parameters: vec![Parameter::with_value("answer", "42")],
      ..Default::default()
    }),
    ..Default::default()
  };
  let mut run = start(Config::default(), PodScript::default().with_template("produce", vec![answer]));
  run
    .controller
    .submit(workflow(
      "wf",
      json!({ "templates": [
        { "name": "main", "steps": [
          [{ "name": "a", "template": "produce" }],
          [{ "name": "b", "template": "consume", "arguments": { "parameters": [
            { "name": "value", "value": "{{steps.a.outputs.parameters.answer}}" },
          ] } }],
        ] },
        { "name": "produce", "container": { "image": "alpine" } },
        {
          "name": "consume",
          "inputs": { "parameters": [{ "name": "value" }] },
          "container": { "image": "alpine", "args": ["{{inputs.parameters.value}}"] },
        },
      ] }),
    ))
    .unwrap();

  let events = run.wait_completed(1).await;
  assert_eq!(events[0], ControllerEvent::WorkflowSubmitted { key: "argo/wf".into() });

  let wf = run.workflow("argo/wf");
  assert_eq!(wf.status.phase, WorkflowPhase::Succeeded);
  let consumer = run
    .cluster
    .pods
    .list()
    .into_iter()
    .find(|p| p.spec.template.name == "consume")
    .unwrap();
  match &consumer.spec.template.kind {
    TemplateKind::Container(c) => assert_eq!(c.args, vec!["42".to_string()]),
    other => panic!("unexpected template kind {other:?}"),
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_pod_is_retried_to_success() {
  let script = PodScript::default().with_template("flaky", vec![PodOutcome::failed("boom"), PodOutcome::default()]);
  let mut run = start(Config::default(), script);
  run
    .controller
    .submit(workflow(
      "wf",
      json!({ "templates": [
        { "name": "main", "steps": [[{ "name": "flaky", "template": "flaky" }]] },
        { "name": "flaky", "retryStrategy": { "limit": 2 }, "container": { "image": "alpine" } },
      ] }),
    ))
    .unwrap();

  run.wait_completed(1).await;
  assert_eq!(run.workflow("argo/wf").status.phase, WorkflowPhase::Succeeded);
  assert_eq!(run.cluster.pods.list().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_pod_fails_the_workflow() {
  let script = PodScript {
    default: PodOutcome::failed("exit 1"),
    ..Default::default()
  };
  let mut run = start(Config::default(), script);
  run.controller.submit(single_pod("wf")).unwrap();

  let events = run.wait_completed(1).await;
  let completed = events
    .iter()
    .find_map(|e| match e {
      ControllerEvent::WorkflowCompleted { phase, .. } => Some(*phase),
      _ => None,
    })
    .unwrap();
  assert_eq!(completed, WorkflowPhase::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_semaphore_admits_one_workflow_at_a_time() {
  let mut run = start(
    Config::default(),
    PodScript {
      default: PodOutcome {
        run_millis: 50,
        ..Default::default()
      },
      ..Default::default()
    },
  );
  run.cluster.config_maps.set("argo", "limits", "workflow", "1");
  for name in ["first", "second"] {
    run.controller.submit(with_semaphore(single_pod(name))).unwrap();
  }

  run.wait_completed(2).await;
  let first = run.workflow("argo/first");
  let second = run.workflow("argo/second");
  assert_eq!(first.status.phase, WorkflowPhase::Succeeded);
  assert_eq!(second.status.phase, WorkflowPhase::Succeeded);
  let (earlier, later) = if first.status.started_at <= second.status.started_at {
    (first, second)
  } else {
    (second, first)
  };
  assert!(later.status.started_at >= earlier.status.finished_at);
  assert!(run.controller.cluster().workflows.list().iter().all(|wf| wf.status.synchronization.is_none()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_controller_parallelism_postpones_workflows() {
  let config = Config {
    parallelism: Some(1),
    ..Default::default()
  };
  let mut run = start(
    config,
    PodScript {
      default: PodOutcome {
        run_millis: 50,
        ..Default::default()
      },
      ..Default::default()
    },
  );
  run.controller.submit(single_pod("one")).unwrap();
  run.controller.submit(single_pod("two")).unwrap();

  run.wait_completed(2).await;
  let one = run.workflow("argo/one");
  let two = run.workflow("argo/two");
  assert_eq!(one.status.phase, WorkflowPhase::Succeeded);
  assert_eq!(two.status.phase, WorkflowPhase::Succeeded);
  let (earlier, later) = if one.status.started_at <= two.status.started_at {
    (one, two)
  } else {
    (two, one)
  };
  assert!(later.status.started_at >= earlier.status.finished_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_submit_is_rejected() {
  let run = start(Config::default(), PodScript::default());
  run.controller.submit(single_pod("wf")).unwrap();
  assert!(run.controller.submit(single_pod("wf")).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deleted_workflow_gives_up_its_lock() {
  let run = start(
    Config::default(),
    PodScript {
      default: PodOutcome {
        run_millis: 60_000,
        ..Default::default()
      },
      ..Default::default()
    },
  );
  run.cluster.config_maps.set("argo", "limits", "workflow", "1");
  run.controller.submit(with_semaphore(single_pod("holder"))).unwrap();

  let lock = "argo/ConfigMap/limits/workflow";
  eventually(|| !run.sync.holders(lock).is_empty()).await;
  run.cluster.workflows.delete("argo/holder");
  eventually(|| run.sync.holders(lock).is_empty()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_node_phase_changes_are_forwarded() {
  let mut run = start(Config::default(), PodScript::default());
  run.controller.submit(single_pod("wf")).unwrap();

  let events = run.wait_completed(1).await;
  assert!(events.iter().any(|e| matches!(
    e,
    ControllerEvent::NodePhaseChanged { key, node, phase: NodePhase::Succeeded, .. } if key == "argo/wf" && node == "wf"
  )));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_database_semaphore_admits_one_workflow_at_a_time() {
  let store = InMemorySemaphoreStore::new("weft-controller");
  store.set_limit("argo/gpu", 1);
  let mut run = start_with(
    Config::default(),
    PodScript {
      default: PodOutcome {
        run_millis: 50,
        ..Default::default()
      },
      ..Default::default()
    },
    Some(store.clone()),
    |operator| operator,
  );
  for name in ["first", "second"] {
    let mut wf = single_pod(name);
    wf.spec.synchronization = Some(serde_json::from_value(json!({ "semaphore": { "database": { "key": "gpu" } } })).unwrap());
    run.controller.submit(wf).unwrap();
  }

  run.wait_completed(2).await;
  let first = run.workflow("argo/first");
  let second = run.workflow("argo/second");
  assert_eq!(first.status.phase, WorkflowPhase::Succeeded);
  assert_eq!(second.status.phase, WorkflowPhase::Succeeded);
  let (earlier, later) = if first.status.started_at <= second.status.started_at {
    (first, second)
  } else {
    (second, first)
  };
  assert!(later.status.started_at >= earlier.status.finished_at);
  let state = store.state("sem/argo/gpu").await.unwrap();
  assert!(state.holders.is_empty() && state.queue.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_finished_workflows_are_deleted_after_their_ttl() {
  let script = PodScript::default().with_template("doomed", vec![PodOutcome::failed("exit 1")]);
  let mut run = start(Config::default(), script);
  let ttl = json!({ "secondsAfterSuccess": 3600, "secondsAfterFailure": 0 });
  run
    .controller
    .submit(workflow(
      "kept",
      json!({ "ttlStrategy": ttl, "templates": [{ "name": "main", "container": { "image": "alpine" } }] }),
    ))
    .unwrap();
  run
    .controller
    .submit(workflow(
      "doomed",
      json!({
        "ttlStrategy": ttl,
        "templates": [
          { "name": "main", "steps": [[{ "name": "run", "template": "doomed" }]] },
          { "name": "doomed", "container": { "image": "alpine" } },
        ],
      }),
    ))
    .unwrap();

  run.wait_completed(2).await;
  let workflows = &run.cluster.workflows;
  eventually(|| !workflows.exists("argo/doomed")).await;
  assert!(run.cluster.pods.list().iter().all(|pod| !pod.spec.name.starts_with("doomed")));
  assert_eq!(run.workflow("argo/kept").status.phase, WorkflowPhase::Succeeded);
  assert!(!run.cluster.pods.list().is_empty());

  let deleted = tokio::time::timeout(Duration::from_secs(5), async {
    loop {
      match run.events.recv().await {
        Some(ControllerEvent::WorkflowDeleted { key }) => return key,
        Some(_) => continue,
        None => panic!("event channel closed"),
      }
    }
  })
  .await
  .unwrap();
  assert_eq!(deleted, "argo/doomed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_builtin_and_custom_metrics_are_recorded() {
  let registry = Arc::new(MetricsRegistry::new());
  let metrics = ControllerMetrics::new(registry.clone());
  let mut run = start_with(Config::default(), PodScript::default(), None, |operator| {
    operator.with_metrics(metrics)
  });
  run
    .controller
    .submit(workflow(
      "wf",
      json!({
        "metrics": { "prometheus": [{
          "name": "weft_test_workflows_total",
          "help": "Finished workflows by status",
          "labels": [{ "key": "status", "value": "{{status}}" }],
          "counter": { "value": "1" },
        }]},
        "templates": [{ "name": "main", "container": { "image": "alpine" } }],
      }),
    ))
    .unwrap();

  run.wait_completed(1).await;
  assert_eq!(
    registry.value("weft_test_workflows_total", &labels([("status", "Succeeded")])),
    Some(1.0)
  );
  assert!(registry.value(WORKFLOWS_PROCESSED, &Default::default()).unwrap() >= 2.0);
  assert_eq!(registry.value(ERROR_COUNT, &labels([("cause", "CustomMetric")])), None);
  eventually(|| registry.value(WORKFLOWS_COUNT, &labels([("phase", "Succeeded")])) == Some(1.0)).await;
  assert!(registry.render().contains("weft_test_workflows_total{status=\"Succeeded\"} 1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_offloads_of_missing_workflows_are_collected() {
  let session = Session::connect("sqlite::memory:", None).await.unwrap();
  let tables = Tables::default();
  Migrate::new(&session, &tables, "default").exec().await.unwrap();
  let repo = Arc::new(SqlOffloadRepo::new(session, tables.offload).with_ttl(Duration::ZERO));
  let live = repo.save("live", "argo", &Nodes::new()).await.unwrap();
  repo.save("gone", "argo", &Nodes::new()).await.unwrap();

  let persistence = Persistence {
    offload: repo.clone(),
    ..Persistence::disabled()
  };
  let run = start_with(Config::default(), PodScript::default(), None, |operator| {
    operator.with_persistence(persistence)
  });
  // Owned by another controller, so only housekeeping looks at it.
  let mut wf = single_pod("live");
  wf.metadata.labels.insert(LABEL_INSTANCE_ID.into(), "elsewhere".into());
  wf.status.offload_node_status_version = Some(live.clone());
  run.cluster.workflows.create(wf).unwrap();

  let remaining = || async {
    repo
      .list("argo")
      .await
      .unwrap()
      .into_keys()
      .map(|key| (key.name, key.version))
      .collect::<Vec<_>>()
  };
  tokio::time::timeout(Duration::from_secs(5), async {
    while remaining().await.len() > 1 {
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
  })
  .await
  .expect("stale offload not collected");
  assert_eq!(remaining().await, vec![("live".to_string(), live)]);
}
