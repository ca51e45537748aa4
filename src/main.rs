use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weft_config::{Config, ConfigWatcher, SharedConfig};
use weft_controller::{
  ChannelNotifier, Controller, ControllerEvent, InMemoryCluster, LABEL_INSTANCE_ID, PodRunner, PodScript,
};
use weft_metrics::{ControllerMetrics, MetricsRegistry, MetricsServer};
use weft_operator::Operator;
use weft_persist::{ListOptions, Migrate, Persistence, Selector, Session, SqlSemaphoreStore, SyncMigrate, SyncTables, Tables};
use weft_resolver::{InMemoryTemplateStore, TemplateResolver};
use weft_sync::{ChannelReleaseNotifier, SyncManager};
use weft_workflow::{Workflow, WorkflowTemplate, workflow_from_value};

/// Weft - a workflow orchestrator for step and DAG workflows
#[derive(Parser)]
#[command(name = "weft")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Controller configuration (default: ~/.weft/config.yaml)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
  log_format: LogFormat,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
  Text,
  Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
  Json,
  Yaml,
}

#[derive(Subcommand)]
enum Commands {
  /// Bring the database schema up to date
  Migrate,

  /// Run a workflow to completion against an in-process cluster
  Run {
    /// Path to the workflow file (JSON or YAML)
    workflow_file: PathBuf,

    /// Workflow templates the workflow may reference
    #[arg(long = "workflow-template")]
    workflow_templates: Vec<PathBuf>,

    /// Cluster workflow templates the workflow may reference
    #[arg(long = "cluster-workflow-template")]
    cluster_workflow_templates: Vec<PathBuf>,

    /// How each template's pods end (default: all succeed)
    #[arg(long)]
    script: Option<PathBuf>,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 600)]
    timeout: u64,

    #[arg(long, short, value_enum, default_value_t = OutputFormat::Yaml)]
    output: OutputFormat,
  },

  /// Query archived workflows
  Archive {
    #[command(subcommand)]
    command: ArchiveCommand,
  },

  /// Manage limits of database-backed semaphores
  Sync {
    #[command(subcommand)]
    command: SyncCommand,
  },
}

#[derive(Subcommand)]
enum SyncCommand {
  /// Create or change the limit of a semaphore
  SetLimit {
    /// Semaphore as `namespace/key`
    name: String,
    limit: usize,
  },

  /// Remove the limit of a semaphore
  DeleteLimit {
    /// Semaphore as `namespace/key`
    name: String,
  },
}

#[derive(Subcommand)]
enum ArchiveCommand {
  /// List archived workflows, newest first
  List {
    #[arg(long, short)]
    namespace: Option<String>,

    /// Label selector, e.g. `team=data,tier!=batch`
    #[arg(long, short = 'l')]
    selector: Option<String>,

    #[arg(long, default_value_t = 100)]
    limit: u64,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  init_tracing(cli.log_format);

  let config_path = match cli.config {
    Some(path) => path,
    None => Config::default_path().context("could not determine the default config path")?,
  };

  let rt = tokio::runtime::Runtime::new()?;
  match cli.command {
    Some(Commands::Migrate) => rt.block_on(migrate(&config_path)),
    Some(Commands::Run {
      workflow_file,
      workflow_templates,
      cluster_workflow_templates,
      script,
      timeout,
      output,
    }) => rt.block_on(run(RunArgs {
      config_path,
      workflow_file,
      workflow_templates,
      cluster_workflow_templates,
      script,
      timeout: Duration::from_secs(timeout),
      output,
    })),
    Some(Commands::Archive {
      command: ArchiveCommand::List {
        namespace,
        selector,
        limit,
      },
    }) => rt.block_on(archive_list(&config_path, namespace, selector, limit)),
    Some(Commands::Sync { command }) => rt.block_on(sync_limits(&config_path, command)),
    None => {
      println!("weft - use --help to see available commands");
      Ok(())
    }
  }
}

fn init_tracing(format: LogFormat) {
  use tracing_subscriber::prelude::*;

  let filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  let registry = tracing_subscriber::registry().with(filter);
  match format {
    LogFormat::Text => registry
      .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
      .init(),
    LogFormat::Json => registry
      .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
      .init(),
  }
}

/// A missing file at the default location means defaults.
fn load_config(path: &Path) -> Result<Config> {
  if !path.exists() {
    warn!(path = %path.display(), "config_not_found_using_defaults");
    return Ok(Config::default());
  }
  Config::load(path).with_context(|| format!("failed to load config: {}", path.display()))
}

/// Parse a JSON or YAML file, choosing by extension.
fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
  let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
  let parsed = match path.extension().and_then(|e| e.to_str()) {
    Some("json") => serde_json::from_str(&raw).map_err(anyhow::Error::from),
    _ => serde_yaml::from_str(&raw).map_err(anyhow::Error::from),
  };
  parsed.with_context(|| format!("failed to parse {}", path.display()))
}

async fn migrate(config_path: &Path) -> Result<()> {
  let config = load_config(config_path)?;
  if let Some(sync) = config.synchronization.as_ref() {
    let Some(database) = sync.database() else {
      bail!("synchronization in {} names no database", config_path.display());
    };
    let session = Session::connect(&database.url(), sync.connection_pool.as_ref())
      .await
      .context("failed to connect to the synchronization database")?;
    let applied = SyncMigrate::new(&session, &SyncTables::from_config(sync))
      .exec()
      .await
      .context("synchronization schema migration failed")?;
    session.close().await;
    info!(applied, "sync_schema_migrated");
    println!("applied {applied} synchronization change(s)");
  }
  let Some(persistence) = config.persistence.as_ref() else {
    if config.synchronization.is_some() {
      return Ok(());
    }
    bail!("no persistence section in {}", config_path.display());
  };
  let Some(database) = persistence.database() else {
    bail!("persistence in {} names no database", config_path.display());
  };

  let session = Session::connect(&database.url(), persistence.connection_pool.as_ref())
    .await
    .context("failed to connect to the database")?;
  let tables = Tables::new(database.table_name());
  let migrate = Migrate::new(&session, &tables, persistence.cluster_name());
  let applied = migrate.exec().await.context("schema migration failed")?;
  let version = migrate.current_version().await?;
  session.close().await;

  info!(applied, version = ?version, "schema_migrated");
  println!("applied {applied} change(s); schema version {}", version.unwrap_or(0));
  Ok(())
}

async fn archive_list(config_path: &Path, namespace: Option<String>, selector: Option<String>, limit: u64) -> Result<()> {
  let config = load_config(config_path)?;
  if !config.archive_enabled() {
    bail!("workflow archive is not enabled in {}", config_path.display());
  }
  let label_requirements = match selector.as_deref() {
    Some(raw) => raw.parse::<Selector>().context("invalid label selector")?.requirements,
    None => Vec::new(),
  };
  let instance_id = config.instance_id.clone().unwrap_or_default();
  let persistence = Persistence::from_config(config.persistence.as_ref(), &instance_id)
    .await
    .context("failed to open persistence")?;

  let options = ListOptions {
    namespace,
    label_requirements,
    limit,
    ..Default::default()
  };
  let workflows = persistence.archive.list_workflows(&options).await?;

  println!("{:<20} {:<40} {:<10} {:<25} FINISHED", "NAMESPACE", "NAME", "PHASE", "STARTED");
  for wf in &workflows {
    let started = wf.status.started_at.map(|t| t.to_rfc3339()).unwrap_or_default();
    let finished = wf.status.finished_at.map(|t| t.to_rfc3339()).unwrap_or_default();
    println!(
      "{:<20} {:<40} {:<10} {:<25} {}",
      wf.namespace(),
      wf.name(),
      wf.status.phase.as_str(),
      started,
      finished
    );
  }
  if let Some(session) = persistence.session {
    session.close().await;
  }
  Ok(())
}

async fn sync_limits(config_path: &Path, command: SyncCommand) -> Result<()> {
  let config = load_config(config_path)?;
  let Some(sync) = config.synchronization.as_ref() else {
    bail!("no synchronization section in {}", config_path.display());
  };
  let Some(store) = SqlSemaphoreStore::from_config(sync)
    .await
    .context("failed to open the synchronization database")?
  else {
    bail!("synchronization in {} names no database", config_path.display());
  };
  match command {
    SyncCommand::SetLimit { name, limit } => {
      store.set_limit(&name, limit).await?;
      println!("{name}: limit {limit}");
    }
    SyncCommand::DeleteLimit { name } => {
      if !store.delete_limit(&name).await? {
        bail!("no limit for {name}");
      }
      println!("{name}: limit removed");
    }
  }
  Ok(())
}

struct RunArgs {
  config_path: PathBuf,
  workflow_file: PathBuf,
  workflow_templates: Vec<PathBuf>,
  cluster_workflow_templates: Vec<PathBuf>,
  script: Option<PathBuf>,
  timeout: Duration,
  output: OutputFormat,
}

async fn run(args: RunArgs) -> Result<()> {
  // Hot reload only when there is a file to watch.
  let (shared, watcher) = if args.config_path.exists() {
    let watcher = ConfigWatcher::new(&args.config_path)
      .with_context(|| format!("failed to load config: {}", args.config_path.display()))?;
    (watcher.shared(), Some(watcher))
  } else {
    (SharedConfig::new(load_config(&args.config_path)?), None)
  };
  let config = shared.current();

  let mut wf = workflow_from_value(read_document(&args.workflow_file)?)
    .with_context(|| format!("invalid workflow: {}", args.workflow_file.display()))?;
  if wf.metadata.namespace.is_empty() {
    wf.metadata.namespace = "default".to_string();
  }
  if wf.metadata.name.is_empty() {
    bail!("workflow in {} has no name", args.workflow_file.display());
  }
  wf.metadata.uid = uuid::Uuid::new_v4().to_string();
  if let Some(instance_id) = &config.instance_id {
    wf.metadata.labels.insert(LABEL_INSTANCE_ID.to_string(), instance_id.clone());
  }

  let templates = InMemoryTemplateStore::new();
  for path in &args.workflow_templates {
    let mut template: WorkflowTemplate = read_document(path)?;
    if template.metadata.namespace.is_empty() {
      template.metadata.namespace = wf.metadata.namespace.clone();
    }
    templates.put_workflow_template(template);
  }
  for path in &args.cluster_workflow_templates {
    templates.put_cluster_workflow_template(read_document(path)?);
  }
  let script: PodScript = match &args.script {
    Some(path) => read_document(path)?,
    None => PodScript::default(),
  };

  let persistence = Persistence::from_config(config.persistence.as_ref(), config.instance_id.as_deref().unwrap_or(""))
    .await
    .context("failed to open persistence")?;

  let cluster = InMemoryCluster::new();
  let (release_tx, release_rx) = mpsc::unbounded_channel();
  let mut sync = SyncManager::new(
    cluster.config_maps.clone(),
    Arc::new(ChannelReleaseNotifier::new(release_tx)),
  );
  if let Some(sync_config) = config.synchronization.as_ref()
    && let Some(store) = SqlSemaphoreStore::from_config(sync_config)
      .await
      .context("failed to open the synchronization database")?
  {
    sync = sync.with_store(Arc::new(store));
  }
  let sync = Arc::new(sync);
  let registry = Arc::new(MetricsRegistry::new());
  let operator = Operator::new(
    Arc::new(TemplateResolver::new(Arc::new(templates))),
    cluster.pods.clone(),
    sync,
    cluster.config_maps.clone(),
    shared,
  )
  .with_persistence(persistence)
  .with_metrics(ControllerMetrics::new(registry.clone()));

  let (event_tx, mut events) = mpsc::unbounded_channel();
  let controller =
    Arc::new(Controller::new(Arc::new(operator), cluster.clone()).with_notifier(Arc::new(ChannelNotifier::new(event_tx))));

  let _watch = match &watcher {
    Some(watcher) => {
      let controller = controller.clone();
      Some(watcher.watch(move |config| controller.on_config_change(config))?)
    }
    None => None,
  };

  let cancel = CancellationToken::new();
  let runner = PodRunner::new(cluster.pods.clone(), script);
  let runner_task = {
    let cancel = cancel.clone();
    tokio::spawn(async move { runner.run(cancel, Duration::from_millis(100)).await })
  };
  let controller_task = tokio::spawn(controller.clone().run(cancel.clone(), Some(release_rx)));
  if let Some(server) = MetricsServer::from_config(&config.metrics_config, registry) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
      if let Err(e) = server.run(cancel).await {
        warn!(error = %e, "metrics_server_failed");
      }
    });
  }

  let key = controller.submit(wf)?.key();
  // A TTL strategy may delete the workflow as soon as it finishes.
  let mut last_seen: Option<Workflow> = None;
  let waited = tokio::time::timeout(args.timeout, async {
    while let Some(event) = events.recv().await {
      if let Some(wf) = cluster.workflows.get(&key) {
        last_seen = Some(wf);
      }
      match event {
        ControllerEvent::WorkflowCompleted { key: done, .. } if done == key => return true,
        ControllerEvent::ReconcileFailed {
          key: failed,
          error,
          retry_in_ms: None,
        } if failed == key => {
          warn!(workflow = %key, error = %error, "workflow_reconcile_abandoned");
          return false;
        }
        _ => {}
      }
    }
    false
  })
  .await;

  cancel.cancel();
  let _ = tokio::join!(runner_task, controller_task);

  let finished: Workflow = cluster
    .workflows
    .get(&key)
    .or(last_seen)
    .with_context(|| format!("workflow {key} disappeared"))?;
  match args.output {
    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&finished)?),
    OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&finished)?),
  }
  for link in config.links_for("workflow", &finished) {
    eprintln!("{}: {}", link.name, link.url);
  }
  match waited {
    Ok(true) => Ok(()),
    Ok(false) => bail!("workflow {key} could not be reconciled"),
    Err(_) => bail!("workflow {key} did not finish within {}s", args.timeout.as_secs()),
  }
}
