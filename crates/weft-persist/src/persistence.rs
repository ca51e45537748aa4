use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use weft_config::PersistConfig;
use weft_workflow::Workflow;

use crate::archive::{NullWorkflowArchive, SqlWorkflowArchive, WorkflowArchive};
use crate::error::PersistError;
use crate::labels::Selector;
use crate::migrate::{Migrate, Tables};
use crate::offload::{DisabledOffloadRepo, OffloadNodeStatusRepo, SqlOffloadRepo};
use crate::session::Session;

/// Repositories built from the persistence section of the controller config.
#[derive(Clone)]
pub struct Persistence {
  pub session: Option<Session>,
  pub offload: Arc<dyn OffloadNodeStatusRepo>,
  pub archive: Arc<dyn WorkflowArchive>,
  pub archive_selector: Selector,
  pub archive_ttl: Duration,
  pub offload_threshold: usize,
}

impl Persistence {
  /// No database: offload fails loudly, archiving is a no-op.
  pub fn disabled() -> Self {
    Self {
      session: None,
      offload: Arc::new(DisabledOffloadRepo),
      archive: Arc::new(NullWorkflowArchive),
      archive_selector: Selector::default(),
      archive_ttl: Duration::ZERO,
      offload_threshold: usize::MAX,
    }
  }

  /// Connect, migrate unless told not to, and build the enabled repositories.
  pub async fn from_config(config: Option<&PersistConfig>, instance_id: &str) -> Result<Self, PersistError> {
    let Some(config) = config else {
      return Ok(Self::disabled());
    };
    let archive_selector: Selector = config.archive_label_selector.as_deref().unwrap_or("").parse()?;
    let Some(database) = config.database() else {
      if config.node_status_offload || config.archive {
        warn!("persistence_enabled_without_database");
      }
      return Ok(Self {
        archive_selector,
        ..Self::disabled()
      });
    };

    let session = Session::connect(&database.url(), config.connection_pool.as_ref()).await?;
    let tables = Tables::new(database.table_name());
    if config.skip_migration {
      info!("schema_migration_skipped");
    } else {
      Migrate::new(&session, &tables, config.cluster_name()).exec().await?;
    }

    let offload: Arc<dyn OffloadNodeStatusRepo> = if config.node_status_offload {
      Arc::new(SqlOffloadRepo::new(session.clone(), tables.offload.clone()))
    } else {
      Arc::new(DisabledOffloadRepo)
    };
    let archive: Arc<dyn WorkflowArchive> = if config.archive {
      Arc::new(SqlWorkflowArchive::new(
        session.clone(),
        tables,
        config.cluster_name(),
        instance_id,
      ))
    } else {
      Arc::new(NullWorkflowArchive)
    };
    info!(
      dialect = session.dialect().as_str(),
      offload = offload.is_enabled(),
      archive = archive.is_enabled(),
      "persistence_ready"
    );
    Ok(Self {
      session: Some(session),
      offload,
      archive,
      archive_selector,
      archive_ttl: config.archive_ttl.duration(),
      offload_threshold: config.offload_threshold(),
    })
  }

  /// Whether a completed workflow should be written to the archive.
  pub fn should_archive(&self, wf: &Workflow) -> bool {
    self.archive.is_enabled() && self.archive_selector.matches(&wf.metadata.labels)
  }
}
