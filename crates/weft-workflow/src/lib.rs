//! Weft Workflow
//!
//! The data model shared by every weft crate: workflows and their templates,
//! the node-status tree the operator builds, artifact locations and
//! repositories, synchronization references and the pod view.
//!
//! ```text
//! Workflow
//!   ├── spec.templates ──► Template { Container | Script | Resource | Steps | Dag | Suspend }
//!   └── status.nodes   ──► NodeStatus (id = name-fnv32a(path), root id = name)
//!                              └── children / outbound_nodes (ids, never pointers)
//! ```
//!
//! Everything here is plain data plus the invariants that can be checked
//! without I/O: node ids, progress arithmetic, artifact keys, loop expansion,
//! DAG cycle detection and static validation.

mod artifact;
mod duration;
mod error;
mod graph;
mod items;
mod metrics;
mod node;
mod pod;
mod progress;
mod sync;
mod template;
mod validate;
mod workflow;

pub use artifact::{
  ArtifactCredential, ArtifactLocation, ArtifactRepository, ArtifactRepositoryRef, ArtifactoryArtifact,
  ArtifactoryArtifactRepository, DEFAULT_ARCHIVE_PATTERN, DEFAULT_REPOSITORIES_CONFIG_MAP,
  GcsArtifact, GcsArtifactRepository, GitArtifact, HdfsArtifact, HdfsArtifactRepository, Header,
  HttpArtifact, OssArtifact, OssArtifactRepository, RawArtifact, RepositoryBackend, S3Artifact,
  S3ArtifactRepository, SecretKeySelector, path_join,
};
pub use duration::{format_duration, parse_duration};
pub use error::WorkflowError;
pub use graph::DagGraph;
pub use items::{Item, Sequence, items_from_param};
pub use metrics::{
  CounterSpec, GaugeSpec, HistogramSpec, MetricLabel, MetricSpec, MetricValue, Metrics, is_valid_metric_name,
};
pub use node::{
  NodePhase, NodeStatus, NodeSynchronizationStatus, NodeType, Nodes, find_by_name, fnv32a,
};
pub use pod::{Pod, PodPhase, PodSpec, PodStatus, TerminationMessage};
pub use progress::Progress;
pub use sync::{
  ConfigMapKeySelector, MutexRef, SemaphoreRef, SyncDatabaseRef, Synchronization, SynchronizationStatus,
};
pub use template::{
  ArchiveStrategy, Arguments, Artifact, Backoff, ContainerTemplate, ContinueOn, DagTask,
  DagTemplate, EnvVar, Inputs, Outputs, Parameter, ResourceTemplate, RetryPolicy, RetryStrategy,
  ScriptTemplate, SuspendTemplate, Template, TemplateHolder, TemplateKind, TemplateMetadata,
  TemplateRef, ValueFrom, WorkflowStep,
};
pub use validate::{validate_workflow, workflow_from_value};
pub use workflow::{
  LABEL_COMPLETED, LABEL_PHASE, LABEL_WORKFLOW, ObjectMeta, ShutdownStrategy, TtlStrategy, Workflow,
  WorkflowPhase, WorkflowSpec, WorkflowStatus, WorkflowTemplate, node_id,
};
