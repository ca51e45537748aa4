//! Workflow reconciliation for weft.
//!
//! This crate provides the [`Operator`] which, given a workflow and the pods
//! the scheduler reports for it, advances the node tree by one step:
//! - resolving templates and binding their inputs
//! - steps groups, DAG tasks, loops, retries and suspends
//! - pod creation and assessment through [`PodControl`]
//! - workflow and template level locks, parallelism and deadlines
//! - exit handlers, global outputs, progress, archiving and node offload
//! - custom metrics declared by workflows and templates
//!
//! The operator never writes the workflow back itself; it returns a
//! [`Reconciled`] and leaves persistence to the caller.

mod clock;
mod cluster;
mod context;
mod custom_metrics;
mod dag;
mod defaults;
mod error;
mod expand;
mod operator;
mod pod;
mod progress;
mod resume;
mod retry;
mod scope;
mod steps;
mod substitute;
mod template;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::PodControl;
pub use error::OperatorError;
pub use operator::{NodeEvent, Operator, Reconciled};
pub use pod::{ANNOTATION_EXECUTOR, ANNOTATION_NODE_NAME};
pub use progress::update_progress;
pub use resume::{NodeFieldSelector, resume_workflow};
pub use substitute::{Params, substitute_str};
