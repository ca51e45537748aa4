//! Hook contracts for extending the operator.
//!
//! Hooks run at fixed points of a reconcile:
//!
//! | Hook | When | Effect |
//! |---|---|---|
//! | `workflow_pre_operate` | before a reconcile | may mutate the workflow |
//! | `workflow_pre_update` | before the workflow is written | may mutate the workflow |
//! | `execute_template` | instead of creating a pod | a result replaces the pod |
//! | `node_pre_execute` | before a leaf node runs | a fulfilled result skips it |
//! | `node_post_execute` | after a leaf node finishes | notification |
//! | `pod_pre_create` / `pod_post_create` | around pod creation | may rewrite the spec |

mod error;
mod hooks;
mod set;

pub use error::PluginError;
pub use hooks::{
  Named, NodeLifecycleHook, NodeResult, PodLifecycleHook, TemplateExecutor, WorkflowLifecycleHook,
};
pub use set::{HookOutcome, PluginSet};
