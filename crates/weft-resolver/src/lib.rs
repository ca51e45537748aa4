//! Template resolution.
//!
//! A step or task names its template either locally (`template: build`) or
//! through a reference into a workflow template (`templateRef`). Referenced
//! templates are copied into `status.storedTemplates` the first time they
//! resolve so a running workflow keeps using the same definition even if
//! the workflow template changes underneath it.

mod error;
mod resolver;
mod store;

pub use error::ResolveError;
pub use resolver::{Resolved, Resolver, TemplateResolver, TemplateScope, stored_template_id};
pub use store::{EmptyTemplateStore, InMemoryTemplateStore, TemplateStore};
