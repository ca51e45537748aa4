//! Weft Artifact
//!
//! Resolves where artifacts live. A workflow's repository comes from its
//! `artifactRepositoryRef` (looked up in a config map) or the controller
//! default; each output artifact then takes its own location, the template's
//! archive location or the repository default, with its file name appended
//! to the key. Named credentials fill in whatever the chosen location leaves
//! unset.
//!
//! Keys keep their `{{workflow.name}}`/`{{pod.name}}` placeholders here; the
//! operator expands them against the node they belong to.

mod credentials;
mod error;
mod repository;
mod resolver;

pub use credentials::{CredentialRegistry, merge};
pub use error::ArtifactError;
pub use repository::resolve_repository;
pub use resolver::ArtifactResolver;
