use weft_workflow::{Artifact, ArtifactLocation, Outputs};

use crate::credentials::CredentialRegistry;
use crate::error::ArtifactError;

/// Chooses where each output artifact of a node is written.
#[derive(Debug, Clone, Default)]
pub struct ArtifactResolver {
  credentials: CredentialRegistry,
}

impl ArtifactResolver {
  pub fn new(credentials: CredentialRegistry) -> Self {
    Self { credentials }
  }

  pub fn credentials(&self) -> &CredentialRegistry {
    &self.credentials
  }

  /// Location for one output artifact.
  ///
  /// An artifact that already names a full location keeps it. Otherwise the
  /// template's archive location, then the workflow default, is adopted and
  /// the artifact's file name appended to its key. Returns `None` for an
  /// optional artifact with nowhere to go.
  pub fn resolve(
    &self,
    artifact: &Artifact,
    template_archive: Option<&ArtifactLocation>,
    default: Option<&ArtifactLocation>,
  ) -> Result<Option<ArtifactLocation>, ArtifactError> {
    let mut location = match &artifact.location {
      Some(own) if own.has_location() => own.clone(),
      _ => {
        let base = template_archive
          .filter(|l| l.has_location())
          .or(default.filter(|l| l.has_location()));
        let Some(base) = base else {
          if artifact.optional {
            return Ok(None);
          }
          return Err(ArtifactError::NoLocation {
            artifact: artifact.name.clone(),
          });
        };
        let mut location = base.clone();
        location.append_to_key(&artifact.file_name())?;
        location
      }
    };

    if let Some(credential) = artifact.credential.as_deref() {
      self.credentials.merge_into(credential, &mut location)?;
    }
    Ok(Some(location))
  }

  /// Stamp a location on every output artifact.
  pub fn resolve_outputs(
    &self,
    outputs: &mut Outputs,
    template_archive: Option<&ArtifactLocation>,
    default: Option<&ArtifactLocation>,
  ) -> Result<(), ArtifactError> {
    for artifact in &mut outputs.artifacts {
      if let Some(location) = self.resolve(artifact, template_archive, default)? {
        tracing::debug!(
          artifact = %artifact.name,
          artifact_type = location.get_type(),
          "artifact_location_resolved"
        );
        artifact.location = Some(location);
      }
    }
    Ok(())
  }
}
