use std::collections::HashMap;

use weft_workflow::{ArtifactCredential, ArtifactLocation};

use crate::error::ArtifactError;

/// Credentials keyed by name.
#[derive(Debug, Clone, Default)]
pub struct CredentialRegistry {
  credentials: HashMap<String, ArtifactCredential>,
}

fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
  if slot.is_none() {
    slot.clone_from(value);
  }
}

fn fill_string(slot: &mut String, value: &Option<String>) {
  if slot.is_empty()
    && let Some(value) = value
  {
    *slot = value.clone();
  }
}

impl CredentialRegistry {
  pub fn new(credentials: impl IntoIterator<Item = ArtifactCredential>) -> Self {
    Self {
      credentials: credentials.into_iter().map(|c| (c.name.clone(), c)).collect(),
    }
  }

  pub fn register(&mut self, credential: ArtifactCredential) {
    self.credentials.insert(credential.name.clone(), credential);
  }

  pub fn get(&self, name: &str) -> Option<&ArtifactCredential> {
    self.credentials.get(name)
  }

  /// Fill unset fields of `location` from the named credential. Fields the
  /// location already carries are never overwritten.
  pub fn merge_into(&self, name: &str, location: &mut ArtifactLocation) -> Result<(), ArtifactError> {
    let credential = self.get(name).ok_or_else(|| ArtifactError::CredentialNotFound {
      name: name.to_string(),
    })?;
    merge(credential, location);
    Ok(())
  }
}

/// Non-destructive merge of the fields relevant to each backend.
pub fn merge(credential: &ArtifactCredential, location: &mut ArtifactLocation) {
  match location {
    ArtifactLocation::S3(s3) => {
      fill_string(&mut s3.endpoint, &credential.endpoint);
      fill(&mut s3.region, &credential.region);
      fill(&mut s3.access_key_secret, &credential.access_key_secret);
      fill(&mut s3.secret_key_secret, &credential.secret_key_secret);
    }
    ArtifactLocation::Oss(oss) => {
      fill_string(&mut oss.endpoint, &credential.endpoint);
      fill(&mut oss.access_key_secret, &credential.access_key_secret);
      fill(&mut oss.secret_key_secret, &credential.secret_key_secret);
    }
    ArtifactLocation::Gcs(gcs) => {
      fill(
        &mut gcs.service_account_key_secret,
        &credential.service_account_key_secret,
      );
    }
    ArtifactLocation::Artifactory(a) => {
      fill(&mut a.username_secret, &credential.username_secret);
      fill(&mut a.password_secret, &credential.password_secret);
    }
    ArtifactLocation::Git(git) => {
      fill(&mut git.username_secret, &credential.username_secret);
      fill(&mut git.password_secret, &credential.password_secret);
    }
    ArtifactLocation::Http(http) => {
      for header in &credential.headers {
        if !http.headers.iter().any(|h| h.name.eq_ignore_ascii_case(&header.name)) {
          http.headers.push(header.clone());
        }
      }
    }
    ArtifactLocation::Hdfs(_) | ArtifactLocation::Raw(_) => {}
  }
}
