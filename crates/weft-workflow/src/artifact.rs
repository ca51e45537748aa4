//! Artifact locations and configured repositories.
//!
//! [`ArtifactLocation`] is a sum type over the storage backends. Each variant
//! knows whether it carries enough information to locate an object
//! ([`ArtifactLocation::has_location`]) and how to read and write its key.
//! HTTP and Artifactory keys are URL paths; Git and Raw artifacts have no key.

use serde::{Deserialize, Serialize};
use url::{Position, Url};

use crate::error::WorkflowError;

/// Key pattern used when a repository has no explicit key format.
pub const DEFAULT_ARCHIVE_PATTERN: &str = "{{workflow.name}}/{{pod.name}}";

/// Config map consulted when an `ArtifactRepositoryRef` names none.
pub const DEFAULT_REPOSITORIES_CONFIG_MAP: &str = "artifact-repositories";

/// Reference to a key in a secret.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecretKeySelector {
  pub name: String,
  pub key: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Artifact {
  #[serde(default)]
  pub endpoint: String,
  #[serde(default)]
  pub bucket: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub region: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub insecure: Option<bool>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub access_key_secret: Option<SecretKeySelector>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub secret_key_secret: Option<SecretKeySelector>,
  #[serde(default)]
  pub key: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcsArtifact {
  #[serde(default)]
  pub bucket: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub service_account_key_secret: Option<SecretKeySelector>,
  #[serde(default)]
  pub key: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OssArtifact {
  #[serde(default)]
  pub endpoint: String,
  #[serde(default)]
  pub bucket: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub access_key_secret: Option<SecretKeySelector>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub secret_key_secret: Option<SecretKeySelector>,
  #[serde(default)]
  pub key: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactoryArtifact {
  /// Full URL of the object; its path is the key.
  #[serde(default)]
  pub url: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub username_secret: Option<SecretKeySelector>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub password_secret: Option<SecretKeySelector>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HdfsArtifact {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub addresses: Vec<String>,
  /// File path; doubles as the key.
  #[serde(default)]
  pub path: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub hdfs_user: Option<String>,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Header {
  pub name: String,
  pub value: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpArtifact {
  #[serde(default)]
  pub url: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub headers: Vec<Header>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitArtifact {
  #[serde(default)]
  pub repo: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub revision: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub depth: Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub username_secret: Option<SecretKeySelector>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub password_secret: Option<SecretKeySelector>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawArtifact {
  #[serde(default)]
  pub data: String,
}

/// Where an artifact lives. Exactly one backend per location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactLocation {
  S3(S3Artifact),
  Gcs(GcsArtifact),
  Oss(OssArtifact),
  Artifactory(ArtifactoryArtifact),
  Hdfs(HdfsArtifact),
  Http(HttpArtifact),
  Git(GitArtifact),
  Raw(RawArtifact),
}

fn parse_url(raw: &str) -> Result<Url, WorkflowError> {
  Url::parse(raw).map_err(|e| WorkflowError::InvalidUrl {
    url: raw.to_string(),
    message: e.to_string(),
  })
}

/// The decoded path of `raw`, so `{{...}}` placeholders read back as written.
fn url_path(raw: &str) -> Result<String, WorkflowError> {
  let url = parse_url(raw)?;
  urlencoding::decode(url.path())
    .map(|path| path.into_owned())
    .map_err(|e| WorkflowError::InvalidUrl {
      url: raw.to_string(),
      message: e.to_string(),
    })
}

/// Replace the path of `raw` with `key`, keeping the key verbatim so
/// placeholders are still there for substitution.
fn with_url_path(raw: &str, key: &str) -> Result<String, WorkflowError> {
  let url = parse_url(raw)?;
  let separator = if key.starts_with('/') { "" } else { "/" };
  Ok(format!(
    "{}{separator}{key}{}",
    &url[..Position::BeforePath],
    &url[Position::AfterPath..]
  ))
}

/// `path.Join` semantics: join non-empty elements with `/` and clean the
/// result. A leading slash is preserved.
pub fn path_join(parts: &[&str]) -> String {
  let joined = parts
    .iter()
    .filter(|p| !p.is_empty())
    .copied()
    .collect::<Vec<_>>()
    .join("/");
  if joined.is_empty() {
    return String::new();
  }
  clean_path(&joined)
}

fn clean_path(path: &str) -> String {
  let rooted = path.starts_with('/');
  let mut out: Vec<&str> = Vec::new();
  for segment in path.split('/') {
    match segment {
      "" | "." => {}
      ".." => {
        if out.last().is_some_and(|s| *s != "..") {
          out.pop();
        } else if !rooted {
          out.push("..");
        }
      }
      s => out.push(s),
    }
  }
  let body = out.join("/");
  match (rooted, body.is_empty()) {
    (true, _) => format!("/{body}"),
    (false, true) => ".".to_string(),
    (false, false) => body,
  }
}

impl ArtifactLocation {
  pub fn get_type(&self) -> &'static str {
    match self {
      ArtifactLocation::S3(_) => "s3",
      ArtifactLocation::Gcs(_) => "gcs",
      ArtifactLocation::Oss(_) => "oss",
      ArtifactLocation::Artifactory(_) => "artifactory",
      ArtifactLocation::Hdfs(_) => "hdfs",
      ArtifactLocation::Http(_) => "http",
      ArtifactLocation::Git(_) => "git",
      ArtifactLocation::Raw(_) => "raw",
    }
  }

  /// Whether enough is known to read or write the object.
  pub fn has_location(&self) -> bool {
    match self {
      ArtifactLocation::S3(a) => !a.endpoint.is_empty() && !a.bucket.is_empty() && !a.key.is_empty(),
      ArtifactLocation::Gcs(a) => !a.bucket.is_empty() && !a.key.is_empty(),
      ArtifactLocation::Oss(a) => !a.bucket.is_empty() && !a.endpoint.is_empty() && !a.key.is_empty(),
      ArtifactLocation::Artifactory(a) => !a.url.is_empty(),
      ArtifactLocation::Hdfs(a) => !a.addresses.is_empty(),
      ArtifactLocation::Http(a) => !a.url.is_empty(),
      ArtifactLocation::Git(a) => !a.repo.is_empty(),
      ArtifactLocation::Raw(_) => true,
    }
  }

  pub fn get_key(&self) -> Result<String, WorkflowError> {
    match self {
      ArtifactLocation::S3(a) => Ok(a.key.clone()),
      ArtifactLocation::Gcs(a) => Ok(a.key.clone()),
      ArtifactLocation::Oss(a) => Ok(a.key.clone()),
      ArtifactLocation::Hdfs(a) => Ok(a.path.clone()),
      ArtifactLocation::Artifactory(a) => url_path(&a.url),
      ArtifactLocation::Http(a) => url_path(&a.url),
      ArtifactLocation::Git(_) | ArtifactLocation::Raw(_) => Err(WorkflowError::KeyUnsupported {
        artifact_type: self.get_type(),
      }),
    }
  }

  pub fn set_key(&mut self, key: &str) -> Result<(), WorkflowError> {
    match self {
      ArtifactLocation::S3(a) => a.key = key.to_string(),
      ArtifactLocation::Gcs(a) => a.key = key.to_string(),
      ArtifactLocation::Oss(a) => a.key = key.to_string(),
      ArtifactLocation::Hdfs(a) => a.path = key.to_string(),
      ArtifactLocation::Artifactory(a) => a.url = with_url_path(&a.url, key)?,
      ArtifactLocation::Http(a) => a.url = with_url_path(&a.url, key)?,
      ArtifactLocation::Git(_) | ArtifactLocation::Raw(_) => {
        return Err(WorkflowError::KeyUnsupported {
          artifact_type: self.get_type(),
        });
      }
    }
    Ok(())
  }

  /// `key = path.Join(key, name)`.
  pub fn append_to_key(&mut self, name: &str) -> Result<(), WorkflowError> {
    let key = self.get_key()?;
    self.set_key(&path_join(&[&key, name]))
  }

  /// Take the repository coordinates of `other` while keeping this key.
  pub fn relocate(&mut self, other: &ArtifactLocation) -> Result<(), WorkflowError> {
    let key = self.get_key()?;
    *self = other.clone();
    self.set_key(&key)
  }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3ArtifactRepository {
  #[serde(default)]
  pub endpoint: String,
  #[serde(default)]
  pub bucket: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub region: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub insecure: Option<bool>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub access_key_secret: Option<SecretKeySelector>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub secret_key_secret: Option<SecretKeySelector>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub key_format: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub key_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcsArtifactRepository {
  #[serde(default)]
  pub bucket: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub service_account_key_secret: Option<SecretKeySelector>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub key_format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OssArtifactRepository {
  #[serde(default)]
  pub endpoint: String,
  #[serde(default)]
  pub bucket: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub access_key_secret: Option<SecretKeySelector>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub secret_key_secret: Option<SecretKeySelector>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub key_format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactoryArtifactRepository {
  #[serde(default, rename = "repoURL")]
  pub repo_url: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub username_secret: Option<SecretKeySelector>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub password_secret: Option<SecretKeySelector>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub key_format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HdfsArtifactRepository {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub addresses: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub path_format: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub hdfs_user: Option<String>,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub force: bool,
}

/// The backend of a configured repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryBackend {
  S3(S3ArtifactRepository),
  Gcs(GcsArtifactRepository),
  Oss(OssArtifactRepository),
  Artifactory(ArtifactoryArtifactRepository),
  Hdfs(HdfsArtifactRepository),
}

fn key_or_default(key_format: &Option<String>) -> String {
  match key_format.as_deref() {
    Some(k) if !k.is_empty() => k.to_string(),
    _ => DEFAULT_ARCHIVE_PATTERN.to_string(),
  }
}

impl RepositoryBackend {
  /// The default location artifacts are written to in this repository.
  pub fn into_artifact_location(&self) -> ArtifactLocation {
    match self {
      RepositoryBackend::S3(r) => {
        let key = match r.key_format.as_deref() {
          Some(k) if !k.is_empty() => k.to_string(),
          _ => path_join(&[r.key_prefix.as_deref().unwrap_or(""), DEFAULT_ARCHIVE_PATTERN]),
        };
        ArtifactLocation::S3(S3Artifact {
          endpoint: r.endpoint.clone(),
          bucket: r.bucket.clone(),
          region: r.region.clone(),
          insecure: r.insecure,
          access_key_secret: r.access_key_secret.clone(),
          secret_key_secret: r.secret_key_secret.clone(),
          key,
        })
      }
      RepositoryBackend::Gcs(r) => ArtifactLocation::Gcs(GcsArtifact {
        bucket: r.bucket.clone(),
        service_account_key_secret: r.service_account_key_secret.clone(),
        key: key_or_default(&r.key_format),
      }),
      RepositoryBackend::Oss(r) => ArtifactLocation::Oss(OssArtifact {
        endpoint: r.endpoint.clone(),
        bucket: r.bucket.clone(),
        access_key_secret: r.access_key_secret.clone(),
        secret_key_secret: r.secret_key_secret.clone(),
        key: key_or_default(&r.key_format),
      }),
      RepositoryBackend::Artifactory(r) => {
        let prefix = if r.repo_url.is_empty() {
          String::new()
        } else {
          format!("{}/", r.repo_url.trim_end_matches('/'))
        };
        ArtifactLocation::Artifactory(ArtifactoryArtifact {
          url: format!("{prefix}{}", key_or_default(&r.key_format)),
          username_secret: r.username_secret.clone(),
          password_secret: r.password_secret.clone(),
        })
      }
      RepositoryBackend::Hdfs(r) => ArtifactLocation::Hdfs(HdfsArtifact {
        addresses: r.addresses.clone(),
        path: key_or_default(&r.path_format),
        hdfs_user: r.hdfs_user.clone(),
        force: r.force,
      }),
    }
  }
}

/// A configured artifact repository.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRepository {
  /// Archive pod logs to this repository.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub archive_logs: Option<bool>,
  #[serde(flatten)]
  pub backend: Option<RepositoryBackend>,
}

impl ArtifactRepository {
  pub fn new(backend: RepositoryBackend) -> Self {
    Self {
      archive_logs: None,
      backend: Some(backend),
    }
  }

  pub fn into_artifact_location(&self) -> Option<ArtifactLocation> {
    self.backend.as_ref().map(RepositoryBackend::into_artifact_location)
  }
}

/// Named credentials that fill unset fields of an artifact location.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactCredential {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub endpoint: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub region: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub access_key_secret: Option<SecretKeySelector>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub secret_key_secret: Option<SecretKeySelector>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub service_account_key_secret: Option<SecretKeySelector>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub username_secret: Option<SecretKeySelector>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub password_secret: Option<SecretKeySelector>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub headers: Vec<Header>,
}

/// Points at a repository entry stored in a config map.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRepositoryRef {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub config_map: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub key: Option<String>,
}

impl ArtifactRepositoryRef {
  pub fn config_map_or_default(&self) -> &str {
    match self.config_map.as_deref() {
      Some(c) if !c.is_empty() => c,
      _ => DEFAULT_REPOSITORIES_CONFIG_MAP,
    }
  }
}
