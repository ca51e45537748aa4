use std::fmt;
use std::str::FromStr;

use weft_workflow::{MutexRef, SemaphoreRef};

use crate::error::SyncError;

/// What a lock key refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKind {
  /// A semaphore whose limit is the value of `key` in config map `name`.
  Semaphore { config_map: String, key: String },
  Mutex { name: String },
  /// A semaphore kept in the shared lock database, limited by the row
  /// `ns/key` of the limit table.
  Database { key: String },
  /// A mutex kept in the shared lock database.
  DatabaseMutex { name: String },
}

/// Fully-qualified lock identity: `ns/ConfigMap/name/key`, `ns/Mutex/name`,
/// `ns/Database/key` or `ns/DatabaseMutex/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
  pub namespace: String,
  pub kind: LockKind,
}

impl LockKey {
  pub fn semaphore(default_namespace: &str, semaphore: &SemaphoreRef) -> Result<Self, SyncError> {
    let kind = match (&semaphore.config_map_key_ref, &semaphore.database) {
      (Some(selector), None) => LockKind::Semaphore {
        config_map: selector.name.clone(),
        key: selector.key.clone(),
      },
      (None, Some(database)) => LockKind::Database {
        key: database.key.clone(),
      },
      _ => {
        return Err(SyncError::InvalidLockKey(
          "semaphore needs exactly one of configMapKeyRef and database".to_string(),
        ));
      }
    };
    Ok(Self {
      namespace: semaphore
        .namespace
        .clone()
        .unwrap_or_else(|| default_namespace.to_string()),
      kind,
    })
  }

  pub fn mutex(default_namespace: &str, mutex: &MutexRef) -> Self {
    let name = mutex.name.clone();
    Self {
      namespace: mutex
        .namespace
        .clone()
        .unwrap_or_else(|| default_namespace.to_string()),
      kind: if mutex.database {
        LockKind::DatabaseMutex { name }
      } else {
        LockKind::Mutex { name }
      },
    }
  }

  pub fn is_mutex(&self) -> bool {
    matches!(self.kind, LockKind::Mutex { .. } | LockKind::DatabaseMutex { .. })
  }

  /// Held through the shared lock database.
  pub fn is_database(&self) -> bool {
    matches!(self.kind, LockKind::Database { .. } | LockKind::DatabaseMutex { .. })
  }

  /// Row name in the lock database: `sem/ns/key` or `mtx/ns/name`.
  pub fn store_name(&self) -> Option<String> {
    match &self.kind {
      LockKind::Database { key } => Some(format!("{SEMAPHORE_PREFIX}{}/{key}", self.namespace)),
      LockKind::DatabaseMutex { name } => Some(format!("{MUTEX_PREFIX}{}/{name}", self.namespace)),
      LockKind::Semaphore { .. } | LockKind::Mutex { .. } => None,
    }
  }
}

/// Prefix of database semaphore rows. What follows is the limit row name.
pub const SEMAPHORE_PREFIX: &str = "sem/";
pub const MUTEX_PREFIX: &str = "mtx/";

impl fmt::Display for LockKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.kind {
      LockKind::Semaphore { config_map, key } => {
        write!(f, "{}/ConfigMap/{}/{}", self.namespace, config_map, key)
      }
      LockKind::Mutex { name } => write!(f, "{}/Mutex/{}", self.namespace, name),
      LockKind::Database { key } => write!(f, "{}/Database/{}", self.namespace, key),
      LockKind::DatabaseMutex { name } => write!(f, "{}/DatabaseMutex/{}", self.namespace, name),
    }
  }
}

impl FromStr for LockKey {
  type Err = SyncError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let parts: Vec<&str> = s.split('/').collect();
    let kind = match parts.as_slice() {
      [_, "ConfigMap", config_map, key] => LockKind::Semaphore {
        config_map: config_map.to_string(),
        key: key.to_string(),
      },
      [_, "Mutex", name] => LockKind::Mutex {
        name: name.to_string(),
      },
      [_, "Database", key] => LockKind::Database { key: key.to_string() },
      [_, "DatabaseMutex", name] => LockKind::DatabaseMutex {
        name: name.to_string(),
      },
      _ => return Err(SyncError::InvalidLockKey(s.to_string())),
    };
    Ok(Self {
      namespace: parts[0].to_string(),
      kind,
    })
  }
}

/// `ns/wf` for a workflow-level lock, `ns/wf/node` for a template-level one.
pub fn holder_key(namespace: &str, workflow: &str, node_id: Option<&str>) -> String {
  match node_id {
    Some(node) => format!("{namespace}/{workflow}/{node}"),
    None => format!("{namespace}/{workflow}"),
  }
}

/// The `ns/wf` prefix of a holder key.
pub fn workflow_key(holder_key: &str) -> &str {
  match holder_key.match_indices('/').nth(1) {
    Some((idx, _)) => &holder_key[..idx],
    None => holder_key,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_semaphore_key_defaults_namespace() {
    let key = LockKey::semaphore("team", &SemaphoreRef::config_map("limits", "workflow")).unwrap();
    assert_eq!(key.to_string(), "team/ConfigMap/limits/workflow");
    assert_eq!(key.to_string().parse::<LockKey>().unwrap(), key);
    assert!(!key.is_database());
    assert_eq!(key.store_name(), None);
  }

  #[test]
  fn test_mutex_key() {
    let key = LockKey::mutex(
      "team",
      &MutexRef {
        name: "deploy".into(),
        namespace: Some("ops".into()),
        database: false,
      },
    );
    assert_eq!(key.to_string(), "ops/Mutex/deploy");
    assert!(key.is_mutex());
    assert!("ops/Semaphore/x".parse::<LockKey>().is_err());
  }

  #[test]
  fn test_database_keys() {
    let semaphore = LockKey::semaphore("team", &SemaphoreRef::database("gpu")).unwrap();
    assert_eq!(semaphore.to_string(), "team/Database/gpu");
    assert_eq!(semaphore.store_name().as_deref(), Some("sem/team/gpu"));
    assert_eq!(semaphore.to_string().parse::<LockKey>().unwrap(), semaphore);

    let mutex = LockKey::mutex(
      "team",
      &MutexRef {
        database: true,
        ..MutexRef::named("deploy")
      },
    );
    assert_eq!(mutex.to_string(), "team/DatabaseMutex/deploy");
    assert_eq!(mutex.store_name().as_deref(), Some("mtx/team/deploy"));
    assert!(mutex.is_mutex() && mutex.is_database());

    assert!(LockKey::semaphore("team", &SemaphoreRef::default()).is_err());
  }

  #[test]
  fn test_holder_and_workflow_keys() {
    assert_eq!(holder_key("ns", "wf", None), "ns/wf");
    assert_eq!(holder_key("ns", "wf", Some("wf-123")), "ns/wf/wf-123");
    assert_eq!(workflow_key("ns/wf/wf-123"), "ns/wf");
    assert_eq!(workflow_key("ns/wf"), "ns/wf");
  }
}
