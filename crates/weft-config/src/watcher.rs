//! Hot reload of the controller configuration file.
//!
//! A debounced watcher re-parses the file on change, swaps the shared value
//! and invokes one registered callback. A file that fails to parse keeps the
//! previous configuration in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_mini::{DebouncedEventKind, Debouncer, new_debouncer};
use parking_lot::RwLock;

use crate::config::Config;
use crate::error::ConfigError;

/// The current configuration, shared between the watcher and its readers.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
  inner: Arc<RwLock<Arc<Config>>>,
}

impl SharedConfig {
  pub fn new(config: Config) -> Self {
    Self {
      inner: Arc::new(RwLock::new(Arc::new(config))),
    }
  }

  /// Snapshot of the current configuration.
  pub fn current(&self) -> Arc<Config> {
    self.inner.read().clone()
  }

  pub fn replace(&self, config: Config) {
    *self.inner.write() = Arc::new(config);
  }
}

type Callback = Box<dyn Fn(&Config) + Send + 'static>;

pub struct ConfigWatcher {
  path: PathBuf,
  shared: SharedConfig,
  debounce: Duration,
}

impl ConfigWatcher {
  /// Load `path` and prepare to watch it.
  pub fn new(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
    let path = path.into();
    let config = Config::load(&path)?;
    Ok(Self {
      path,
      shared: SharedConfig::new(config),
      debounce: Duration::from_millis(500),
    })
  }

  pub fn with_debounce(mut self, duration: Duration) -> Self {
    self.debounce = duration;
    self
  }

  pub fn shared(&self) -> SharedConfig {
    self.shared.clone()
  }

  /// Re-read the file now. Returns whether the configuration changed.
  pub fn reload(&self) -> Result<bool, ConfigError> {
    reload(&self.path, &self.shared)
  }

  /// Start watching. `on_change` runs once per effective change. Drop the
  /// handle to stop.
  pub fn watch<F>(&self, on_change: F) -> Result<WatcherHandle, ConfigError>
  where
    F: Fn(&Config) + Send + 'static,
  {
    let (notify_tx, notify_rx) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(self.debounce, notify_tx).map_err(|e| ConfigError::Watch(e.to_string()))?;

    // Watch the parent so editors that replace the file are still seen.
    let dir = self
      .path
      .parent()
      .filter(|p| !p.as_os_str().is_empty())
      .unwrap_or_else(|| Path::new("."))
      .to_path_buf();
    debouncer
      .watcher()
      .watch(&dir, notify::RecursiveMode::NonRecursive)
      .map_err(|e| ConfigError::Watch(e.to_string()))?;

    let path = self.path.clone();
    let file_name = path.file_name().map(|n| n.to_os_string());
    let shared = self.shared.clone();
    let callback: Callback = Box::new(on_change);

    let thread = std::thread::spawn(move || {
      while let Ok(result) = notify_rx.recv() {
        let events = match result {
          Ok(events) => events,
          Err(e) => {
            tracing::warn!(error = %e, "config_watch_error");
            continue;
          }
        };
        let touched = events.iter().any(|event| {
          event.kind == DebouncedEventKind::Any && event.path.file_name().map(|n| n.to_os_string()) == file_name
        });
        if !touched {
          continue;
        }
        match reload(&path, &shared) {
          Ok(true) => {
            tracing::info!(path = %path.display(), "config_reloaded");
            callback(&shared.current());
          }
          Ok(false) => {}
          Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "config_reload_failed");
          }
        }
      }
    });

    Ok(WatcherHandle {
      _debouncer: debouncer,
      _thread: thread,
    })
  }
}

fn reload(path: &Path, shared: &SharedConfig) -> Result<bool, ConfigError> {
  let config = Config::load(path)?;
  if *shared.current() == config {
    return Ok(false);
  }
  shared.replace(config);
  Ok(true)
}

/// Keeps the watcher alive. Dropping it closes the event channel, which ends
/// the watch thread.
pub struct WatcherHandle {
  _debouncer: Debouncer<notify::RecommendedWatcher>,
  _thread: std::thread::JoinHandle<()>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::mpsc;

  #[test]
  fn test_reload_detects_change() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "parallelism: 1\n").unwrap();

    let watcher = ConfigWatcher::new(&path).unwrap();
    assert_eq!(watcher.shared().current().parallelism, Some(1));
    assert!(!watcher.reload().unwrap());

    std::fs::write(&path, "parallelism: 2\n").unwrap();
    assert!(watcher.reload().unwrap());
    assert_eq!(watcher.shared().current().parallelism, Some(2));
  }

  #[test]
  fn test_bad_file_keeps_previous_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "parallelism: 1\n").unwrap();
    let watcher = ConfigWatcher::new(&path).unwrap();

    std::fs::write(&path, "parallelism: [not a number\n").unwrap();
    assert!(watcher.reload().is_err());
    assert_eq!(watcher.shared().current().parallelism, Some(1));
  }

  #[test]
  fn test_watch_invokes_callback() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "parallelism: 1\n").unwrap();

    let watcher = ConfigWatcher::new(&path)
      .unwrap()
      .with_debounce(Duration::from_millis(50));
    let (tx, rx) = mpsc::channel();
    let _handle = watcher
      .watch(move |config| {
        let _ = tx.send(config.parallelism);
      })
      .unwrap();

    std::thread::sleep(Duration::from_millis(100));
    std::fs::write(&path, "parallelism: 3\n").unwrap();
    let seen = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(seen, Some(3));
  }
}
