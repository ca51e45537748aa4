/// Errors raised while loading, watching or reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config file '{path}': {source}")]
  ReadFile {
    path: String,
    source: std::io::Error,
  },

  #[error("failed to parse YAML config: {0}")]
  Yaml(#[from] serde_yaml::Error),

  #[error("failed to parse JSON config: {0}")]
  Json(#[from] serde_json::Error),

  #[error("invalid ttl '{value}': {message}")]
  InvalidTtl { value: String, message: String },

  #[error("config map '{namespace}/{name}' not found")]
  ConfigMapNotFound { namespace: String, name: String },

  #[error("key '{key}' not found in config map '{namespace}/{name}'")]
  KeyNotFound {
    namespace: String,
    name: String,
    key: String,
  },

  #[error("no home directory to derive the default config path from")]
  NoHomeDir,

  #[error("failed to watch config file: {0}")]
  Watch(String),
}
