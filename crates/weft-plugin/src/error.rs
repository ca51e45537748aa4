/// Error reported by a hook.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("plugin '{plugin}' failed in {hook}: {message}")]
pub struct PluginError {
  pub plugin: String,
  pub hook: &'static str,
  pub message: String,
}

impl PluginError {
  pub fn new(plugin: impl Into<String>, hook: &'static str, message: impl Into<String>) -> Self {
    Self {
      plugin: plugin.into(),
      hook,
      message: message.into(),
    }
  }
}
