use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use weft_config::MetricsConfig;

use crate::error::MetricsError;
use crate::registry::MetricsRegistry;

pub const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

/// Router serving the registry at `path`.
pub fn router(registry: Arc<MetricsRegistry>, path: &str) -> Router {
  Router::new().route(path, get(scrape)).with_state(registry)
}

async fn scrape(State(registry): State<Arc<MetricsRegistry>>) -> impl IntoResponse {
  ([(header::CONTENT_TYPE, TEXT_FORMAT)], registry.render())
}

pub struct MetricsServer {
  addr: SocketAddr,
  path: String,
  registry: Arc<MetricsRegistry>,
}

impl MetricsServer {
  /// `None` when metrics are turned off.
  pub fn from_config(config: &MetricsConfig, registry: Arc<MetricsRegistry>) -> Option<Self> {
    config.enabled().then(|| Self {
      addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port())),
      path: normalize_path(config.path()),
      registry,
    })
  }

  pub fn with_addr(mut self, addr: SocketAddr) -> Self {
    self.addr = addr;
    self
  }

  pub fn path(&self) -> &str {
    &self.path
  }

  /// Serve until cancelled.
  pub async fn run(self, cancel: CancellationToken) -> Result<(), MetricsError> {
    let listener = self.bind().await?;
    axum::serve(listener, router(self.registry, &self.path))
      .with_graceful_shutdown(cancel.cancelled_owned())
      .await
      .map_err(MetricsError::Serve)
  }

  /// Bind, serve in the background until cancelled and return the bound
  /// address.
  pub async fn spawn(self, cancel: CancellationToken) -> Result<SocketAddr, MetricsError> {
    let listener = self.bind().await?;
    let addr = listener.local_addr().map_err(MetricsError::Serve)?;
    let app = router(self.registry, &self.path);
    tokio::spawn(async move {
      axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .ok();
    });
    Ok(addr)
  }

  async fn bind(&self) -> Result<TcpListener, MetricsError> {
    let listener = TcpListener::bind(self.addr).await.map_err(|source| MetricsError::Bind {
      addr: self.addr.to_string(),
      source,
    })?;
    let local = listener.local_addr().map_err(MetricsError::Serve)?;
    info!(addr = %local, path = %self.path, "metrics_server_started");
    Ok(listener)
  }
}

fn normalize_path(path: &str) -> String {
  if path.starts_with('/') {
    path.to_string()
  } else {
    format!("/{path}")
  }
}
