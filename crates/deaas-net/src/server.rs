//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "HTTP listener combining the REST and WebSocket routers."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;
use crate::{rest, websocket};

/// Builder for the API server.
#[derive(Clone)]
pub struct ApiServerBuilder {
    listen: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    cors_origins: Vec<String>,
}

impl ApiServerBuilder {
    /// Any browser origin is allowed until [`Self::cors_origins`] narrows it.
    pub fn new(listen: SocketAddr, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            listen,
            dispatcher,
            cors_origins: vec!["*".to_owned()],
        }
    }

    /// Origins allowed to call the API from a browser. `"*"` allows any;
    /// an empty list disables cross-origin access.
    pub fn cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }

    /// Bind the listener and serve until [`ApiServerHandle::shutdown`].
    pub async fn spawn(self) -> anyhow::Result<ApiServerHandle> {
        let cors = cors_layer(&self.cors_origins)?;
        let listener = TcpListener::bind(self.listen)
            .await
            .with_context(|| format!("failed to bind api listener {}", self.listen))?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "api server listening");

        let app = rest::router(self.dispatcher.clone())
            .merge(websocket::router(self.dispatcher.clone()))
            .layer(cors)
            .layer(TraceLayer::new_for_http());

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!(error = %err, "api server exited with error");
            }
        });

        Ok(ApiServerHandle {
            address: local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Handle for the running API server.
pub struct ApiServerHandle {
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ApiServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Trigger graceful shutdown and await completion.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(()) => Ok(()),
            Err(err) => Err(anyhow::anyhow!(err)),
        }
    }
}

fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    if origins.is_empty() {
        return Ok(CorsLayer::new());
    }
    let layer = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers(Any);
    if origins.iter().any(|origin| origin == "*") {
        return Ok(layer.allow_origin(Any));
    }
    let allowed = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid CORS origin {origin:?}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(allowed)))
}
