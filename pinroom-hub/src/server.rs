//! HTTP surface: the room upgrade endpoint and a health check.
//!
//! Architecture:
//! ```text
//! GET /ws?pin=4242 ──► PIN check ──► OriginPolicy ──► upgrade ──► peer::serve
//!                         │               │                          │
//!                        400             403                  RoomRegistry
//!                                                                    │
//!                                                     ┌──────────────┼──────────────┐
//!                                                     ▼              ▼              ▼
//!                                                  Room 4242     Room 1111      Room ...
//!
//! GET /health ──► 200 OK
//! ```
//!
//! Rejections happen before the upgrade, so a refused request never touches
//! the registry.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::config::HubConfig;
use crate::origin::OriginPolicy;
use crate::peer;
use crate::protocol::HubError;
use crate::registry::RoomRegistry;
use crate::transport;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Room and peer tuning
    pub hub: HubConfig,
    /// Upgrade admission
    pub origins: OriginPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            hub: HubConfig::default(),
            origins: OriginPolicy::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), HubError> {
        if self.bind_addr.is_empty() {
            return Err(HubError::Config("bind_addr must not be empty".into()));
        }
        self.hub.validate()
    }
}

#[derive(Clone)]
struct AppState {
    registry: Arc<RoomRegistry>,
    origins: Arc<OriginPolicy>,
}

#[derive(Debug, Deserialize)]
struct PinQuery {
    pin: Option<String>,
}

/// The hub server.
pub struct HubServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
}

impl HubServer {
    pub fn new(config: ServerConfig) -> Result<Self, HubError> {
        config.validate()?;
        let registry = Arc::new(RoomRegistry::new(config.hub.clone())?);
        Ok(Self { config, registry })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            origins: Arc::new(self.config.origins.clone()),
        };
        Router::new()
            .route("/ws", get(ws_upgrade))
            .route("/health", get(health))
            .with_state(state)
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), HubError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves, then
    /// stop every room.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), HubError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        log::info!("Pinroom hub listening on {}", listener.local_addr()?);

        let registry = self.registry.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.await;
                registry.shutdown();
            })
            .await?;

        self.registry.shutdown();
        self.registry.drained().await;
        log::info!("Pinroom hub stopped");
        Ok(())
    }
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<PinQuery>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(pin) = query.pin.filter(|pin| !pin.is_empty()) else {
        log::warn!("Rejected upgrade without a PIN");
        return (StatusCode::BAD_REQUEST, "PIN required").into_response();
    };
    if let Err(e) = state.origins.check(&headers) {
        log::warn!("Rejected upgrade for room {pin}: {e}");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let registry = state.registry;
    upgrade
        .max_message_size(registry.config().max_message_size)
        .on_failed_upgrade(|e| log::warn!("WebSocket upgrade failed: {e}"))
        .on_upgrade(move |socket| async move {
            let (sink, stream) = transport::split_socket(socket);
            if let Err(e) = peer::serve(&registry, &pin, sink, stream).await {
                log::debug!("Connection for room {pin} not admitted: {e}");
            }
        })
}

async fn health() -> &'static str {
    "OK"
}
