/*
 * 5D Labs Canary Platform - Controller Service
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Canary Controller Service
//!
//! This service keeps PR-scoped canary environments converged by:
//! - Watching pull request lifecycle events (webhook push and/or polling)
//! - Reconciling one isolated environment per open PR
//! - Publishing the routing rule table that resolves tagged requests
//! - Pruning environments completely once their PR closes

use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use canary_controller::applier::KubeApplier;
use canary_controller::config::{ControllerConfig, SignalMode};
use canary_controller::registry::EnvironmentRegistry;
use canary_controller::routing::{RuleTable, RuleTablePublisher};
use canary_controller::signal::poll::{GitHubFeed, PollWatcher};
use canary_controller::signal::webhook::{handle_github_webhook, WebhookState};
use canary_controller::signal::{event_channel, EventSender};
use canary_controller::state::StateStore;
use canary_controller::ReconcileManager;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    rules: watch::Receiver<Arc<RuleTable>>,
    webhook: Arc<WebhookState>,
}

impl FromRef<AppState> for Arc<WebhookState> {
    fn from_ref(state: &AppState) -> Self {
        state.webhook.clone()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,canary_controller=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting 5D Labs Canary Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Arc::new(load_controller_config());
    config.validate()?;

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let namespace =
        std::env::var("CONTROLLER_NAMESPACE").unwrap_or_else(|_| "canary-system".to_string());

    let registry = Arc::new(EnvironmentRegistry::new());

    // Restore the prune checkpoint before any signal source starts, so a
    // restart mid-prune resumes deleting instead of leaking resources.
    let checkpoint = if config.reconcile.checkpoint.enabled {
        let store = StateStore::new(client.clone(), &namespace, &config.reconcile.checkpoint.config_map);
        let entries = store.load().await?;
        if !entries.is_empty() {
            info!(entries = entries.len(), "Restored environment checkpoint");
            registry.restore(entries);
        }
        Some(store)
    } else {
        None
    };

    let (publisher, rules) = RuleTablePublisher::new(config.routing.clone());
    let applier = Arc::new(KubeApplier::new(
        client.clone(),
        config.reconcile.applier_deadline(),
    ));

    let manager = ReconcileManager::new(
        registry.clone(),
        applier,
        publisher,
        checkpoint,
        config.clone(),
    );
    manager.resume();

    let (events, events_rx) = event_channel();
    let manager_handle = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager.run(events_rx).await;
        })
    };

    spawn_signal_sources(&config, events.clone())?;

    let state = AppState {
        rules,
        webhook: Arc::new(WebhookState { events }),
    };

    // Build the HTTP router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/routes", get(routes))
        .route("/webhook", post(handle_github_webhook))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(Duration::from_secs(60))),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    info!(
        "Canary controller HTTP server listening on {}",
        config.server.bind_address
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager_handle.abort();
    info!("Canary controller stopped");

    Ok(())
}

/// Starts the configured signal sources. The webhook route is always
/// mounted; poll mode additionally runs the diffing watcher.
fn spawn_signal_sources(config: &Arc<ControllerConfig>, events: EventSender) -> anyhow::Result<()> {
    if matches!(config.signal.mode, SignalMode::Poll | SignalMode::Both) {
        let (owner, repo) = config.github.owner_repo()?;
        let token = std::env::var(&config.github.token_env).ok();
        if token.is_none() {
            warn!(
                env = %config.github.token_env,
                "GitHub token not set, polling unauthenticated (rate limited)"
            );
        }
        let feed = GitHubFeed::new(owner, repo, token)?;
        let watcher = PollWatcher::new(Box::new(feed));
        let interval = config.signal.poll_interval();
        tokio::spawn(async move {
            watcher.run(interval, events).await;
        });
    } else {
        info!("Poll watcher disabled, relying on webhook delivery only");
    }
    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "canary-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(_state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    Ok(Json(json!({
        "status": "ready",
        "service": "canary-controller",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

/// Poll fallback for the routing layer: the authoritative rule table
/// snapshot, including its generation so callers can detect missed
/// notifications.
async fn routes(State(state): State<AppState>) -> Json<RuleTable> {
    let table = state.rules.borrow().clone();
    Json(table.as_ref().clone())
}

fn load_controller_config() -> ControllerConfig {
    let override_path = std::env::var("CONTROLLER_CONFIG_PATH").ok();
    let config_path = override_path
        .as_deref()
        .filter(|path| Path::new(path).exists())
        .unwrap_or("/config/config.yaml");

    match ControllerConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            info!("Loaded controller configuration from {}", config_path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {} - using defaults",
                config_path, err
            );
            ControllerConfig::default()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
