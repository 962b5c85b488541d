// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, put};
use tokio::net::TcpListener;

use crate::cache::CredentialCache;
use crate::configuration::AgentOptions;
use crate::constants::TOKEN_SWEEP_INTERVAL;
use crate::health::HealthState;
use crate::middleware::{
    reject_browser_requests, reject_browser_requests_json, require_session_token,
    stamp_response_headers,
};
use crate::routes;
use crate::session::SessionTokenStore;

pub struct AppState {
    pub options: AgentOptions,
    pub cache: Arc<CredentialCache>,
    pub sessions: Arc<SessionTokenStore>,
    pub health: Arc<HealthState>,
    pub custom_paths: HashMap<String, String>,
}

impl AppState {
    pub fn new(
        options: AgentOptions,
        cache: Arc<CredentialCache>,
        sessions: Arc<SessionTokenStore>,
        health: Arc<HealthState>,
    ) -> Self {
        let custom_paths = options.custom_path_map();
        Self {
            options,
            cache,
            sessions,
            health,
            custom_paths,
        }
    }
}

pub struct Application {
    port: u16,
    listener: TcpListener,
    state: Arc<AppState>,
}

impl Application {
    /// Binds the listener and starts the session token sweeper.
    pub async fn build(state: Arc<AppState>) -> Result<Self, std::io::Error> {
        let host = state.options.host.clone();
        let listener = TcpListener::bind((host.as_str(), state.options.port)).await?;
        let port = listener.local_addr()?.port();

        state.sessions.spawn_sweeper(TOKEN_SWEEP_INTERVAL).await;

        tracing::info!("[agent] listening at http://{}:{}", host, port);

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serves until SIGINT or SIGTERM, then stops the background tasks.
    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> {
        let app = create_router(self.state.clone());
        axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("[agent] shutting down");
        self.state.cache.shutdown().await;
        self.state.sessions.shutdown().await;
        Ok(())
    }
}

/// Builds the HTTP surface.
///
/// Instance metadata routes check the session token first, then browser
/// headers, and get metadata response headers. The token and container routes
/// skip the session check; the container route reports rejections as JSON.
/// `/healthcheck` has no filtering at all.
pub fn create_router(state: Arc<AppState>) -> Router {
    let metadata = Router::new()
        .route("/{version}/", get(routes::root_listing))
        .route("/{version}/meta-data", get(routes::meta_data_listing))
        .route("/{version}/meta-data/", get(routes::meta_data_listing))
        .route("/{version}/meta-data/iam/info", get(routes::iam_info))
        .route(
            "/{version}/meta-data/iam/security-credentials",
            get(routes::security_credentials_listing),
        )
        .route(
            "/{version}/meta-data/iam/security-credentials/",
            get(routes::security_credentials_listing),
        )
        .route(
            "/{version}/meta-data/iam/security-credentials/{role}",
            get(routes::security_credentials),
        )
        .route(
            "/{version}/dynamic/instance-identity/document",
            get(routes::instance_identity_document),
        )
        .fallback(routes::custom_path)
        .layer(from_fn(stamp_response_headers))
        .layer(from_fn(reject_browser_requests))
        .layer(from_fn_with_state(state.clone(), require_session_token));

    let token = Router::new()
        .route("/{version}/api/token", put(routes::issue_token))
        .layer(from_fn(stamp_response_headers))
        .layer(from_fn(reject_browser_requests));

    let container = Router::new()
        .route("/ecs/{role}", get(routes::ecs_credentials))
        .layer(from_fn(stamp_response_headers))
        .layer(from_fn(reject_browser_requests_json));

    Router::new()
        .route("/healthcheck", get(routes::healthcheck))
        .merge(metadata)
        .merge(token)
        .merge(container)
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("[agent] failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("[agent] failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
