// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! HTTP route handlers for the credential agent.
//!
//! | Method | Path | Handler | Body |
//! |--------|------|---------|------|
//! | GET | `/healthcheck` | [`healthcheck`] | JSON |
//! | PUT | `/{version}/api/token` | [`issue_token`] | text |
//! | GET | `/{version}/` | [`root_listing`] | text |
//! | GET | `/{version}/meta-data[/]` | [`meta_data_listing`] | text |
//! | GET | `/{version}/meta-data/iam/info` | [`iam_info`] | JSON |
//! | GET | `/{version}/meta-data/iam/security-credentials[/]` | [`security_credentials_listing`] | text |
//! | GET | `/{version}/meta-data/iam/security-credentials/{role}` | [`security_credentials`] | JSON |
//! | GET | `/{version}/dynamic/instance-identity/document` | [`instance_identity_document`] | JSON |
//! | GET | `/ecs/{role}` | [`ecs_credentials`] | JSON |
//! | GET | anything else | [`custom_path`] | text |
//!
//! The instance metadata routes serve the default role only. Their errors are
//! plain text because SDKs read the body verbatim; the container route and the
//! health check answer with JSON.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use crate::application::AppState;
use crate::arn::{Arn, parse_chain};
use crate::constants::{MAX_TOKEN_TTL_SECONDS, META_DATA_LISTING, ROOT_LISTING, TOKEN_TTL_HEADER};
use crate::errors::{AppError, PlainText};
use crate::models::{
    EcsCredentialDocument, IamInfo, ImdsCredentialDocument, InstanceIdentityDocument,
};
use crate::provider::RefreshableProvider;

/// Health check endpoint.
///
/// # Response
///
/// `200 {"status": "ok"}`, or `500 {"status": "unhealthy", "reason": ...}` after
/// the broker rejected this host's authentication.
pub async fn healthcheck(State(state): State<Arc<AppState>>) -> Response {
    match state.health.status().await {
        None => (StatusCode::OK, Json(json!({"status": "ok"}))).into_response(),
        Some(reason) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "unhealthy", "reason": reason})),
        )
            .into_response(),
    }
}

/// Issues an IMDSv2 session token.
///
/// # Errors
///
/// 400 if `X-aws-ec2-metadata-token-ttl-seconds` is missing, not an integer, or
/// outside `1..=21600`.
#[tracing::instrument(skip(state, headers))]
pub async fn issue_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<String, PlainText> {
    let ttl = headers
        .get(TOKEN_TTL_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|ttl| (1..=MAX_TOKEN_TTL_SECONDS).contains(ttl))
        .ok_or_else(|| {
            AppError::ValidationError(format!(
                "{TOKEN_TTL_HEADER} must be an integer between 1 and {MAX_TOKEN_TTL_SECONDS}"
            ))
        })?;

    let role = state
        .cache
        .default_provider()
        .await
        .ok()
        .map(|provider| provider.role_name().to_string());

    let token = state
        .sessions
        .generate_token(role.as_deref(), Duration::from_secs(ttl))
        .await;
    Ok(token)
}

pub async fn root_listing() -> &'static str {
    ROOT_LISTING
}

pub async fn meta_data_listing() -> &'static str {
    META_DATA_LISTING
}

async fn default_role_arn(provider: &RefreshableProvider) -> Result<Arn, PlainText> {
    let role_arn = provider.retrieve().await.role_arn.clone();
    Arn::parse(&role_arn).map_err(|err| {
        tracing::error!("[agent] default role has an unusable ARN: {}", err);
        PlainText(AppError::InternalServerError)
    })
}

/// `Code`, `LastUpdated` and the instance profile derived from the default role.
#[tracing::instrument(skip(state))]
pub async fn iam_info(State(state): State<Arc<AppState>>) -> Result<Json<IamInfo>, PlainText> {
    let provider = state.cache.default_provider().await?;
    let arn = default_role_arn(&provider).await?;
    let last_updated = provider.last_refreshed().await.unwrap_or_default();

    Ok(Json(IamInfo::new(
        arn.to_instance_profile().to_string(),
        &last_updated,
    )))
}

/// The default role's short name, newline-terminated.
#[tracing::instrument(skip(state))]
pub async fn security_credentials_listing(
    State(state): State<Arc<AppState>>,
) -> Result<String, PlainText> {
    let provider = state.cache.default_provider().await?;
    let arn = default_role_arn(&provider).await?;
    Ok(format!("{}\n", arn.short_name()))
}

/// Credentials of the default role, whatever `{role}` says.
#[tracing::instrument(skip(state))]
pub async fn security_credentials(
    State(state): State<Arc<AppState>>,
    Path((_version, role)): Path<(String, String)>,
) -> Result<Json<ImdsCredentialDocument>, PlainText> {
    let provider = state.cache.default_provider().await?;
    let snapshot = provider.snapshot().await;
    if role != provider.role_name() {
        tracing::debug!(
            "[agent] {} requested, serving default role {}",
            role,
            provider.role_name()
        );
    }

    let last_updated = snapshot.last_refreshed.unwrap_or_default();
    Ok(Json(ImdsCredentialDocument::new(
        &snapshot.credential,
        &last_updated,
    )))
}

#[tracing::instrument(skip(state))]
pub async fn instance_identity_document(
    State(state): State<Arc<AppState>>,
) -> Result<Json<InstanceIdentityDocument>, PlainText> {
    let provider = state.cache.default_provider().await?;
    let arn = default_role_arn(&provider).await?;

    Ok(Json(InstanceIdentityDocument::new(
        arn.account_id,
        provider.region().to_string(),
        &state.cache.started_at(),
    )))
}

#[derive(Debug, Deserialize)]
pub struct EcsQuery {
    /// Comma-separated role ARNs to assume after fetching `{role}`.
    pub assume: Option<String>,
}

/// Container-style credentials for any role, created on demand.
///
/// # Errors
///
/// - [`AppError::ValidationError`] - an `assume` element is not a valid ARN; the
///   cache is not touched
/// - [`AppError::Credential`] - the broker or an assume-role hop failed
#[tracing::instrument(skip(state))]
pub async fn ecs_credentials(
    State(state): State<Arc<AppState>>,
    Path(role): Path<String>,
    Query(query): Query<EcsQuery>,
) -> Result<Json<EcsCredentialDocument>, AppError> {
    let chain = parse_chain(query.assume.as_deref().unwrap_or_default())
        .map_err(|err| AppError::ValidationError(err.to_string()))?;

    let credential = state
        .cache
        .get_or_set(&role, &state.options.region, &chain)
        .await
        .map_err(|err| {
            tracing::error!("[agent] failed to get credentials for {}: {}", role, err);
            err
        })?;

    Ok(Json(EcsCredentialDocument::from(&credential)))
}

/// Operator-configured static text for any other path.
pub async fn custom_path(State(state): State<Arc<AppState>>, method: Method, uri: Uri) -> Response {
    if method != Method::GET {
        return StatusCode::NOT_FOUND.into_response();
    }

    let path = uri.path().trim_end_matches('/');
    match state.custom_paths.get(path) {
        Some(text) => text.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
