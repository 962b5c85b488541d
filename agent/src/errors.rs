// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Coarse classification of every credential failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Retrieval,
    Ambiguous,
    AuthInvalid,
    Malformed,
}

impl ErrorKind {
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Retrieval => StatusCode::BAD_GATEWAY,
            Self::Ambiguous => StatusCode::CONFLICT,
            Self::AuthInvalid => StatusCode::UNAUTHORIZED,
            Self::Malformed => StatusCode::BAD_REQUEST,
        }
    }
}

/// Failures reported by the remote broker.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("more than one role matches: {0}")]
    AmbiguousRole(String),
    #[error("client TLS material is stale: {0}")]
    StaleTlsMaterial(String),
    #[error("broker rejected authentication: {0}")]
    AuthInvalid(String),
    #[error("role not found: {0}")]
    RoleNotFound(String),
    #[error("broker request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected broker response ({status}): {message}")]
    Unexpected { status: u16, message: String },
    #[error("invalid client identity: {0}")]
    Identity(String),
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AmbiguousRole(_) => ErrorKind::Ambiguous,
            Self::AuthInvalid(_) => ErrorKind::AuthInvalid,
            Self::RoleNotFound(_) => ErrorKind::NotFound,
            Self::StaleTlsMaterial(_)
            | Self::Request(_)
            | Self::Unexpected { .. }
            | Self::Identity(_) => ErrorKind::Retrieval,
        }
    }
}

/// Errors raised by the credential cache and its entries.
#[derive(thiserror::Error, Debug)]
pub enum CredentialError {
    #[error("no credentials found in cache")]
    NoCredentialsFoundInCache,
    #[error("no default role set")]
    NoDefaultRoleSet,
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("failed to assume role {arn}: {source}")]
    AssumeRole {
        arn: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("malformed ARN: {0}")]
    MalformedArn(String),
}

impl CredentialError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoCredentialsFoundInCache | Self::NoDefaultRoleSet => ErrorKind::NotFound,
            Self::Broker(err) => err.kind(),
            Self::AssumeRole { .. } => ErrorKind::Retrieval,
            Self::MalformedArn(_) => ErrorKind::Malformed,
        }
    }

    /// Only stale client certificates are worth retrying.
    pub fn is_stale_tls(&self) -> bool {
        matches!(self, Self::Broker(BrokerError::StaleTlsMaterial(_)))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("forbidden")]
    Forbidden,
    #[error("validation error: {0}")]
    ValidationError(String),
    #[error("internal server error")]
    InternalServerError,
}

impl AppError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            Self::Credential(err) => (err.kind().status_code(), err.to_string()),
            Self::Forbidden => (StatusCode::FORBIDDEN, "Forbidden".to_string()),
            Self::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::InternalServerError => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error".to_string(),
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();

        let body = Json(json!({"code": status.as_u16(), "message": message}));

        (status, body).into_response()
    }
}

/// Renders an [`AppError`] as a bare text body, which is what metadata clients read.
#[derive(Debug)]
pub struct PlainText(pub AppError);

impl IntoResponse for PlainText {
    fn into_response(self) -> Response {
        let (status, message) = self.0.status_and_message();
        (status, message).into_response()
    }
}

impl From<AppError> for PlainText {
    fn from(source: AppError) -> Self {
        Self(source)
    }
}

impl From<CredentialError> for PlainText {
    fn from(source: CredentialError) -> Self {
        Self(AppError::Credential(source))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn test_kinds() {
        assert_eq!(
            CredentialError::NoCredentialsFoundInCache.kind(),
            ErrorKind::NotFound
        );
        assert_eq!(CredentialError::NoDefaultRoleSet.kind(), ErrorKind::NotFound);
        assert_eq!(
            CredentialError::from(BrokerError::AmbiguousRole("dev".into())).kind(),
            ErrorKind::Ambiguous
        );
        assert_eq!(
            CredentialError::from(BrokerError::AuthInvalid("expired".into())).kind(),
            ErrorKind::AuthInvalid
        );
        assert_eq!(
            CredentialError::MalformedArn("x".into()).kind(),
            ErrorKind::Malformed
        );
        let hop = CredentialError::AssumeRole {
            arn: "arn:aws:iam::123456789012:role/x".into(),
            source: anyhow::anyhow!("denied"),
        };
        assert_eq!(hop.kind(), ErrorKind::Retrieval);
        assert!(hop.to_string().contains("arn:aws:iam::123456789012:role/x"));
    }

    #[test]
    fn test_only_stale_tls_is_retryable() {
        assert!(CredentialError::from(BrokerError::StaleTlsMaterial("cert".into())).is_stale_tls());
        assert!(!CredentialError::from(BrokerError::AmbiguousRole("dev".into())).is_stale_tls());
        assert!(!CredentialError::NoCredentialsFoundInCache.is_stale_tls());
    }

    #[tokio::test]
    async fn test_app_error_renders_json() {
        let response = AppError::ValidationError("bad ttl".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], 400);
        assert_eq!(json["message"], "bad ttl");
    }

    #[tokio::test]
    async fn test_plain_text_renders_message() {
        let response = PlainText::from(CredentialError::NoDefaultRoleSet).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"no default role set");
    }
}
