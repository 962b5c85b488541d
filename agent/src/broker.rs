// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Client for the remote credential broker.
//!
//! The broker authenticates this host (mutual TLS) and hands out role
//! credentials. Everything about that handshake lives behind
//! [`BrokerClient`]; the cache only needs to fetch credentials and, after a
//! certificate rotation, force a new TLS session.
//!
//! # Wire Format
//!
//! ```text
//! GET {broker}/v1/credentials?role=<role>&no_ip_restrict=<bool>
//!
//! 200 {"AccessKeyId", "SecretAccessKey", "SessionToken", "Expiration", "RoleArn"}
//! 4xx {"code": "AmbiguousRole" | "CertificateStale" | "Unauthorized" | "RoleNotFound", "message"}
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Certificate, Client, Identity, StatusCode};
use tokio::sync::RwLock;

use crate::configuration::AgentOptions;
use crate::constants::BROKER_CREDENTIALS_PATH;
use crate::errors::BrokerError;
use crate::models::{BrokerCredentials, BrokerErrorBody, Credential};

/// Non-standard status some TLS-terminating proxies use for a bad client certificate.
const SSL_CERTIFICATE_ERROR: u16 = 495;

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Fetches base credentials for `role`.
    async fn get_role_credentials(
        &self,
        role: &str,
        no_ip_restrict: bool,
    ) -> Result<Credential, BrokerError>;

    /// Drops pooled connections so the next request performs a fresh TLS handshake.
    async fn close_idle_connections(&self);
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub base_url: String,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub ca_cert: Option<PathBuf>,
    pub timeout: Duration,
}

impl From<&AgentOptions> for BrokerSettings {
    fn from(options: &AgentOptions) -> Self {
        Self {
            base_url: options.broker_url.clone(),
            client_cert: options.client_cert.clone(),
            client_key: options.client_key.clone(),
            ca_cert: options.ca_cert.clone(),
            timeout: Duration::from_secs(options.request_timeout_secs),
        }
    }
}

/// [`BrokerClient`] over HTTPS with an optional client certificate.
///
/// The identity is read from disk whenever the underlying client is rebuilt,
/// so a certificate rotated on disk is picked up by
/// [`close_idle_connections`](BrokerClient::close_idle_connections).
pub struct HttpBrokerClient {
    settings: BrokerSettings,
    client: RwLock<Client>,
}

impl HttpBrokerClient {
    /// # Errors
    ///
    /// Returns [`BrokerError::Identity`] if the certificate files cannot be read
    /// or parsed, or if only one of certificate and key is configured.
    pub fn new(settings: BrokerSettings) -> Result<Self, BrokerError> {
        let client = build_client(&settings)?;
        Ok(Self {
            settings,
            client: RwLock::new(client),
        })
    }

    fn credentials_url(&self) -> String {
        format!(
            "{}{}",
            self.settings.base_url.trim_end_matches('/'),
            BROKER_CREDENTIALS_PATH
        )
    }
}

#[async_trait]
impl BrokerClient for HttpBrokerClient {
    #[tracing::instrument(skip(self))]
    async fn get_role_credentials(
        &self,
        role: &str,
        no_ip_restrict: bool,
    ) -> Result<Credential, BrokerError> {
        let client = self.client.read().await.clone();
        let no_ip_restrict = if no_ip_restrict { "true" } else { "false" };

        let response = client
            .get(self.credentials_url())
            .query(&[("role", role), ("no_ip_restrict", no_ip_restrict)])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let credentials: BrokerCredentials = response.json().await?;
            return Ok(credentials.into());
        }

        let body: BrokerErrorBody = response.json().await.unwrap_or_default();
        tracing::debug!(
            "[agent] broker returned {} for role {}: {}",
            status,
            role,
            body.code
        );
        Err(classify(status, body))
    }

    async fn close_idle_connections(&self) {
        // certificate files are read from disk
        let settings = self.settings.clone();
        match tokio::task::spawn_blocking(move || build_client(&settings)).await {
            Ok(Ok(client)) => {
                *self.client.write().await = client;
                tracing::debug!("[agent] rebuilt broker client");
            }
            Ok(Err(err)) => {
                tracing::warn!("[agent] keeping previous broker client: {}", err);
            }
            Err(err) => {
                tracing::error!("[agent] broker client rebuild task failed: {}", err);
            }
        }
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, BrokerError> {
    std::fs::read(path)
        .map_err(|err| BrokerError::Identity(format!("unable to read {}: {}", path.display(), err)))
}

fn build_client(settings: &BrokerSettings) -> Result<Client, BrokerError> {
    let mut builder = Client::builder()
        .use_rustls_tls()
        .timeout(settings.timeout);

    match (&settings.client_cert, &settings.client_key) {
        (Some(cert), Some(key)) => {
            let mut pem = read_pem(cert)?;
            pem.extend(read_pem(key)?);
            let identity = Identity::from_pem(&pem)
                .map_err(|err| BrokerError::Identity(err.to_string()))?;
            builder = builder.identity(identity);
        }
        (None, None) => {}
        _ => {
            return Err(BrokerError::Identity(
                "client certificate and key must be configured together".to_string(),
            ));
        }
    }

    if let Some(ca_cert) = &settings.ca_cert {
        let certificate = Certificate::from_pem(&read_pem(ca_cert)?)
            .map_err(|err| BrokerError::Identity(err.to_string()))?;
        builder = builder.add_root_certificate(certificate);
    }

    builder.build().map_err(BrokerError::Request)
}

/// Maps a failed broker response onto a [`BrokerError`], preferring the error code
/// in the body over the status.
fn classify(status: StatusCode, body: BrokerErrorBody) -> BrokerError {
    let message = if body.message.is_empty() {
        status.to_string()
    } else {
        body.message
    };

    match body.code.as_str() {
        "AmbiguousRole" => return BrokerError::AmbiguousRole(message),
        "CertificateStale" => return BrokerError::StaleTlsMaterial(message),
        "Unauthorized" => return BrokerError::AuthInvalid(message),
        "RoleNotFound" => return BrokerError::RoleNotFound(message),
        _ => {}
    }

    match status {
        StatusCode::CONFLICT => BrokerError::AmbiguousRole(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BrokerError::AuthInvalid(message),
        StatusCode::NOT_FOUND => BrokerError::RoleNotFound(message),
        status if status.as_u16() == SSL_CERTIFICATE_ERROR => {
            BrokerError::StaleTlsMaterial(message)
        }
        status => BrokerError::Unexpected {
            status: status.as_u16(),
            message,
        },
    }
}
