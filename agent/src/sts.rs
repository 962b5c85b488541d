// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Role chaining through AWS STS.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_config::timeout::TimeoutConfig;
use aws_credential_types::Credentials;
use aws_sdk_sts::config::Region;
use chrono::{DateTime, Utc};

use crate::constants::{ASSUME_ROLE_SESSION_NAME, DEFAULT_REQUEST_TIMEOUT};
use crate::models::Credential;

/// Exchanges one credential for another scoped to `role_arn`.
#[async_trait]
pub trait RoleAssumer: Send + Sync {
    async fn assume_role(
        &self,
        credential: &Credential,
        role_arn: &str,
        region: &str,
    ) -> Result<Credential>;
}

pub struct StsRoleAssumer {
    session_name: String,
    timeout: Duration,
}

impl Default for StsRoleAssumer {
    fn default() -> Self {
        Self::new(ASSUME_ROLE_SESSION_NAME)
    }
}

impl StsRoleAssumer {
    pub fn new(session_name: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Upper bound for a whole `AssumeRole` call, retries included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn timeout_config(&self) -> TimeoutConfig {
        TimeoutConfig::builder()
            .operation_timeout(self.timeout)
            .build()
    }
}

#[async_trait]
impl RoleAssumer for StsRoleAssumer {
    #[tracing::instrument(skip(self, credential))]
    async fn assume_role(
        &self,
        credential: &Credential,
        role_arn: &str,
        region: &str,
    ) -> Result<Credential> {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(Credentials::from(credential))
            .timeout_config(self.timeout_config())
            .load()
            .await;
        let client = aws_sdk_sts::Client::new(&config);

        let output = client
            .assume_role()
            .role_arn(role_arn)
            .role_session_name(&self.session_name)
            .send()
            .await
            .context("AssumeRole request failed")?;

        let assumed = output
            .credentials()
            .ok_or_else(|| anyhow!("AssumeRole returned no credentials"))?;
        let expiration = assumed.expiration();
        let expiration = DateTime::<Utc>::from_timestamp(expiration.secs(), expiration.subsec_nanos())
            .ok_or_else(|| anyhow!("AssumeRole returned an out of range expiration"))?;

        Ok(Credential {
            access_key_id: assumed.access_key_id().to_string(),
            secret_access_key: assumed.secret_access_key().to_string(),
            session_token: assumed.session_token().to_string(),
            expiration,
            role_arn: role_arn.to_string(),
        })
    }
}
