// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Shared test doubles for the broker and the assume-role hop.
//!
//! Feature-gated behind `testutil`; integration tests enable it through the
//! crate's own dev-dependency:
//!
//! ```toml
//! [dev-dependencies]
//! credential-agent = { path = ".", features = ["testutil"] }
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};

use crate::broker::BrokerClient;
use crate::errors::BrokerError;
use crate::health::HealthState;
use crate::models::Credential;
use crate::provider::{ProviderContext, RefreshPolicy};
use crate::sts::RoleAssumer;

pub const ACCOUNT_ID: &str = "123456789012";

pub fn role_arn(role: &str) -> String {
    format!("arn:aws:iam::{ACCOUNT_ID}:role/{role}")
}

/// A [`ProviderContext`] with the default policy and fresh health state.
pub fn context(broker: Arc<MockBroker>, assumer: Arc<MockAssumer>) -> ProviderContext {
    ProviderContext {
        broker,
        assumer,
        health: Arc::new(HealthState::new()),
        policy: RefreshPolicy::default(),
    }
}

/// Broker returning a distinct credential on every call, after first draining
/// any queued failures.
pub struct MockBroker {
    failures: Mutex<VecDeque<BrokerError>>,
    ttl: TimeDelta,
    delay: Duration,
    calls: AtomicUsize,
    idle_closes: AtomicUsize,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(VecDeque::new()),
            ttl: TimeDelta::hours(1),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            idle_closes: AtomicUsize::new(0),
        }
    }

    /// Lifetime of the credentials handed out.
    pub fn with_ttl(mut self, ttl: TimeDelta) -> Self {
        self.ttl = ttl;
        self
    }

    /// Simulated network latency per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_failure(&self, err: BrokerError) {
        self.failures
            .lock()
            .expect("mock broker lock poisoned")
            .push_back(err);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn idle_closes(&self) -> usize {
        self.idle_closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn get_role_credentials(
        &self,
        role: &str,
        _no_ip_restrict: bool,
    ) -> Result<Credential, BrokerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failure = self
            .failures
            .lock()
            .expect("mock broker lock poisoned")
            .pop_front();
        if let Some(err) = failure {
            return Err(err);
        }

        Ok(Credential {
            access_key_id: format!("ASIA{role}{call}"),
            secret_access_key: format!("secret-{role}-{call}"),
            session_token: format!("token-{role}-{call}"),
            expiration: Utc::now() + self.ttl,
            role_arn: role_arn(role),
        })
    }

    async fn close_idle_connections(&self) {
        self.idle_closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Assumer that records every hop and appends the role's short name to the key id.
#[derive(Default)]
pub struct MockAssumer {
    hops: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl MockAssumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, role_arn: &str) {
        self.failing
            .lock()
            .expect("mock assumer lock poisoned")
            .insert(role_arn.to_string());
    }

    pub fn hops(&self) -> Vec<String> {
        self.hops.lock().expect("mock assumer lock poisoned").clone()
    }
}

#[async_trait]
impl RoleAssumer for MockAssumer {
    async fn assume_role(
        &self,
        credential: &Credential,
        role_arn: &str,
        _region: &str,
    ) -> anyhow::Result<Credential> {
        self.hops
            .lock()
            .expect("mock assumer lock poisoned")
            .push(role_arn.to_string());
        if self
            .failing
            .lock()
            .expect("mock assumer lock poisoned")
            .contains(role_arn)
        {
            bail!("access denied for {role_arn}");
        }

        let short_name = role_arn.rsplit('/').next().unwrap_or(role_arn);
        Ok(Credential {
            access_key_id: format!("{}>{}", credential.access_key_id, short_name),
            secret_access_key: credential.secret_access_key.clone(),
            session_token: credential.session_token.clone(),
            expiration: credential.expiration,
            role_arn: role_arn.to_string(),
        })
    }
}
