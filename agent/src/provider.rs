// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Self-refreshing credentials for one role and assume-chain.
//!
//! # Lifecycle
//!
//! 1. **Construction**: [`RefreshableProvider::new`] fetches synchronously; if that
//!    fails the provider is never created.
//! 2. **Auto-refresh**: a background task wakes every [`RefreshPolicy::tick`] and
//!    fetches again once the credential is within [`RefreshPolicy::threshold`] of
//!    expiring. Failures are logged and the previous credential keeps being served.
//! 3. **Shutdown**: the task stops when its [`CancellationToken`] is cancelled.
//!
//! # Retries
//!
//! Only [`BrokerError::StaleTlsMaterial`](crate::errors::BrokerError::StaleTlsMaterial)
//! is retried, up to [`RefreshPolicy::retries`] attempts in total with a fixed
//! delay. Before each retry the broker client drops its idle connections so a
//! rotated client certificate is used for the next handshake.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::broker::BrokerClient;
use crate::configuration::AgentOptions;
use crate::constants::{
    DEFAULT_REFRESH_THRESHOLD, DEFAULT_RETRIES, DEFAULT_RETRY_DELAY, REFRESH_TICK_INTERVAL,
};
use crate::errors::{CredentialError, ErrorKind};
use crate::health::HealthState;
use crate::models::Credential;
use crate::slug::slug;
use crate::sts::RoleAssumer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Refresh once `now > expiration - threshold`.
    pub threshold: Duration,
    /// How often the background task checks the expiration.
    pub tick: Duration,
    /// Maximum fetch attempts for stale TLS material.
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_REFRESH_THRESHOLD,
            tick: REFRESH_TICK_INTERVAL,
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl From<&AgentOptions> for RefreshPolicy {
    fn from(options: &AgentOptions) -> Self {
        Self {
            threshold: Duration::from_secs(options.refresh_threshold_minutes * 60),
            retries: options.retries,
            retry_delay: Duration::from_secs(options.retry_delay_secs),
            ..Self::default()
        }
    }
}

/// Collaborators shared by every provider of a cache.
#[derive(Clone)]
pub struct ProviderContext {
    pub broker: Arc<dyn BrokerClient>,
    pub assumer: Arc<dyn RoleAssumer>,
    pub health: Arc<HealthState>,
    pub policy: RefreshPolicy,
}

/// What to fetch: a role, where, and which roles to hop through afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleRequest {
    pub role_name: String,
    pub region: String,
    pub assume_chain: Vec<String>,
    pub no_ip_restrict: bool,
}

impl RoleRequest {
    pub fn new(role_name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            role_name: role_name.into(),
            region: region.into(),
            assume_chain: Vec::new(),
            no_ip_restrict: false,
        }
    }

    pub fn with_assume_chain(mut self, assume_chain: Vec<String>) -> Self {
        self.assume_chain = assume_chain;
        self
    }

    pub fn with_no_ip_restrict(mut self, no_ip_restrict: bool) -> Self {
        self.no_ip_restrict = no_ip_restrict;
        self
    }

    pub fn slug(&self) -> String {
        slug(&self.role_name, &self.assume_chain)
    }
}

/// A consistent view of the mutable part of a provider.
#[derive(Debug, Clone, Default)]
pub struct CredentialSnapshot {
    pub credential: Credential,
    /// `None` until the first successful fetch.
    pub last_refreshed: Option<DateTime<Utc>>,
}

pub struct RefreshableProvider {
    request: RoleRequest,
    context: ProviderContext,
    state: RwLock<CredentialSnapshot>,
    refresh_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshableProvider {
    /// Fetches credentials for `request` and starts the auto-refresh task.
    ///
    /// # Errors
    ///
    /// Returns the error of the initial fetch; no task is started in that case.
    #[tracing::instrument(skip(context, cancel))]
    pub async fn new(
        request: RoleRequest,
        context: ProviderContext,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, CredentialError> {
        let provider = Arc::new(Self::unstarted(request, context));
        provider.refresh().await?;
        provider.spawn_auto_refresh(cancel).await;
        Ok(provider)
    }

    /// Builds a provider without fetching or starting the background task.
    pub(crate) fn unstarted(request: RoleRequest, context: ProviderContext) -> Self {
        Self {
            request,
            context,
            state: RwLock::new(CredentialSnapshot::default()),
            refresh_handle: Mutex::new(None),
        }
    }

    pub fn role_name(&self) -> &str {
        &self.request.role_name
    }

    pub fn region(&self) -> &str {
        &self.request.region
    }

    pub fn no_ip_restrict(&self) -> bool {
        self.request.no_ip_restrict
    }

    /// Returns the current credential.
    ///
    /// This never reports expiry: the background task keeps the value fresh, so
    /// callers should use it as is.
    pub async fn retrieve(&self) -> Credential {
        self.state.read().await.credential.clone()
    }

    pub async fn snapshot(&self) -> CredentialSnapshot {
        self.state.read().await.clone()
    }

    pub async fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.last_refreshed
    }

    /// Whether the credential is within the refresh threshold of expiring at `now`.
    pub async fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        let expiration = self.state.read().await.credential.expiration;
        let threshold = TimeDelta::from_std(self.context.policy.threshold).unwrap_or(TimeDelta::MAX);
        expiration
            .checked_sub_signed(threshold)
            .is_none_or(|deadline| now > deadline)
    }

    /// Fetches new credentials, retrying stale TLS failures, and swaps them in.
    ///
    /// On failure the current credential is left untouched.
    #[tracing::instrument(skip(self), fields(role = %self.request.role_name))]
    pub async fn refresh(&self) -> Result<(), CredentialError> {
        let max_attempts = self.context.policy.retries.max(1);
        let mut attempt = 1;

        let credential = loop {
            match self.fetch().await {
                Ok(credential) => break credential,
                Err(err) if err.is_stale_tls() && attempt < max_attempts => {
                    tracing::warn!(
                        "[agent] attempt {}/{} for {} failed, retrying in {:?}: {}",
                        attempt,
                        max_attempts,
                        self.request.role_name,
                        self.context.policy.retry_delay,
                        err
                    );
                    self.context.broker.close_idle_connections().await;
                    tokio::time::sleep(self.context.policy.retry_delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.kind() == ErrorKind::AuthInvalid {
                        self.context.health.set_unhealthy(err.to_string()).await;
                    }
                    return Err(err);
                }
            }
        };

        let expiration = credential.expiration;
        {
            let mut state = self.state.write().await;
            state.credential = credential;
            state.last_refreshed = Some(Utc::now());
        }
        self.context.health.set_healthy().await;

        tracing::info!(
            "[agent] refreshed credentials for {}, expires at {}",
            self.request.slug(),
            expiration
        );
        Ok(())
    }

    /// One broker fetch followed by every hop of the assume-chain, in order.
    async fn fetch(&self) -> Result<Credential, CredentialError> {
        let mut credential = self
            .context
            .broker
            .get_role_credentials(&self.request.role_name, self.request.no_ip_restrict)
            .await?;

        for arn in &self.request.assume_chain {
            credential = self
                .context
                .assumer
                .assume_role(&credential, arn, &self.request.region)
                .await
                .map_err(|source| CredentialError::AssumeRole {
                    arn: arn.clone(),
                    source,
                })?;
        }

        Ok(credential)
    }

    async fn refresh_if_stale(&self) {
        if !self.needs_refresh(Utc::now()).await {
            return;
        }
        if let Err(err) = self.refresh().await {
            tracing::warn!(
                "[agent] background refresh of {} failed, serving previous credentials: {}",
                self.request.slug(),
                err
            );
        }
    }

    async fn spawn_auto_refresh(self: &Arc<Self>, cancel: CancellationToken) {
        let provider = Arc::clone(self);
        let tick = self.context.policy.tick;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = provider.refresh_if_stale() => {}
                        }
                    }
                }
            }
            tracing::debug!(
                "[agent] auto-refresh for {} stopped",
                provider.request.slug()
            );
        });

        *self.refresh_handle.lock().await = Some(handle);
    }

    /// Waits for the auto-refresh task to exit once its token has been cancelled.
    pub(crate) async fn join_refresh_task(&self) {
        if let Some(handle) = self.refresh_handle.lock().await.take() {
            if let Err(err) = handle.await {
                tracing::warn!("[agent] auto-refresh task failed: {:?}", err);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::errors::BrokerError;
    use crate::testutil::{MockAssumer, MockBroker, context, role_arn};

    const CHAIN_A: &str = "arn:aws:iam::111111111111:role/a";
    const CHAIN_B: &str = "arn:aws:iam::222222222222:role/b";

    #[tokio::test]
    async fn test_new_fetches_and_populates() {
        let broker = Arc::new(MockBroker::new());
        let provider = RefreshableProvider::new(
            RoleRequest::new("dev", "eu-west-1"),
            context(broker.clone(), Arc::new(MockAssumer::new())),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let snapshot = provider.snapshot().await;
        assert_eq!(snapshot.credential.role_arn, role_arn("dev"));
        assert!(snapshot.credential.expiration > Utc::now());
        assert!(snapshot.last_refreshed.is_some());
        assert_eq!(provider.region(), "eu-west-1");
        assert_eq!(broker.calls(), 1);
    }

    #[tokio::test]
    async fn test_new_fails_when_first_fetch_fails() {
        let broker = Arc::new(MockBroker::new());
        broker.push_failure(BrokerError::RoleNotFound("dev".into()));
        let result = RefreshableProvider::new(
            RoleRequest::new("dev", "us-east-1"),
            context(broker, Arc::new(MockAssumer::new())),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(result.err().unwrap().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_unstarted_provider_is_zeroed_until_refresh() {
        let broker = Arc::new(MockBroker::new());
        let provider = RefreshableProvider::unstarted(
            RoleRequest::new("dev", "us-east-1"),
            context(broker, Arc::new(MockAssumer::new())),
        );
        assert_eq!(provider.last_refreshed().await, None);
        assert!(provider.retrieve().await.access_key_id.is_empty());

        provider.refresh().await.unwrap();
        assert!(provider.last_refreshed().await.is_some());
        assert!(!provider.retrieve().await.access_key_id.is_empty());
    }

    #[tokio::test]
    async fn test_retrieval_failure_leaves_state_untouched() {
        let broker = Arc::new(MockBroker::new());
        broker.push_failure(BrokerError::Unexpected {
            status: 500,
            message: "boom".into(),
        });
        let provider = RefreshableProvider::unstarted(
            RoleRequest::new("dev", "us-east-1"),
            context(broker.clone(), Arc::new(MockAssumer::new())),
        );

        let err = provider.refresh().await.unwrap_err();
        assert!(matches!(
            err,
            CredentialError::Broker(BrokerError::Unexpected { status: 500, .. })
        ));
        assert_eq!(err.kind(), ErrorKind::Retrieval);

        let snapshot = provider.snapshot().await;
        assert!(snapshot.credential.access_key_id.is_empty());
        assert!(snapshot.credential.role_arn.is_empty());
        assert_eq!(snapshot.credential.expiration, DateTime::<Utc>::default());
        assert_eq!(snapshot.last_refreshed, None);
        assert_eq!(broker.calls(), 1);
        assert_eq!(broker.idle_closes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_tls_is_retried_with_fresh_connections() {
        let broker = Arc::new(MockBroker::new());
        broker.push_failure(BrokerError::StaleTlsMaterial("rotated".into()));
        broker.push_failure(BrokerError::StaleTlsMaterial("rotated".into()));
        let provider = RefreshableProvider::unstarted(
            RoleRequest::new("dev", "us-east-1"),
            context(broker.clone(), Arc::new(MockAssumer::new())),
        );

        let started = tokio::time::Instant::now();
        provider.refresh().await.unwrap();
        assert_eq!(broker.calls(), 3);
        assert_eq!(broker.idle_closes(), 2);
        assert!(started.elapsed() >= RefreshPolicy::default().retry_delay * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_is_slept_between_attempts() {
        let broker = Arc::new(MockBroker::new());
        broker.push_failure(BrokerError::StaleTlsMaterial("rotated".into()));
        let mut context = context(broker.clone(), Arc::new(MockAssumer::new()));
        context.policy.retry_delay = Duration::from_secs(30);
        let provider = RefreshableProvider::unstarted(RoleRequest::new("dev", "us-east-1"), context);

        let refresh = tokio::spawn({
            let provider = Arc::new(provider);
            async move { provider.refresh().await }
        });

        // first attempt failed, second one waits on the delay
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(broker.calls(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(broker.calls(), 2);
        refresh.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_tls_gives_up_after_max_attempts() {
        let broker = Arc::new(MockBroker::new());
        for _ in 0..4 {
            broker.push_failure(BrokerError::StaleTlsMaterial("rotated".into()));
        }
        let provider = RefreshableProvider::unstarted(
            RoleRequest::new("dev", "us-east-1"),
            context(broker.clone(), Arc::new(MockAssumer::new())),
        );

        let err = provider.refresh().await.unwrap_err();
        assert!(err.is_stale_tls());
        assert_eq!(broker.calls(), RefreshPolicy::default().retries as usize);
        assert_eq!(provider.last_refreshed().await, None);
    }

    #[tokio::test]
    async fn test_ambiguous_role_is_not_retried() {
        let broker = Arc::new(MockBroker::new());
        broker.push_failure(BrokerError::AmbiguousRole("dev, dev2".into()));
        let provider = RefreshableProvider::unstarted(
            RoleRequest::new("dev", "us-east-1"),
            context(broker.clone(), Arc::new(MockAssumer::new())),
        );

        let err = provider.refresh().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Ambiguous);
        assert_eq!(broker.calls(), 1);
    }

    #[tokio::test]
    async fn test_auth_invalid_marks_unhealthy_until_success() {
        let broker = Arc::new(MockBroker::new());
        broker.push_failure(BrokerError::AuthInvalid("jwt expired".into()));
        let context = context(broker, Arc::new(MockAssumer::new()));
        let health = context.health.clone();
        let provider =
            RefreshableProvider::unstarted(RoleRequest::new("dev", "us-east-1"), context);

        assert!(provider.refresh().await.is_err());
        assert!(health.status().await.unwrap().contains("jwt expired"));

        provider.refresh().await.unwrap();
        assert_eq!(health.status().await, None);
    }

    #[tokio::test]
    async fn test_assume_chain_is_walked_in_order() {
        let assumer = Arc::new(MockAssumer::new());
        let provider = RefreshableProvider::unstarted(
            RoleRequest::new("dev", "us-east-1")
                .with_assume_chain(vec![CHAIN_A.to_string(), CHAIN_B.to_string()]),
            context(Arc::new(MockBroker::new()), assumer.clone()),
        );

        provider.refresh().await.unwrap();
        assert_eq!(assumer.hops(), vec![CHAIN_A.to_string(), CHAIN_B.to_string()]);

        let credential = provider.retrieve().await;
        assert_eq!(credential.role_arn, CHAIN_B);
        assert!(credential.access_key_id.ends_with(">a>b"));
    }

    #[tokio::test]
    async fn test_failed_hop_aborts_whole_fetch() {
        let assumer = Arc::new(MockAssumer::new());
        assumer.fail_on(CHAIN_B);
        let provider = RefreshableProvider::unstarted(
            RoleRequest::new("dev", "us-east-1")
                .with_assume_chain(vec![CHAIN_A.to_string(), CHAIN_B.to_string()]),
            context(Arc::new(MockBroker::new()), assumer),
        );

        let err = provider.refresh().await.unwrap_err();
        assert!(matches!(&err, CredentialError::AssumeRole { arn, .. } if arn == CHAIN_B));
        assert!(provider.retrieve().await.role_arn.is_empty());
    }

    #[tokio::test]
    async fn test_needs_refresh_uses_threshold() {
        let broker = Arc::new(MockBroker::new().with_ttl(TimeDelta::minutes(30)));
        let provider = RefreshableProvider::unstarted(
            RoleRequest::new("dev", "us-east-1"),
            context(broker, Arc::new(MockAssumer::new())),
        );
        // never fetched: the zero expiration is always stale
        assert!(provider.needs_refresh(Utc::now()).await);

        provider.refresh().await.unwrap();
        let now = Utc::now();
        assert!(!provider.needs_refresh(now).await);
        assert!(!provider.needs_refresh(now + TimeDelta::minutes(19)).await);
        assert!(provider.needs_refresh(now + TimeDelta::minutes(21)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_refresh_renews_expiring_credentials() {
        let broker = Arc::new(MockBroker::new().with_ttl(TimeDelta::minutes(5)));
        let cancel = CancellationToken::new();
        let provider = RefreshableProvider::new(
            RoleRequest::new("dev", "us-east-1"),
            context(broker.clone(), Arc::new(MockAssumer::new())),
            cancel.clone(),
        )
        .await
        .unwrap();
        let first = provider.retrieve().await.access_key_id.clone();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(broker.calls(), 2);
        assert_ne!(provider.retrieve().await.access_key_id, first);

        cancel.cancel();
        provider.join_refresh_task().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(broker.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_refresh_skips_fresh_credentials() {
        let broker = Arc::new(MockBroker::new());
        let provider = RefreshableProvider::new(
            RoleRequest::new("dev", "us-east-1"),
            context(broker.clone(), Arc::new(MockAssumer::new())),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_secs(185)).await;
        assert_eq!(broker.calls(), 1);
        assert!(provider.last_refreshed().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_failure_keeps_previous_credentials() {
        let broker = Arc::new(MockBroker::new().with_ttl(TimeDelta::minutes(5)));
        let provider = RefreshableProvider::new(
            RoleRequest::new("dev", "us-east-1"),
            context(broker.clone(), Arc::new(MockAssumer::new())),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let before = provider.snapshot().await;
        broker.push_failure(BrokerError::Unexpected {
            status: 503,
            message: "unavailable".into(),
        });

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(broker.calls(), 2);
        let after = provider.snapshot().await;
        assert_eq!(after.credential.access_key_id, before.credential.access_key_id);
        assert_eq!(after.last_refreshed, before.last_refreshed);
    }
}
