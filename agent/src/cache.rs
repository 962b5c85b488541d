// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Credential cache keyed by [`slug`](crate::slug::slug).
//!
//! Each slug owns one [`RefreshableProvider`]. Entries are created lazily on the
//! first [`get_or_set`](CredentialCache::get_or_set) and then refresh themselves
//! until [`shutdown`](CredentialCache::shutdown).
//!
//! # Concurrency
//!
//! The map holds a shared [`OnceCell`] per slug, inserted under the map lock
//! before any fetch starts. Concurrent first requests for the same slug await
//! the same cell, so a slug is only ever backed by one provider and one
//! background task. A cell whose initialisation failed is removed again by the
//! last request holding it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{OnceCell, RwLock};
use tokio_util::sync::CancellationToken;

use crate::errors::CredentialError;
use crate::models::Credential;
use crate::provider::{ProviderContext, RefreshableProvider, RoleRequest};
use crate::slug::slug;

type Slot = Arc<OnceCell<Arc<RefreshableProvider>>>;

pub struct CredentialCache {
    entries: RwLock<HashMap<String, Slot>>,
    default_slug: RwLock<Option<String>>,
    context: ProviderContext,
    no_ip_restrict: bool,
    cancel_token: CancellationToken,
    started_at: DateTime<Utc>,
}

impl CredentialCache {
    pub fn new(context: ProviderContext) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_slug: RwLock::new(None),
            context,
            no_ip_restrict: false,
            cancel_token: CancellationToken::new(),
            started_at: Utc::now(),
        }
    }

    /// Forwards the broker's "no IP restriction" policy flag for every entry.
    pub fn with_no_ip_restrict(mut self, no_ip_restrict: bool) -> Self {
        self.no_ip_restrict = no_ip_restrict;
        self
    }

    /// When the cache was created; served as the instance's pending time.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn lookup(&self, key: &str) -> Option<Arc<RefreshableProvider>> {
        self.entries
            .read()
            .await
            .get(key)
            .and_then(|slot| slot.get().cloned())
    }

    /// Returns the provider for `role` and `chain` without fetching.
    ///
    /// # Errors
    ///
    /// [`CredentialError::NoCredentialsFoundInCache`] if there is no such entry.
    pub async fn get_provider(
        &self,
        role: &str,
        chain: &[String],
    ) -> Result<Arc<RefreshableProvider>, CredentialError> {
        self.lookup(&slug(role, chain))
            .await
            .ok_or(CredentialError::NoCredentialsFoundInCache)
    }

    /// Returns cached credentials for `role` and `chain` without fetching.
    pub async fn get(&self, role: &str, chain: &[String]) -> Result<Credential, CredentialError> {
        Ok(self.get_provider(role, chain).await?.retrieve().await)
    }

    /// Returns the provider for `role` and `chain`, creating it on a miss.
    #[tracing::instrument(skip(self))]
    pub async fn get_or_create_provider(
        &self,
        role: &str,
        region: &str,
        chain: &[String],
    ) -> Result<Arc<RefreshableProvider>, CredentialError> {
        let key = slug(role, chain);
        if let Some(provider) = self.lookup(&key).await {
            return Ok(provider);
        }

        let slot = {
            let mut entries = self.entries.write().await;
            Arc::clone(entries.entry(key.clone()).or_default())
        };

        let request = RoleRequest::new(role, region)
            .with_assume_chain(chain.to_vec())
            .with_no_ip_restrict(self.no_ip_restrict);
        let result = slot
            .get_or_try_init(|| {
                tracing::debug!("[agent] creating cache entry for {}", key);
                RefreshableProvider::new(
                    request,
                    self.context.clone(),
                    self.cancel_token.child_token(),
                )
            })
            .await
            .cloned();

        if let Err(err) = &result {
            tracing::warn!("[agent] unable to create cache entry for {}: {}", key, err);
            self.discard_failed(&key, slot).await;
        }

        result
    }

    /// Removes an uninitialised slot unless another request is still using it.
    async fn discard_failed(&self, key: &str, slot: Slot) {
        let mut entries = self.entries.write().await;
        let unused = entries.get(key).is_some_and(|current| {
            Arc::ptr_eq(current, &slot)
                && !current.initialized()
                // one reference held by the map and one by `slot`
                && Arc::strong_count(current) == 2
        });
        if unused {
            entries.remove(key);
        }
    }

    /// Returns credentials for `role` and `chain`, fetching them on a miss.
    ///
    /// # Errors
    ///
    /// Returns the error of the initial fetch when the entry had to be created.
    pub async fn get_or_set(
        &self,
        role: &str,
        region: &str,
        chain: &[String],
    ) -> Result<Credential, CredentialError> {
        Ok(self
            .get_or_create_provider(role, region, chain)
            .await?
            .retrieve()
            .await)
    }

    /// Like [`get_or_set`](Self::get_or_set), and remembers the entry as the one
    /// served by the single-role metadata routes.
    pub async fn set_default(
        &self,
        role: &str,
        region: &str,
        chain: &[String],
    ) -> Result<(), CredentialError> {
        self.get_or_create_provider(role, region, chain).await?;
        let key = slug(role, chain);
        tracing::info!("[agent] default role set to {}", key);
        *self.default_slug.write().await = Some(key);
        Ok(())
    }

    /// # Errors
    ///
    /// [`CredentialError::NoDefaultRoleSet`] before [`set_default`](Self::set_default)
    /// succeeded.
    pub async fn default_provider(&self) -> Result<Arc<RefreshableProvider>, CredentialError> {
        let key = self
            .default_slug
            .read()
            .await
            .clone()
            .ok_or(CredentialError::NoDefaultRoleSet)?;
        self.lookup(&key)
            .await
            .ok_or(CredentialError::NoCredentialsFoundInCache)
    }

    pub async fn get_default(&self) -> Result<Credential, CredentialError> {
        Ok(self.default_provider().await?.retrieve().await)
    }

    /// Stops every background refresh task and waits for them to exit.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let providers: Vec<Arc<RefreshableProvider>> = self
            .entries
            .read()
            .await
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect();

        for provider in &providers {
            provider.join_refresh_task().await;
        }
        tracing::info!("[agent] stopped {} refresh tasks", providers.len());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::TimeDelta;

    use crate::errors::{BrokerError, ErrorKind};
    use crate::testutil::{MockAssumer, MockBroker, context, role_arn};

    fn chain(arns: &[&str]) -> Vec<String> {
        arns.iter().map(|arn| arn.to_string()).collect()
    }

    fn cache_with(broker: Arc<MockBroker>) -> CredentialCache {
        CredentialCache::new(context(broker, Arc::new(MockAssumer::new())))
    }

    #[tokio::test]
    async fn test_get_on_empty_cache_is_not_found() {
        let cache = cache_with(Arc::new(MockBroker::new()));
        let err = cache.get("a", &[]).await.unwrap_err();
        assert!(matches!(err, CredentialError::NoCredentialsFoundInCache));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_get_distinguishes_chains() {
        let cache = cache_with(Arc::new(MockBroker::new()));
        cache.get_or_set("a", "us-east-1", &[]).await.unwrap();
        cache
            .get_or_set("a", "us-east-1", &chain(&["b", "c"]))
            .await
            .unwrap();

        assert_eq!(cache.get("a", &[]).await.unwrap().role_arn, role_arn("a"));
        assert_eq!(cache.get("a", &chain(&["b", "c"])).await.unwrap().role_arn, "c");
        assert!(matches!(
            cache.get("a", &chain(&["x"])).await,
            Err(CredentialError::NoCredentialsFoundInCache)
        ));
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_get_or_set_reuses_entry() {
        let broker = Arc::new(MockBroker::new());
        let cache = cache_with(broker.clone());
        let first = cache.get_or_set("dev", "us-east-1", &[]).await.unwrap();
        let second = cache.get_or_set("dev", "us-east-1", &[]).await.unwrap();
        assert_eq!(first.access_key_id, second.access_key_id);
        assert_eq!(broker.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let broker = Arc::new(MockBroker::new().with_delay(Duration::from_millis(50)));
        let cache = Arc::new(cache_with(broker.clone()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get_or_set("dev", "us-east-1", &[]).await })
            })
            .collect();

        let mut keys = Vec::new();
        for handle in handles {
            keys.push(handle.await.unwrap().unwrap().access_key_id.clone());
        }
        keys.dedup();

        assert_eq!(keys.len(), 1);
        assert_eq!(broker.calls(), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_creation_leaves_nothing_behind() {
        let broker = Arc::new(MockBroker::new());
        broker.push_failure(BrokerError::AmbiguousRole("dev, dev2".into()));
        let cache = cache_with(broker.clone());

        let err = cache.get_or_set("dev", "us-east-1", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Ambiguous);
        assert!(cache.is_empty().await);
        assert!(cache.entries.read().await.is_empty());

        cache.get_or_set("dev", "us-east-1", &[]).await.unwrap();
        assert_eq!(broker.calls(), 2);
    }

    #[tokio::test]
    async fn test_default_role() {
        let cache = cache_with(Arc::new(MockBroker::new()));
        assert!(matches!(
            cache.get_default().await,
            Err(CredentialError::NoDefaultRoleSet)
        ));

        cache.set_default("dev", "us-east-1", &[]).await.unwrap();
        let credential = cache.get_default().await.unwrap();
        assert_eq!(credential.role_arn, role_arn("dev"));
        assert_eq!(cache.default_provider().await.unwrap().role_name(), "dev");
    }

    #[tokio::test]
    async fn test_failed_set_default_keeps_no_default() {
        let broker = Arc::new(MockBroker::new());
        broker.push_failure(BrokerError::RoleNotFound("dev".into()));
        let cache = cache_with(broker);

        assert!(cache.set_default("dev", "us-east-1", &[]).await.is_err());
        assert!(matches!(
            cache.get_default().await,
            Err(CredentialError::NoDefaultRoleSet)
        ));
    }

    #[tokio::test]
    async fn test_no_ip_restrict_is_forwarded() {
        let cache = cache_with(Arc::new(MockBroker::new())).with_no_ip_restrict(true);
        let provider = cache
            .get_or_create_provider("dev", "us-east-1", &[])
            .await
            .unwrap();
        assert!(provider.no_ip_restrict());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_refresh_tasks() {
        let broker = Arc::new(MockBroker::new().with_ttl(TimeDelta::minutes(1)));
        let cache = cache_with(broker.clone());
        cache.get_or_set("a", "us-east-1", &[]).await.unwrap();
        cache.get_or_set("b", "us-east-1", &[]).await.unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(broker.calls(), 4);

        cache.shutdown().await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(broker.calls(), 4);
    }
}
