// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Session tokens for IMDSv2-style requests.
//!
//! Tokens are opaque random strings handed out by `PUT /{version}/api/token` and
//! presented back in the `X-aws-ec2-metadata-token` header. They are unrelated to
//! the credentials being served; they only prove the caller could issue a `PUT`,
//! which a browser page cannot do across origins.
//!
//! Expired tokens are rejected by [`SessionTokenStore::check_token`] immediately.
//! The sweeper started by [`SessionTokenStore::spawn_sweeper`] only reclaims memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::rngs::OsRng;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::constants::{TOKEN_ALPHABET, TOKEN_LENGTH};

#[derive(Debug, Clone)]
struct SessionToken {
    initial_ttl: Duration,
    expires_at: Instant,
    role: Option<String>,
}

#[derive(Default)]
pub struct SessionTokenStore {
    tokens: RwLock<HashMap<String, SessionToken>>,
    cancel_token: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a new token valid for `ttl`.
    #[tracing::instrument(skip(self))]
    pub async fn generate_token(&self, role: Option<&str>, ttl: Duration) -> String {
        let token = random_token();
        let entry = SessionToken {
            initial_ttl: ttl,
            expires_at: Instant::now() + ttl,
            role: role.map(str::to_string),
        };
        self.tokens.write().await.insert(token.clone(), entry);
        token
    }

    /// Returns the remaining TTL in whole seconds (rounded up), or `None` if the
    /// token is unknown or expired.
    pub async fn check_token(&self, token: &str) -> Option<u64> {
        let tokens = self.tokens.read().await;
        let entry = tokens.get(token)?;
        let remaining = entry.expires_at.checked_duration_since(Instant::now())?;
        if remaining.is_zero() {
            return None;
        }
        Some(remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0))
    }

    /// Deletes every expired token and returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, entry| {
            let live = entry.expires_at > now;
            if !live {
                tracing::trace!(
                    "[agent] expiring session token (role: {:?}, ttl: {:?})",
                    entry.role,
                    entry.initial_ttl
                );
            }
            live
        });
        before - tokens.len()
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tokens.read().await.is_empty()
    }

    /// Starts the background sweep, running every `interval` until
    /// [`shutdown`](Self::shutdown).
    pub async fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let store = Arc::clone(self);
        let token = self.cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("[agent] session token sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = store.purge_expired().await;
                        tracing::debug!("[agent] swept {} expired session tokens", removed);
                    }
                }
            }
        });

        *self.sweeper.lock().await = Some(handle);
    }

    /// Stops the sweeper and waits for it to exit.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.sweeper.lock().await.take() {
            if let Err(err) = handle.await {
                tracing::warn!("[agent] session token sweeper failed: {:?}", err);
            }
        }
    }
}

fn random_token() -> String {
    let mut rng = OsRng;
    (0..TOKEN_LENGTH)
        .map(|_| char::from(TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())]))
        .collect()
}
