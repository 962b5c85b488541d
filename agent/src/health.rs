// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use tokio::sync::RwLock;

/// Process health as reported by `/healthcheck`.
///
/// Broker authentication is process-wide, so one rejected refresh marks the whole
/// agent unhealthy until any later fetch succeeds.
#[derive(Debug, Default)]
pub struct HealthState {
    unhealthy_reason: RwLock<Option<String>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` when healthy, otherwise the reason.
    pub async fn status(&self) -> Option<String> {
        self.unhealthy_reason.read().await.clone()
    }

    pub async fn set_healthy(&self) {
        let mut reason = self.unhealthy_reason.write().await;
        if reason.take().is_some() {
            tracing::info!("[agent] health restored");
        }
    }

    pub async fn set_unhealthy(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!("[agent] marking unhealthy: {}", reason);
        *self.unhealthy_reason.write().await = Some(reason);
    }
}
