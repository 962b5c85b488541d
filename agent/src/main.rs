// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use credential_agent::application::{AppState, Application};
use credential_agent::arn::parse_chain;
use credential_agent::broker::{BrokerSettings, HttpBrokerClient};
use credential_agent::cache::CredentialCache;
use credential_agent::configuration::AgentOptions;
use credential_agent::health::HealthState;
use credential_agent::provider::{ProviderContext, RefreshPolicy};
use credential_agent::session::SessionTokenStore;
use credential_agent::sts::StsRoleAssumer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("[agent] init");

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        // this needs to be set to remove duplicated information in the log.
        .with_current_span(false)
        .with_ansi(false)
        .with_target(false)
        .init();

    // get configuration options from arguments or environment variables
    let options = AgentOptions::parse();

    tracing::info!("[agent] {:?}", &options);

    let assume_chain =
        parse_chain(&options.assume.join(",")).context("invalid --assume chain")?;

    let broker = HttpBrokerClient::new(BrokerSettings::from(&options))
        .context("failed to build broker client")?;
    let health = Arc::new(HealthState::new());
    let context = ProviderContext {
        broker: Arc::new(broker),
        assumer: Arc::new(
            StsRoleAssumer::default()
                .with_timeout(Duration::from_secs(options.request_timeout_secs)),
        ),
        health: health.clone(),
        policy: RefreshPolicy::from(&options),
    };
    let cache = Arc::new(CredentialCache::new(context).with_no_ip_restrict(options.no_ip_restrict));

    match &options.role {
        Some(role) => cache
            .set_default(role, &options.region, &assume_chain)
            .await
            .with_context(|| format!("failed to load default role {role}"))?,
        None => tracing::warn!("[agent] no default role; only /ecs routes will serve credentials"),
    }

    let sessions = Arc::new(SessionTokenStore::new());
    let state = Arc::new(AppState::new(options, cache, sessions, health));

    let application = Application::build(state).await?;
    application.run_until_stopped().await?;

    Ok(())
}
