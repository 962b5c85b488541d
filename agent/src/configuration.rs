// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::constants::{
    DEFAULT_REFRESH_THRESHOLD, DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRIES, DEFAULT_RETRY_DELAY,
};

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct AgentOptions {
    #[arg(long, default_value = "127.0.0.1", env("AGENT_HTTP_HOST"))]
    pub host: String,
    #[arg(long, default_value = "9911", env("AGENT_HTTP_PORT"))]
    pub port: u16,
    #[arg(long, default_value = "https://localhost:8443", env("AGENT_BROKER_URL"))]
    pub broker_url: String,
    #[arg(long, env("AGENT_CLIENT_CERT"))]
    pub client_cert: Option<PathBuf>,
    #[arg(long, env("AGENT_CLIENT_KEY"))]
    pub client_key: Option<PathBuf>,
    #[arg(long, env("AGENT_CA_CERT"))]
    pub ca_cert: Option<PathBuf>,
    #[arg(long, default_value = "30", env("AGENT_REQUEST_TIMEOUT_SECS"))]
    pub request_timeout_secs: u64,
    /// Role served by the instance metadata routes
    #[arg(long, env("AGENT_ROLE"))]
    pub role: Option<String>,
    #[arg(long, default_value = "us-east-1", env("AGENT_REGION"))]
    pub region: String,
    /// Comma-separated role ARNs assumed after fetching the default role
    #[arg(long, env("AGENT_ASSUME"), value_delimiter = ',')]
    pub assume: Vec<String>,
    #[arg(long, default_value = "false", env("AGENT_NO_IP_RESTRICT"), action = ArgAction::SetTrue)]
    pub no_ip_restrict: bool,
    #[arg(long, default_value = "false", env("AGENT_IMDSV2_REQUIRED"), action = ArgAction::SetTrue)]
    pub imdsv2_required: bool,
    #[arg(long, default_value = "10", env("AGENT_REFRESH_THRESHOLD_MINUTES"))]
    pub refresh_threshold_minutes: u64,
    #[arg(long, default_value = "3", env("AGENT_RETRIES"))]
    pub retries: u32,
    #[arg(long, default_value = "5", env("AGENT_RETRY_DELAY_SECS"))]
    pub retry_delay_secs: u64,
    /// Static responses, as PATH=TEXT
    #[arg(long = "custom-path", value_parser = parse_custom_path)]
    pub custom_paths: Vec<(String, String)>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        AgentOptions {
            host: "127.0.0.1".to_string(),
            port: 9911,
            broker_url: "https://localhost:8443".to_string(),
            client_cert: None,
            client_key: None,
            ca_cert: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            role: None,
            region: "us-east-1".to_string(),
            assume: Vec::new(),
            no_ip_restrict: false,
            imdsv2_required: false,
            refresh_threshold_minutes: DEFAULT_REFRESH_THRESHOLD.as_secs() / 60,
            retries: DEFAULT_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY.as_secs(),
            custom_paths: Vec::new(),
        }
    }
}

impl AgentOptions {
    /// Custom paths keyed by absolute request path.
    pub fn custom_path_map(&self) -> HashMap<String, String> {
        self.custom_paths
            .iter()
            .map(|(path, text)| (normalize_path(path), text.clone()))
            .collect()
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn parse_custom_path(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((path, text)) if !path.is_empty() => Ok((path.to_string(), text.to_string())),
        _ => Err(format!("expected PATH=TEXT, got `{value}`")),
    }
}
