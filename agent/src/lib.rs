// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! # Credential Agent
//!
//! A local credential broker for workloads running outside AWS.
//!
//! The agent authenticates to a remote credential broker with a client
//! certificate, caches the short-lived AWS credentials it gets back, keeps them
//! fresh in the background, and serves them over HTTP in the formats the AWS
//! SDKs already understand.
//!
//! ## Architecture
//!
//! ```text
//! SDK -> HTTP (IMDS / ECS shape) -> Credential Cache -> Provider -> Broker (mTLS)
//!                                                           |
//!                                                           +-> STS AssumeRole (chain)
//! ```
//!
//! - **Instance metadata routes** (`/{version}/meta-data/...`): serve a single
//!   default role, with optional IMDSv2 session tokens
//! - **Container route** (`/ecs/{role}?assume=...`): any role, created on demand
//! - **Refresh engine**: one background task per cached role, refreshing shortly
//!   before expiry and retrying on stale client certificates
//!
//! ## Modules
//!
//! - [`application`]: HTTP server setup and graceful shutdown
//! - [`arn`]: ARN parsing for assume-role chains
//! - [`broker`]: mTLS client for the remote credential broker
//! - [`cache`]: slug-keyed cache of refreshable providers
//! - [`configuration`]: CLI argument parsing with clap
//! - [`constants`]: timing defaults, header names and placeholder metadata
//! - [`errors`]: error types with HTTP response mapping
//! - [`health`]: health flag flipped by broker authentication failures
//! - [`middleware`]: session token check, browser filtering, response headers
//! - [`models`]: credential type and wire documents
//! - [`provider`]: a single role's credentials and its refresh task
//! - [`routes`]: HTTP route handlers
//! - [`session`]: IMDSv2 session token store
//! - [`slug`]: cache keys for role plus assume chain
//! - [`sts`]: assume-role hops through STS
//!
//! ## Usage
//!
//! ```bash
//! credential-agent --broker-url https://broker.internal:8443 \
//!     --client-cert host.crt --client-key host.key --ca-cert ca.crt \
//!     --role developer --imdsv2-required
//! ```
//!
//! ## Security Considerations
//!
//! - Credentials are zeroized on drop and redacted from `Debug` output
//! - Requests carrying browser headers or a foreign `Host` are refused
//! - Only bind to a loopback address; the server has no authentication of its own

pub mod application;
pub mod arn;
pub mod broker;
pub mod cache;
pub mod configuration;
pub mod constants;
pub mod errors;
pub mod health;
pub mod middleware;
pub mod models;
pub mod provider;
pub mod routes;
pub mod session;
pub mod slug;
pub mod sts;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
