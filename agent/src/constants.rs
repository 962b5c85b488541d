// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::time::Duration;

pub const REFRESH_TICK_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_REFRESH_THRESHOLD: Duration = Duration::from_secs(10 * 60); // refresh 10 minutes before expiry
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// Session tokens
pub const TOKEN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const TOKEN_LENGTH: usize = 64;
pub const TOKEN_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
/// The real metadata service accepts TTLs between one second and six hours.
pub const MAX_TOKEN_TTL_SECONDS: u64 = 21_600;

// Protocol headers
pub const TOKEN_HEADER: &str = "x-aws-ec2-metadata-token";
pub const TOKEN_TTL_HEADER: &str = "x-aws-ec2-metadata-token-ttl-seconds";
pub const SERVER_HEADER_VALUE: &str = "EC2ws";
pub const PLAINTEXT_CONTENT_TYPE: &str = "text/plain";

// Browser filtering
pub const ALLOWED_HOSTS: [&str; 3] = ["localhost", "127.0.0.1", "169.254.169.254"];
pub const DENIED_HEADERS: [&str; 4] = ["referer", "referrer", "origin", "x-forwarded-for"];
pub const BROWSER_USER_AGENT_MARKER: &str = "mozilla";

// Document placeholders for fields that only exist on a real instance
pub const INSTANCE_PROFILE_ID: &str = "AIPAXXXXXXXXXXXXXXXXX";
pub const INSTANCE_ID: &str = "i-0123456789abcdef0";
pub const IMAGE_ID: &str = "ami-0123456789abcdef0";
pub const INSTANCE_TYPE: &str = "t3.micro";
pub const ARCHITECTURE: &str = "x86_64";
pub const PRIVATE_IP: &str = "127.0.0.1";
pub const IDENTITY_DOCUMENT_VERSION: &str = "2017-09-30";

pub const CREDENTIAL_TYPE: &str = "AWS-HMAC";
pub const SUCCESS_CODE: &str = "Success";
pub const ASSUME_ROLE_SESSION_NAME: &str = "credential-agent";
pub const BROKER_CREDENTIALS_PATH: &str = "/v1/credentials";

pub const ROOT_LISTING: &str = "dynamic\nmeta-data";
pub const META_DATA_LISTING: &str = "ami-id\nhostname\niam/\ninstance-id\ninstance-type\nlocal-hostname\nlocal-ipv4\nplacement/\nreservation-id\nsecurity-groups";
