// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::fmt;

use aws_credential_types::Credentials;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::constants::{
    ARCHITECTURE, CREDENTIAL_TYPE, IDENTITY_DOCUMENT_VERSION, IMAGE_ID, INSTANCE_ID,
    INSTANCE_PROFILE_ID, INSTANCE_TYPE, PRIVATE_IP, SUCCESS_CODE,
};

/// Formats an instant the way metadata clients parse it: `YYYY-MM-DDTHH:MM:SSZ`.
pub fn format_timestamp(instant: &DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// A set of temporary role credentials.
///
/// A fresh fetch produces a new value that replaces the old one as a whole;
/// the fields are never updated in place.
#[derive(Clone, Default, ZeroizeOnDrop)]
pub struct Credential {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    #[zeroize(skip)]
    pub expiration: DateTime<Utc>,
    #[zeroize(skip)]
    pub role_arn: String,
}

// Custom Debug implementation to prevent accidental logging of sensitive data
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_key_id", &"[REDACTED]")
            .field("secret_access_key", &"[REDACTED]")
            .field("session_token", &"[REDACTED]")
            .field("expiration", &self.expiration)
            .field("role_arn", &self.role_arn)
            .finish()
    }
}

impl From<&Credential> for Credentials {
    fn from(credential: &Credential) -> Self {
        Credentials::new(
            credential.access_key_id.clone(),
            credential.secret_access_key.clone(),
            Some(credential.session_token.clone()),
            Some(credential.expiration.into()),
            "credential-agent",
        )
    }
}

/// Credentials as returned by the broker.
#[derive(Deserialize)]
pub struct BrokerCredentials {
    #[serde(rename = "AccessKeyId")]
    pub access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    pub secret_access_key: String,
    #[serde(rename = "SessionToken")]
    pub session_token: String,
    #[serde(rename = "Expiration")]
    pub expiration: DateTime<Utc>,
    #[serde(rename = "RoleArn")]
    pub role_arn: String,
}

impl From<BrokerCredentials> for Credential {
    fn from(response: BrokerCredentials) -> Self {
        Self {
            access_key_id: response.access_key_id,
            secret_access_key: response.secret_access_key,
            session_token: response.session_token,
            expiration: response.expiration,
            role_arn: response.role_arn,
        }
    }
}

/// Error body returned by the broker.
#[derive(Debug, Default, Deserialize)]
pub struct BrokerErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// `GET /{version}/meta-data/iam/security-credentials/{role}`
#[derive(Debug, Serialize)]
pub struct ImdsCredentialDocument {
    #[serde(rename = "Code")]
    pub code: &'static str,
    #[serde(rename = "LastUpdated")]
    pub last_updated: String,
    #[serde(rename = "Type")]
    pub credential_type: &'static str,
    #[serde(rename = "AccessKeyId")]
    pub access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    pub secret_access_key: String,
    #[serde(rename = "Token")]
    pub token: String,
    #[serde(rename = "Expiration")]
    pub expiration: String,
}

impl ImdsCredentialDocument {
    pub fn new(credential: &Credential, last_updated: &DateTime<Utc>) -> Self {
        Self {
            code: SUCCESS_CODE,
            last_updated: format_timestamp(last_updated),
            credential_type: CREDENTIAL_TYPE,
            access_key_id: credential.access_key_id.clone(),
            secret_access_key: credential.secret_access_key.clone(),
            token: credential.session_token.clone(),
            expiration: format_timestamp(&credential.expiration),
        }
    }
}

/// `GET /ecs/{role}`; container credential endpoints carry no `Code`, `Type` or `LastUpdated`.
#[derive(Debug, Serialize)]
pub struct EcsCredentialDocument {
    #[serde(rename = "AccessKeyId")]
    pub access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    pub secret_access_key: String,
    #[serde(rename = "Token")]
    pub token: String,
    #[serde(rename = "Expiration")]
    pub expiration: String,
    #[serde(rename = "RoleArn")]
    pub role_arn: String,
}

impl From<&Credential> for EcsCredentialDocument {
    fn from(credential: &Credential) -> Self {
        Self {
            access_key_id: credential.access_key_id.clone(),
            secret_access_key: credential.secret_access_key.clone(),
            token: credential.session_token.clone(),
            expiration: format_timestamp(&credential.expiration),
            role_arn: credential.role_arn.clone(),
        }
    }
}

/// `GET /{version}/meta-data/iam/info`
#[derive(Debug, Serialize)]
pub struct IamInfo {
    #[serde(rename = "Code")]
    pub code: &'static str,
    #[serde(rename = "LastUpdated")]
    pub last_updated: String,
    #[serde(rename = "InstanceProfileARN")]
    pub instance_profile_arn: String,
    #[serde(rename = "InstanceProfileID")]
    pub instance_profile_id: &'static str,
}

impl IamInfo {
    pub fn new(instance_profile_arn: String, last_updated: &DateTime<Utc>) -> Self {
        Self {
            code: SUCCESS_CODE,
            last_updated: format_timestamp(last_updated),
            instance_profile_arn,
            instance_profile_id: INSTANCE_PROFILE_ID,
        }
    }
}

/// `GET /{version}/dynamic/instance-identity/document`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceIdentityDocument {
    pub account_id: String,
    pub architecture: &'static str,
    pub availability_zone: String,
    pub billing_products: Option<Vec<String>>,
    pub devpay_product_codes: Option<Vec<String>>,
    pub marketplace_product_codes: Option<Vec<String>>,
    pub image_id: &'static str,
    pub instance_id: &'static str,
    pub instance_type: &'static str,
    pub kernel_id: Option<String>,
    pub pending_time: String,
    pub private_ip: &'static str,
    pub ramdisk_id: Option<String>,
    pub region: String,
    pub version: &'static str,
}

impl InstanceIdentityDocument {
    pub fn new(account_id: String, region: String, pending_time: &DateTime<Utc>) -> Self {
        Self {
            account_id,
            architecture: ARCHITECTURE,
            availability_zone: format!("{region}a"),
            billing_products: None,
            devpay_product_codes: None,
            marketplace_product_codes: None,
            image_id: IMAGE_ID,
            instance_id: INSTANCE_ID,
            instance_type: INSTANCE_TYPE,
            kernel_id: None,
            pending_time: format_timestamp(pending_time),
            private_ip: PRIVATE_IP,
            ramdisk_id: None,
            region,
            version: IDENTITY_DOCUMENT_VERSION,
        }
    }
}
