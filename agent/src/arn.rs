// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Amazon Resource Name parsing.
//!
//! Only syntax is checked: `arn:<partition>:<service>:<region>:<account>:<resource>`
//! with a known partition, a non-empty service and resource, and an account that
//! is either empty or exactly twelve digits.

use std::fmt;

use crate::errors::CredentialError;

const PARTITIONS: [&str; 8] = [
    "aws",
    "aws-cn",
    "aws-us-gov",
    "aws-iso",
    "aws-iso-b",
    "aws-iso-e",
    "aws-iso-f",
    "aws-eusc",
];

const ACCOUNT_ID_LENGTH: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arn {
    pub partition: String,
    pub service: String,
    pub region: String,
    pub account_id: String,
    pub resource: String,
}

impl Arn {
    /// Parses and validates an ARN.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::MalformedArn`] naming the offending input.
    pub fn parse(input: &str) -> Result<Self, CredentialError> {
        let malformed = || CredentialError::MalformedArn(input.to_string());

        let mut sections = input.splitn(6, ':');
        let mut next = || sections.next().ok_or_else(malformed);

        if next()? != "arn" {
            return Err(malformed());
        }
        let partition = next()?;
        let service = next()?;
        let region = next()?;
        let account_id = next()?;
        let resource = next()?;

        if !PARTITIONS.contains(&partition) {
            return Err(malformed());
        }
        if service.is_empty()
            || !service
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(malformed());
        }
        if !region
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(malformed());
        }
        if !account_id.is_empty()
            && (account_id.len() != ACCOUNT_ID_LENGTH
                || !account_id.chars().all(|c| c.is_ascii_digit()))
        {
            return Err(malformed());
        }
        if resource.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            partition: partition.to_string(),
            service: service.to_string(),
            region: region.to_string(),
            account_id: account_id.to_string(),
            resource: resource.to_string(),
        })
    }

    /// The resource type, e.g. `role` for `role/path/Name`.
    pub fn resource_type(&self) -> &str {
        self.resource
            .split_once(['/', ':'])
            .map_or(self.resource.as_str(), |(kind, _)| kind)
    }

    /// The final path element of the resource, e.g. `Name` for `role/path/Name`.
    pub fn short_name(&self) -> &str {
        self.resource
            .rsplit(['/', ':'])
            .next()
            .unwrap_or(self.resource.as_str())
    }

    /// Returns the same ARN with its resource type replaced by `instance-profile`.
    pub fn to_instance_profile(&self) -> Self {
        let rest = &self.resource[self.resource_type().len()..];
        Self {
            resource: format!("instance-profile{rest}"),
            ..self.clone()
        }
    }
}

impl fmt::Display for Arn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "arn:{}:{}:{}:{}:{}",
            self.partition, self.service, self.region, self.account_id, self.resource
        )
    }
}

/// Splits a comma-separated list of ARNs, validating each one.
///
/// Blank elements are skipped, so an empty string yields an empty chain.
pub fn parse_chain(input: &str) -> Result<Vec<String>, CredentialError> {
    input
        .split(',')
        .map(str::trim)
        .filter(|arn| !arn.is_empty())
        .map(|arn| Arn::parse(arn).map(|_| arn.to_string()))
        .collect()
}
