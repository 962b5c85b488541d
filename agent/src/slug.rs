// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Cache keys for role credentials.
//!
//! A slug joins the role with every ARN of its assume-chain using `/`. Order
//! matters and nothing is escaped, so a role literally named `a/b` collides
//! with role `a` assuming `b`.

pub const SEPARATOR: &str = "/";

/// Returns the cache key for `role` followed by `chain`.
pub fn slug<S: AsRef<str>>(role: &str, chain: &[S]) -> String {
    std::iter::once(role)
        .chain(chain.iter().map(AsRef::as_ref))
        .collect::<Vec<&str>>()
        .join(SEPARATOR)
}
