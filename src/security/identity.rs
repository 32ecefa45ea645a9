// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Caller identity resolution.
//!
//! Authentication itself happens elsewhere; this module only turns the
//! opaque credential a request carries into the [`OwnerId`] whose job
//! partition it may touch.

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::download::OwnerId;
use crate::utils::mask_sensitive;

/// Turns an opaque credential into a caller identity.
pub trait IdentityResolver: Send + Sync {
    /// Returns `None` when the credential is not recognized.
    fn resolve(&self, credential: &str) -> Option<OwnerId>;
}

/// One configured credential and the identity it maps to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    pub owner_id: String,
}

/// Static bearer-token resolver built from configuration.
#[derive(Debug, Clone, Default)]
pub struct TokenResolver {
    grants: Vec<TokenGrant>,
}

impl TokenResolver {
    pub fn new(grants: Vec<TokenGrant>) -> Self {
        Self { grants }
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

impl IdentityResolver for TokenResolver {
    fn resolve(&self, credential: &str) -> Option<OwnerId> {
        if credential.is_empty() {
            return None;
        }

        // Every grant is compared; the loop never exits early.
        let mut found: Option<&TokenGrant> = None;
        for grant in &self.grants {
            let eq: bool = grant.token.as_bytes().ct_eq(credential.as_bytes()).into();
            if eq && found.is_none() {
                found = Some(grant);
            }
        }

        match found {
            Some(grant) => Some(OwnerId::new(grant.owner_id.clone())),
            None => {
                tracing::debug!(
                    credential = %mask_sensitive(credential, 4),
                    "Unrecognized credential"
                );
                None
            }
        }
    }
}

/// Extract the credential from an `Authorization: Bearer <token>` value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let (scheme, token) = header_value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
