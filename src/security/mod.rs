// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Security helpers: caller identity and poison-recovering locks.
//!
//! ## Usage
//!
//! ```no_run
//! use tapedeck::security::{IdentityResolver, TokenGrant, TokenResolver};
//!
//! let resolver = TokenResolver::new(vec![TokenGrant {
//!     token: "s3cret".to_string(),
//!     owner_id: "42".to_string(),
//! }]);
//!
//! let owner = resolver.resolve("s3cret");
//! assert_eq!(owner.map(|o| o.to_string()), Some("42".to_string()));
//! ```

pub mod identity;
pub mod locks;

pub use identity::{bearer_token, IdentityResolver, TokenGrant, TokenResolver};
pub use locks::{resilient_lock, resilient_read, resilient_write};
