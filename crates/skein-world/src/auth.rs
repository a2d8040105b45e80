// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tenant identity for the world.
//!
//! Authentication itself is an external collaborator; the world only needs
//! the resolved identity so hook registrations and health reports can carry
//! it. [`StaticAuthProvider`] is the construction-time implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Resolved tenant identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    /// Deployment environment, e.g. "production".
    pub environment: String,
    /// Owning account identifier.
    pub owner_id: String,
    /// Project identifier.
    pub project_id: String,
}

/// Resolves the tenant identity the world operates under.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Resolve the current identity.
    async fn resolve(&self) -> Result<AuthContext>;
}

/// Provider with a fixed identity supplied at construction.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthProvider {
    context: AuthContext,
}

impl StaticAuthProvider {
    /// Create a provider that always resolves to `context`.
    pub fn new(context: AuthContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn resolve(&self) -> Result<AuthContext> {
        Ok(self.context.clone())
    }
}
