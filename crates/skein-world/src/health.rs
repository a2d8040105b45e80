// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Aggregate health reporting.
//!
//! The HTTP health surface lives outside this crate; it calls
//! [`check`] (via [`World::health`](crate::world::World::health)) and
//! serializes the report.

use std::sync::Arc;

use serde::Serialize;

use crate::adapter::DbAdapter;
use crate::auth::{AuthContext, AuthProvider};
use crate::storage::{ListRunsParams, Storage};

/// Aggregate health of the world's collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// True when every probe below passed.
    pub healthy: bool,
    /// Database round trip (`SELECT 1`).
    pub database: bool,
    /// Storage read path (a limit-1 run listing).
    pub storage: bool,
    /// Which back-end the world is running on.
    pub backend: String,
    /// The identity the world operates under.
    pub tenant: AuthContext,
}

/// Probe the adapter, the storage read path and the identity provider.
/// Never errors; failures show up as `healthy: false`.
pub async fn check(
    adapter: &DbAdapter,
    storage: &Arc<dyn Storage>,
    auth: &Arc<dyn AuthProvider>,
) -> HealthReport {
    let database = adapter.is_healthy().await;

    let storage_ok = storage
        .list_runs(ListRunsParams {
            limit: 1,
            ..Default::default()
        })
        .await
        .is_ok();

    let (tenant, tenant_ok) = match auth.resolve().await {
        Ok(context) => (context, true),
        Err(_) => (AuthContext::default(), false),
    };

    HealthReport {
        healthy: database && storage_ok && tenant_ok,
        database,
        storage: storage_ok,
        backend: adapter.kind().to_string(),
        tenant,
    }
}
