//! Role → resolved permission names, held in the shared cache store.

use std::sync::Arc;
use std::time::Duration;

use tierguard_core::RoleId;

use crate::store::{CacheStore, StoreError, StoreResult};

#[derive(Clone)]
pub struct PermissionCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl PermissionCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn key(role: RoleId) -> String {
        format!("role_permissions:{role}")
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, role: RoleId) -> StoreResult<Option<Vec<String>>> {
        let Some(raw) = self.store.get(&Self::key(role)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::Corrupt(format!("cached permissions for role {role}: {e}")))
    }

    pub async fn set(&self, role: RoleId, permissions: &[String]) -> StoreResult<()> {
        let raw = serde_json::to_string(permissions)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.store.set_with_ttl(&Self::key(role), &raw, self.ttl).await
    }

    pub async fn invalidate(&self, role: RoleId) -> StoreResult<()> {
        self.store.delete(&Self::key(role)).await.map(|_| ())
    }
}

impl core::fmt::Debug for PermissionCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PermissionCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
