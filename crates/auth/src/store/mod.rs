//! Collaborator boundaries: relational directory and key/value cache store.
//!
//! The engine only ever talks to these traits. `in_memory` provides adapters
//! for tests/dev; persistent adapters live in `tierguard-infra`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tierguard_core::{AccessError, OrganizationId, PermissionId, RoleId, UserId};

use crate::organization::{Membership, MembershipHistory, Organization, OrganizationType};
use crate::permissions::Permission;
use crate::principal::User;
use crate::roles::{Role, RoleLevel};

pub mod in_memory;

pub use in_memory::{InMemoryCacheStore, InMemoryDirectory};

/// Store operation error (infrastructure-level).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A unique constraint rejected the write.
    #[error("duplicate {0}")]
    Duplicate(String),

    /// A referenced row does not exist.
    #[error("{0} not found")]
    Missing(String),

    /// A stored value could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Connection, protocol or query failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for AccessError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(what) => AccessError::conflict(format!("{what} already exists")),
            StoreError::Missing(what) => AccessError::not_found(what),
            StoreError::Corrupt(detail) | StoreError::Backend(detail) => {
                tracing::error!(error = %detail, "store failure");
                AccessError::internal(detail)
            }
        }
    }
}

/// Page window for listing queries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Principal listing filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserFilter {
    /// Restrict to principals with an active membership in one of these
    /// organizations. `None` means unrestricted.
    pub organization_ids: Option<Vec<OrganizationId>>,
    /// Restrict to principals whose global role level is strictly below this.
    /// Principals without a role rank at level zero.
    pub below_level: Option<RoleLevel>,
    pub exclude_user: Option<UserId>,
    pub include_inactive: bool,
    pub pagination: Pagination,
}

/// Organization listing filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrganizationFilter {
    /// `None` means unrestricted.
    pub ids: Option<Vec<OrganizationId>>,
    pub org_type: Option<OrganizationType>,
    pub parent_id: Option<OrganizationId>,
    pub include_inactive: bool,
    pub pagination: Pagination,
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn user_by_id(&self, id: UserId) -> StoreResult<Option<User>>;

    async fn user_by_username(&self, username: &str) -> StoreResult<Option<User>>;

    async fn user_by_external_identity(
        &self,
        provider: &str,
        subject: &str,
    ) -> StoreResult<Option<User>>;

    /// Fails with `Duplicate` on a taken username or external identity.
    async fn insert_user(&self, user: &User) -> StoreResult<()>;

    async fn update_user(&self, user: &User) -> StoreResult<()>;

    /// Active, non-deleted principals whose global role is at or above `level`.
    async fn holders_at_or_above(&self, level: RoleLevel) -> StoreResult<Vec<UserId>>;

    /// Ordered by username.
    async fn list_users(&self, filter: &UserFilter) -> StoreResult<Vec<User>>;
}

#[async_trait]
pub trait RoleRepository: Send + Sync {
    async fn role_by_id(&self, id: RoleId) -> StoreResult<Option<Role>>;

    async fn role_by_name(&self, name: &str) -> StoreResult<Option<Role>>;

    async fn insert_role(&self, role: &Role) -> StoreResult<()>;

    async fn update_role(&self, role: &Role) -> StoreResult<()>;

    /// Returns whether a row was removed.
    async fn delete_role(&self, id: RoleId) -> StoreResult<bool>;

    /// Principals plus memberships currently bound to the role.
    async fn role_reference_count(&self, id: RoleId) -> StoreResult<u64>;

    /// Permission names attached to the role, ordered by name.
    async fn permissions_for_role(&self, id: RoleId) -> StoreResult<Vec<String>>;

    /// Clear and re-insert the role's associations as one atomic unit.
    async fn replace_role_permissions(
        &self,
        id: RoleId,
        permissions: &[PermissionId],
    ) -> StoreResult<()>;
}

#[async_trait]
pub trait PermissionRepository: Send + Sync {
    async fn permission_by_name(&self, name: &str) -> StoreResult<Option<Permission>>;

    /// Ordered by name.
    async fn list_permissions(&self) -> StoreResult<Vec<Permission>>;

    async fn insert_permission(&self, permission: &Permission) -> StoreResult<()>;

    /// Returns whether a row was removed.
    async fn delete_permission(&self, id: PermissionId) -> StoreResult<bool>;

    /// Roles currently referencing the permission.
    async fn permission_reference_count(&self, id: PermissionId) -> StoreResult<u64>;
}

#[async_trait]
pub trait OrganizationRepository: Send + Sync {
    async fn organization_by_id(&self, id: OrganizationId) -> StoreResult<Option<Organization>>;

    async fn insert_organization(&self, organization: &Organization) -> StoreResult<()>;

    async fn update_organization(&self, organization: &Organization) -> StoreResult<()>;

    async fn child_organizations(&self, parent: OrganizationId) -> StoreResult<Vec<Organization>>;

    /// Ordered by code.
    async fn list_organizations(&self, filter: &OrganizationFilter) -> StoreResult<Vec<Organization>>;

    async fn membership(
        &self,
        user: UserId,
        organization: OrganizationId,
    ) -> StoreResult<Option<Membership>>;

    async fn memberships_for_user(&self, user: UserId) -> StoreResult<Vec<Membership>>;

    /// Insert or replace the single row for `(user, organization)`.
    async fn upsert_membership(&self, membership: &Membership) -> StoreResult<()>;

    async fn append_membership_history(&self, record: &MembershipHistory) -> StoreResult<()>;

    /// Oldest first.
    async fn membership_history(
        &self,
        user: UserId,
        organization: OrganizationId,
    ) -> StoreResult<Vec<MembershipHistory>>;
}

/// The full relational store.
pub trait Directory:
    UserRepository + RoleRepository + PermissionRepository + OrganizationRepository
{
}

impl<T> Directory for T where
    T: UserRepository + RoleRepository + PermissionRepository + OrganizationRepository
{
}

/// String key/value store with TTL.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Returns `true` only when this call removed a live key.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Keys matching a glob pattern (`*` and `?`).
    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Add `member` to the set at `key` and reset the set's TTL.
    async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> StoreResult<()>;

    async fn remove_from_set(&self, key: &str, member: &str) -> StoreResult<()>;

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;
}
