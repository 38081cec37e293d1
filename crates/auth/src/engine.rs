//! Authorization engine: permission resolution, caching and
//! organization-scoped decisions.

use std::sync::Arc;

use serde::Serialize;

use tierguard_core::{AccessError, AccessResult, OrganizationId, RequestContext, RoleId, UserId};

use crate::cache::PermissionCache;
use crate::hierarchy::{AccessibleOrganizations, OrganizationHierarchy};
use crate::organization::{Membership, OrganizationType};
use crate::principal::{Principal, RoleAssignment};
use crate::roles::Role;
use crate::store::Directory;

/// Everything a client needs to render what the principal may do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionSnapshot {
    pub user_id: UserId,
    /// Global role, or the membership role when scoped to an organization.
    pub role: RoleAssignment,
    pub is_super: bool,
    pub organization_id: Option<OrganizationId>,
    pub permissions: Vec<String>,
    pub accessible_organizations: AccessibleOrganizations,
}

// ─────────────────────────────────────────────────────────────────────────────
// Decision explanation (audit trail)
// ─────────────────────────────────────────────────────────────────────────────

/// Why an organization-scoped check came out the way it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationExplanation {
    pub permission: String,
    pub organization_id: OrganizationId,
    pub granted: bool,
    pub role: RoleAssignment,
    pub denial: Option<DenialKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialKind {
    NoActiveMembership,
    NoRole,
    InactiveRole,
    MissingPermission,
}

#[derive(Clone)]
pub struct AuthorizationEngine {
    directory: Arc<dyn Directory>,
    cache: PermissionCache,
    organizations: OrganizationHierarchy,
}

impl AuthorizationEngine {
    pub fn new(
        directory: Arc<dyn Directory>,
        cache: PermissionCache,
        organizations: OrganizationHierarchy,
    ) -> Self {
        Self {
            directory,
            cache,
            organizations,
        }
    }

    pub fn organizations(&self) -> &OrganizationHierarchy {
        &self.organizations
    }

    /// Does `role_id` grant `permission`?
    ///
    /// Super roles answer `true` without touching the cache or the permission
    /// table. Inactive roles grant nothing.
    #[tracing::instrument(skip(self, ctx), fields(request_id = %ctx.request_id()))]
    pub async fn check_permission(
        &self,
        ctx: &RequestContext,
        role_id: RoleId,
        permission: &str,
    ) -> AccessResult<bool> {
        if role_id == RoleId::SUPER {
            return Ok(true);
        }
        let role = self.role(ctx, role_id).await?;
        if role.is_super() {
            return Ok(true);
        }
        if !role.is_active {
            tracing::debug!(%role_id, "inactive role grants nothing");
            return Ok(false);
        }
        let permissions = self.cached_permissions(ctx, &role).await?;
        Ok(permissions.iter().any(|p| p == permission))
    }

    /// Permission names granted by `role_id`.
    ///
    /// For the super role this is every permission currently defined, read
    /// live and never cached.
    pub async fn get_and_cache_permissions_for_role(
        &self,
        ctx: &RequestContext,
        role_id: RoleId,
    ) -> AccessResult<Vec<String>> {
        let role = self.role(ctx, role_id).await?;
        if role.is_super() {
            return self.all_permission_names(ctx).await;
        }
        self.cached_permissions(ctx, &role).await
    }

    /// Drop the cached permission set of `role_id`.
    pub async fn invalidate_role_permissions_cache(
        &self,
        ctx: &RequestContext,
        role_id: RoleId,
    ) -> AccessResult<()> {
        ctx.run(self.cache.invalidate(role_id)).await??;
        tracing::debug!(%role_id, "invalidated role permission cache");
        Ok(())
    }

    /// Decision keyed off the membership's role, never the global one.
    pub async fn check_permission_in_organization(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        organization_id: OrganizationId,
        permission: &str,
    ) -> AccessResult<bool> {
        let Some(membership) = self.active_membership(ctx, user_id, organization_id).await? else {
            return Ok(false);
        };
        match membership.role_id {
            Some(role_id) => self.check_permission(ctx, role_id, permission).await,
            None => Ok(false),
        }
    }

    pub async fn get_user_role_in_organization(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        organization_id: OrganizationId,
    ) -> AccessResult<RoleAssignment> {
        let membership = self
            .require_membership(ctx, user_id, organization_id)
            .await?;
        self.assignment(ctx, membership.role_id).await
    }

    pub async fn get_user_permissions_in_organization(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        organization_id: OrganizationId,
    ) -> AccessResult<Vec<String>> {
        let membership = self
            .require_membership(ctx, user_id, organization_id)
            .await?;
        match membership.role_id {
            Some(role_id) => self.get_and_cache_permissions_for_role(ctx, role_id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Explain a [`Self::check_permission_in_organization`] decision.
    pub async fn explain_permission_in_organization(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        organization_id: OrganizationId,
        permission: &str,
    ) -> AccessResult<AuthorizationExplanation> {
        let explanation = |role: RoleAssignment, denial: Option<DenialKind>| AuthorizationExplanation {
            permission: permission.to_string(),
            organization_id,
            granted: denial.is_none(),
            role,
            denial,
        };

        let Some(membership) = self.active_membership(ctx, user_id, organization_id).await? else {
            return Ok(explanation(RoleAssignment::NoRole, Some(DenialKind::NoActiveMembership)));
        };
        let Some(role_id) = membership.role_id else {
            return Ok(explanation(RoleAssignment::NoRole, Some(DenialKind::NoRole)));
        };
        let role = self.role(ctx, role_id).await?;
        if role.is_super() {
            return Ok(explanation(RoleAssignment::Assigned(role.to_ref()), None));
        }
        if !role.is_active {
            return Ok(explanation(
                RoleAssignment::Assigned(role.to_ref()),
                Some(DenialKind::InactiveRole),
            ));
        }
        let granted = self
            .cached_permissions(ctx, &role)
            .await?
            .iter()
            .any(|p| p == permission);
        Ok(explanation(
            RoleAssignment::Assigned(role.to_ref()),
            (!granted).then_some(DenialKind::MissingPermission),
        ))
    }

    /// Can `role_id` be bound inside `organization_id`?
    ///
    /// The organization must exist and be of `organization_type`. The super
    /// role is valid everywhere; other roles must be tagged for the type.
    pub async fn validate_role_accessible_in_organization(
        &self,
        ctx: &RequestContext,
        role_id: RoleId,
        organization_id: OrganizationId,
        organization_type: OrganizationType,
    ) -> AccessResult<bool> {
        let organization = ctx
            .run(self.directory.organization_by_id(organization_id))
            .await??
            .ok_or_else(|| AccessError::not_found(format!("organization {organization_id}")))?;
        if organization.org_type != organization_type {
            return Err(AccessError::validation(format!(
                "organization {organization_id} is a {}, not a {organization_type}",
                organization.org_type
            )));
        }
        let role = self.role(ctx, role_id).await?;
        Ok(role.applies_to(organization_type))
    }

    /// Load a principal and its global role from the store.
    pub async fn resolve_principal(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
    ) -> AccessResult<Principal> {
        let user = ctx
            .run(self.directory.user_by_id(user_id))
            .await??
            .ok_or_else(|| AccessError::not_found(format!("user {user_id}")))?;
        Ok(Principal {
            user_id,
            assignment: self.assignment(ctx, user.role_id).await?,
        })
    }

    /// Role, resolved permissions and visible organizations for `principal`,
    /// optionally scoped to one organization.
    pub async fn permission_snapshot(
        &self,
        ctx: &RequestContext,
        principal: &Principal,
        organization_id: Option<OrganizationId>,
    ) -> AccessResult<PermissionSnapshot> {
        let role = match organization_id {
            Some(org) => {
                self.get_user_role_in_organization(ctx, principal.user_id, org)
                    .await?
            }
            None => principal.assignment.clone(),
        };
        let permissions = match role.role_id() {
            Some(role_id) => self.get_and_cache_permissions_for_role(ctx, role_id).await?,
            None => Vec::new(),
        };
        let accessible_organizations = self
            .organizations
            .accessible_organizations(ctx, principal)
            .await?;

        Ok(PermissionSnapshot {
            user_id: principal.user_id,
            is_super: role.is_super(),
            role,
            organization_id,
            permissions,
            accessible_organizations,
        })
    }

    pub(crate) async fn active_membership(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        organization_id: OrganizationId,
    ) -> AccessResult<Option<Membership>> {
        let membership = ctx
            .run(self.directory.membership(user_id, organization_id))
            .await??;
        Ok(membership.filter(|m| m.is_active))
    }

    async fn require_membership(
        &self,
        ctx: &RequestContext,
        user_id: UserId,
        organization_id: OrganizationId,
    ) -> AccessResult<Membership> {
        self.active_membership(ctx, user_id, organization_id)
            .await?
            .ok_or_else(|| {
                AccessError::forbidden(format!(
                    "no active membership in organization {organization_id}"
                ))
            })
    }

    pub(crate) async fn role(&self, ctx: &RequestContext, role_id: RoleId) -> AccessResult<Role> {
        ctx.run(self.directory.role_by_id(role_id))
            .await??
            .ok_or_else(|| AccessError::not_found(format!("role {role_id}")))
    }

    pub(crate) async fn assignment(
        &self,
        ctx: &RequestContext,
        role_id: Option<RoleId>,
    ) -> AccessResult<RoleAssignment> {
        let Some(role_id) = role_id else {
            return Ok(RoleAssignment::NoRole);
        };
        match ctx.run(self.directory.role_by_id(role_id)).await?? {
            Some(role) => Ok(RoleAssignment::Assigned(role.to_ref())),
            None => {
                tracing::warn!(%role_id, "dangling role reference treated as no role");
                Ok(RoleAssignment::NoRole)
            }
        }
    }

    async fn all_permission_names(&self, ctx: &RequestContext) -> AccessResult<Vec<String>> {
        let permissions = ctx.run(self.directory.list_permissions()).await??;
        Ok(permissions.into_iter().map(|p| p.name).collect())
    }

    /// Cache first; on miss read the store and populate. Cache failures fall
    /// through to the store.
    async fn cached_permissions(&self, ctx: &RequestContext, role: &Role) -> AccessResult<Vec<String>> {
        match ctx.run(self.cache.get(role.id)).await? {
            Ok(Some(hit)) => return Ok(hit),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(role_id = %role.id, error = %err, "permission cache read failed");
            }
        }

        let permissions = ctx
            .run(self.directory.permissions_for_role(role.id))
            .await??;

        if let Err(err) = ctx.run(self.cache.set(role.id, &permissions)).await? {
            tracing::warn!(role_id = %role.id, error = %err, "permission cache write failed");
        }
        Ok(permissions)
    }
}

impl core::fmt::Debug for AuthorizationEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AuthorizationEngine")
            .field("cache", &self.cache)
            .field("organizations", &self.organizations)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::organization::Organization;
    use crate::permissions::Permission;
    use crate::principal::User;
    use crate::roles::RoleLevel;
    use crate::store::{
        CacheStore, InMemoryCacheStore, InMemoryDirectory, OrganizationRepository,
        PermissionRepository, RoleRepository, UserRepository,
    };

    struct Fixture {
        directory: Arc<InMemoryDirectory>,
        cache: Arc<InMemoryCacheStore>,
        engine: AuthorizationEngine,
    }

    fn fixture() -> Fixture {
        let directory = InMemoryDirectory::arc();
        let cache = InMemoryCacheStore::arc();
        let engine = AuthorizationEngine::new(
            directory.clone(),
            PermissionCache::new(cache.clone(), Duration::from_secs(300)),
            OrganizationHierarchy::new(directory.clone(), RoleLevel::saturating(76)),
        );
        Fixture {
            directory,
            cache,
            engine,
        }
    }

    async fn role_with(directory: &InMemoryDirectory, level: u8, perms: &[&str]) -> Role {
        let now = Utc::now();
        let role = Role {
            id: RoleId::new(),
            name: format!("role-{}", RoleId::new()),
            description: String::new(),
            level: RoleLevel::saturating(level),
            is_system: false,
            is_active: true,
            organization_types: BTreeSet::from([OrganizationType::Company]),
            created_at: now,
            updated_at: now,
        };
        directory.insert_role(&role).await.unwrap();
        let mut ids = Vec::new();
        for name in perms {
            let permission = match directory.permission_by_name(name).await.unwrap() {
                Some(p) => p,
                None => {
                    let p = Permission::new(*name, "").unwrap();
                    directory.insert_permission(&p).await.unwrap();
                    p
                }
            };
            ids.push(permission.id);
        }
        directory.replace_role_permissions(role.id, &ids).await.unwrap();
        role
    }

    async fn company(directory: &InMemoryDirectory) -> Organization {
        let now = Utc::now();
        let holding = Organization {
            id: OrganizationId::new(),
            name: "Holding".to_string(),
            code: format!("H-{}", OrganizationId::new()),
            org_type: OrganizationType::Holding,
            parent_id: None,
            is_active: true,
            created_by: None,
            created_at: now,
            updated_at: now,
        };
        directory.insert_organization(&holding).await.unwrap();
        let company = Organization {
            id: OrganizationId::new(),
            name: "Company".to_string(),
            code: format!("C-{}", OrganizationId::new()),
            org_type: OrganizationType::Company,
            parent_id: Some(holding.id),
            ..holding
        };
        directory.insert_organization(&company).await.unwrap();
        company
    }

    #[tokio::test]
    async fn cache_is_filled_on_miss_and_reused() {
        let f = fixture();
        let ctx = RequestContext::new();
        let role = role_with(&f.directory, 30, &["users:read"]).await;

        assert!(f.engine.check_permission(&ctx, role.id, "users:read").await.unwrap());
        assert!(f.cache.get(&PermissionCache::key(role.id)).await.unwrap().is_some());

        // Change the store behind the cache's back: the stale entry still answers.
        f.directory.replace_role_permissions(role.id, &[]).await.unwrap();
        assert!(f.engine.check_permission(&ctx, role.id, "users:read").await.unwrap());

        f.engine
            .invalidate_role_permissions_cache(&ctx, role.id)
            .await
            .unwrap();
        assert!(!f.engine.check_permission(&ctx, role.id, "users:read").await.unwrap());
    }

    #[tokio::test]
    async fn super_role_bypasses_and_lists_live_permissions() {
        let f = fixture();
        let ctx = RequestContext::new();
        f.directory
            .insert_role(&Role::seeded_super(Utc::now()))
            .await
            .unwrap();
        role_with(&f.directory, 20, &["a:read", "b:write"]).await;

        assert!(f.engine.check_permission(&ctx, RoleId::SUPER, "anything").await.unwrap());
        let all = f
            .engine
            .get_and_cache_permissions_for_role(&ctx, RoleId::SUPER)
            .await
            .unwrap();
        assert_eq!(all, vec!["a:read".to_string(), "b:write".to_string()]);
        assert!(f.cache.get(&PermissionCache::key(RoleId::SUPER)).await.unwrap().is_none());

        let extra = Permission::new("c:delete", "").unwrap();
        f.directory.insert_permission(&extra).await.unwrap();
        let all = f
            .engine
            .get_and_cache_permissions_for_role(&ctx, RoleId::SUPER)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn inactive_roles_grant_nothing() {
        let f = fixture();
        let ctx = RequestContext::new();
        let mut role = role_with(&f.directory, 30, &["users:read"]).await;
        role.is_active = false;
        f.directory.update_role(&role).await.unwrap();

        assert!(!f.engine.check_permission(&ctx, role.id, "users:read").await.unwrap());
    }

    #[tokio::test]
    async fn organization_checks_use_the_membership_role() {
        let f = fixture();
        let ctx = RequestContext::new();
        let global = role_with(&f.directory, 60, &["orders:approve"]).await;
        let scoped = role_with(&f.directory, 20, &["orders:read"]).await;
        let org = company(&f.directory).await;

        let mut user = User::local("member", "h").unwrap();
        user.role_id = Some(global.id);
        f.directory.insert_user(&user).await.unwrap();

        assert!(
            !f.engine
                .check_permission_in_organization(&ctx, user.id, org.id, "orders:read")
                .await
                .unwrap()
        );
        assert!(matches!(
            f.engine
                .get_user_role_in_organization(&ctx, user.id, org.id)
                .await,
            Err(AccessError::Forbidden(_))
        ));

        let now = Utc::now();
        f.directory
            .upsert_membership(&Membership {
                user_id: user.id,
                organization_id: org.id,
                role_id: Some(scoped.id),
                is_active: true,
                joined_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        assert!(
            f.engine
                .check_permission_in_organization(&ctx, user.id, org.id, "orders:read")
                .await
                .unwrap()
        );
        assert!(
            !f.engine
                .check_permission_in_organization(&ctx, user.id, org.id, "orders:approve")
                .await
                .unwrap()
        );
        assert_eq!(
            f.engine
                .get_user_permissions_in_organization(&ctx, user.id, org.id)
                .await
                .unwrap(),
            vec!["orders:read".to_string()]
        );

        let explained = f
            .engine
            .explain_permission_in_organization(&ctx, user.id, org.id, "orders:approve")
            .await
            .unwrap();
        assert!(!explained.granted);
        assert_eq!(explained.denial, Some(DenialKind::MissingPermission));
    }

    #[tokio::test]
    async fn role_accessibility_checks_type_and_tags() {
        let f = fixture();
        let ctx = RequestContext::new();
        let org = company(&f.directory).await;
        let company_role = role_with(&f.directory, 30, &[]).await;
        f.directory
            .insert_role(&Role::seeded_super(Utc::now()))
            .await
            .unwrap();

        assert!(
            f.engine
                .validate_role_accessible_in_organization(
                    &ctx,
                    company_role.id,
                    org.id,
                    OrganizationType::Company
                )
                .await
                .unwrap()
        );
        assert!(
            f.engine
                .validate_role_accessible_in_organization(
                    &ctx,
                    RoleId::SUPER,
                    org.id,
                    OrganizationType::Company
                )
                .await
                .unwrap()
        );
        assert!(matches!(
            f.engine
                .validate_role_accessible_in_organization(
                    &ctx,
                    company_role.id,
                    org.id,
                    OrganizationType::Store
                )
                .await,
            Err(AccessError::Validation(_))
        ));
        assert!(matches!(
            f.engine
                .validate_role_accessible_in_organization(
                    &ctx,
                    company_role.id,
                    OrganizationId::new(),
                    OrganizationType::Company
                )
                .await,
            Err(AccessError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let f = fixture();
        let role = role_with(&f.directory, 30, &["users:read"]).await;
        let ctx = RequestContext::new();
        ctx.cancel();

        assert_eq!(
            f.engine.check_permission(&ctx, role.id, "users:read").await,
            Err(AccessError::Cancelled)
        );
    }
}
