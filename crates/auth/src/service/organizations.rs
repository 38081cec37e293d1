use chrono::Utc;

use tierguard_core::{AccessError, AccessResult, OrganizationId, RequestContext, RoleId, UserId};

use super::AccessService;
use crate::hierarchy::roles::ensure_can_bind;
use crate::organization::{
    Membership, MembershipAction, MembershipHistory, NewOrganization, Organization,
};
use crate::principal::{Principal, User};
use crate::store::{OrganizationFilter, UserFilter};

impl AccessService {
    /// Create an organization. Root holdings need platform level; anything
    /// else must be placed under an organization the actor can see.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id(), actor_id = %actor, code = %new.code))]
    pub async fn create_organization(
        &self,
        ctx: &RequestContext,
        actor: UserId,
        new: NewOrganization,
    ) -> AccessResult<Organization> {
        let principal = self.actor(ctx, actor).await?;
        new.validate()?;

        let hierarchy = self.engine.organizations();
        let parent = hierarchy
            .ensure_valid_placement(ctx, new.org_type, new.parent_id, None)
            .await?;
        match &parent {
            None if !hierarchy.sees_everything(&principal) => {
                return Err(AccessError::forbidden(
                    "root organizations require platform level",
                ));
            }
            Some(parent) => self.ensure_visible(ctx, &principal, parent.id).await?,
            None => {}
        }

        let now = Utc::now();
        let organization = Organization {
            id: OrganizationId::new(),
            name: new.name.trim().to_string(),
            code: new.code,
            org_type: new.org_type,
            parent_id: parent.map(|p| p.id),
            is_active: true,
            created_by: Some(actor),
            created_at: now,
            updated_at: now,
        };
        ctx.run(self.directory.insert_organization(&organization))
            .await??;

        tracing::info!(organization_id = %organization.id, org_type = %organization.org_type, "created organization");
        Ok(organization)
    }

    /// Re-parent an organization. Type adjacency still applies and the new
    /// parent may not be the organization itself or one of its descendants.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id(), actor_id = %actor, organization_id = %organization_id))]
    pub async fn move_organization(
        &self,
        ctx: &RequestContext,
        actor: UserId,
        organization_id: OrganizationId,
        new_parent: OrganizationId,
    ) -> AccessResult<Organization> {
        let principal = self.actor(ctx, actor).await?;
        let mut organization = self.organization(ctx, organization_id).await?;
        self.ensure_visible(ctx, &principal, organization.id).await?;

        let parent = self
            .engine
            .organizations()
            .ensure_valid_placement(
                ctx,
                organization.org_type,
                Some(new_parent),
                Some(organization.id),
            )
            .await?;
        self.ensure_visible(ctx, &principal, new_parent).await?;

        organization.parent_id = parent.map(|p| p.id);
        organization.updated_at = Utc::now();
        ctx.run(self.directory.update_organization(&organization))
            .await??;

        tracing::info!(%new_parent, "moved organization");
        Ok(organization)
    }

    /// Add `user` to an organization, optionally with an organization-scoped
    /// role. Re-adding a deactivated member reactivates the existing row.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id(), actor_id = %actor, target_id = %user, organization_id = %organization_id))]
    pub async fn add_member(
        &self,
        ctx: &RequestContext,
        actor: UserId,
        user: UserId,
        organization_id: OrganizationId,
        role_id: Option<RoleId>,
        reason: Option<String>,
    ) -> AccessResult<Membership> {
        let principal = self.actor(ctx, actor).await?;
        let organization = self.organization(ctx, organization_id).await?;
        self.ensure_visible(ctx, &principal, organization.id).await?;

        let (target, current) = self.target(ctx, user).await?;
        if !target.can_authenticate() {
            return Err(AccessError::validation("cannot add an inactive principal"));
        }
        self.roles.ensure_can_manage(&principal, user, &current)?;
        self.ensure_bindable(ctx, &principal, &organization, role_id)
            .await?;

        let previous = ctx
            .run(self.directory.membership(user, organization_id))
            .await??;
        let now = Utc::now();
        let (membership, action) = match &previous {
            Some(existing) if existing.is_active => {
                return Err(AccessError::conflict(
                    "principal is already an active member of this organization",
                ));
            }
            Some(existing) => (
                Membership {
                    role_id,
                    is_active: true,
                    updated_at: now,
                    ..existing.clone()
                },
                MembershipAction::Rejoined,
            ),
            None => (
                Membership {
                    user_id: user,
                    organization_id,
                    role_id,
                    is_active: true,
                    joined_at: now,
                    updated_at: now,
                },
                MembershipAction::Joined,
            ),
        };
        ctx.run(self.directory.upsert_membership(&membership))
            .await??;
        self.record_history(
            ctx,
            MembershipHistory::transition(action, previous.as_ref(), &membership, actor, reason),
        )
        .await;

        tracing::info!(action = action.as_str(), "membership added");
        Ok(membership)
    }

    /// Change the organization-scoped role of a member and revoke its sessions.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id(), actor_id = %actor, target_id = %user, organization_id = %organization_id))]
    pub async fn change_member_role(
        &self,
        ctx: &RequestContext,
        actor: UserId,
        user: UserId,
        organization_id: OrganizationId,
        role_id: Option<RoleId>,
        reason: Option<String>,
    ) -> AccessResult<Membership> {
        let (principal, organization, previous) = self
            .managed_membership(ctx, actor, user, organization_id)
            .await?;
        if previous.role_id == role_id {
            return Ok(previous);
        }
        self.ensure_bindable(ctx, &principal, &organization, role_id)
            .await?;

        let membership = Membership {
            role_id,
            updated_at: Utc::now(),
            ..previous.clone()
        };
        ctx.run(self.directory.upsert_membership(&membership))
            .await??;
        self.record_history(
            ctx,
            MembershipHistory::transition(
                MembershipAction::RoleChanged,
                Some(&previous),
                &membership,
                actor,
                reason,
            ),
        )
        .await;
        self.revoke_after_change(ctx, user).await;

        tracing::info!("membership role changed");
        Ok(membership)
    }

    /// Activate or deactivate a membership and revoke the member's sessions.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id(), actor_id = %actor, target_id = %user, organization_id = %organization_id, active))]
    pub async fn set_member_active(
        &self,
        ctx: &RequestContext,
        actor: UserId,
        user: UserId,
        organization_id: OrganizationId,
        active: bool,
        reason: Option<String>,
    ) -> AccessResult<Membership> {
        let (_, _, previous) = self
            .managed_membership(ctx, actor, user, organization_id)
            .await?;
        if previous.is_active == active {
            return Ok(previous);
        }

        let membership = Membership {
            is_active: active,
            updated_at: Utc::now(),
            ..previous.clone()
        };
        ctx.run(self.directory.upsert_membership(&membership))
            .await??;
        let action = if active {
            MembershipAction::Activated
        } else {
            MembershipAction::Deactivated
        };
        self.record_history(
            ctx,
            MembershipHistory::transition(action, Some(&previous), &membership, actor, reason),
        )
        .await;
        self.revoke_after_change(ctx, user).await;

        tracing::info!(action = action.as_str(), "membership status changed");
        Ok(membership)
    }

    /// Audit trail of one membership, oldest first. Members may read their own.
    pub async fn membership_history(
        &self,
        ctx: &RequestContext,
        actor: UserId,
        user: UserId,
        organization_id: OrganizationId,
    ) -> AccessResult<Vec<MembershipHistory>> {
        let principal = self.actor(ctx, actor).await?;
        if actor != user {
            self.ensure_visible(ctx, &principal, organization_id).await?;
        }
        Ok(ctx
            .run(self.directory.membership_history(user, organization_id))
            .await??)
    }

    /// Organizations visible to `actor`, narrowed by `filter`.
    pub async fn list_organizations(
        &self,
        ctx: &RequestContext,
        actor: UserId,
        mut filter: OrganizationFilter,
    ) -> AccessResult<Vec<Organization>> {
        let principal = self.actor(ctx, actor).await?;
        let accessible = self
            .engine
            .organizations()
            .accessible_organizations(ctx, &principal)
            .await?;

        filter.ids = accessible.restrict(filter.ids.take());
        if filter.ids.as_ref().is_some_and(Vec::is_empty) {
            return Ok(Vec::new());
        }
        Ok(ctx
            .run(self.directory.list_organizations(&filter))
            .await??)
    }

    /// Principals visible to `actor`: members of its visible organizations,
    /// strictly below its level, never the actor itself.
    pub async fn list_users(
        &self,
        ctx: &RequestContext,
        actor: UserId,
        mut filter: UserFilter,
    ) -> AccessResult<Vec<User>> {
        let principal = self.actor(ctx, actor).await?;
        let accessible = self
            .engine
            .organizations()
            .accessible_organizations(ctx, &principal)
            .await?;

        filter.organization_ids = accessible.restrict(filter.organization_ids.take());
        if filter.organization_ids.as_ref().is_some_and(Vec::is_empty) {
            return Ok(Vec::new());
        }
        let ceiling = principal.level();
        filter.below_level = Some(filter.below_level.map_or(ceiling, |l| l.min(ceiling)));
        filter.exclude_user = Some(actor);

        Ok(ctx.run(self.directory.list_users(&filter)).await??)
    }

    async fn organization(
        &self,
        ctx: &RequestContext,
        id: OrganizationId,
    ) -> AccessResult<Organization> {
        ctx.run(self.directory.organization_by_id(id))
            .await??
            .ok_or_else(|| AccessError::not_found(format!("organization {id}")))
    }

    async fn ensure_visible(
        &self,
        ctx: &RequestContext,
        principal: &Principal,
        organization_id: OrganizationId,
    ) -> AccessResult<()> {
        let accessible = self
            .engine
            .organizations()
            .accessible_organizations(ctx, principal)
            .await?;
        if !accessible.contains(organization_id) {
            return Err(AccessError::forbidden(format!(
                "organization {organization_id} is outside the caller's scope"
            )));
        }
        Ok(())
    }

    /// Shared checks for changing an existing membership: visible
    /// organization, existing row, and strict seniority over both the
    /// member's global role and its role in this organization.
    async fn managed_membership(
        &self,
        ctx: &RequestContext,
        actor: UserId,
        user: UserId,
        organization_id: OrganizationId,
    ) -> AccessResult<(Principal, Organization, Membership)> {
        let principal = self.actor(ctx, actor).await?;
        let organization = self.organization(ctx, organization_id).await?;
        self.ensure_visible(ctx, &principal, organization.id).await?;

        let membership = ctx
            .run(self.directory.membership(user, organization_id))
            .await??
            .ok_or_else(|| AccessError::not_found("membership"))?;

        let (_, global) = self.target(ctx, user).await?;
        self.roles.ensure_can_manage(&principal, user, &global)?;
        let scoped = self.engine.assignment(ctx, membership.role_id).await?;
        self.roles.ensure_can_manage(&principal, user, &scoped)?;

        Ok((principal, organization, membership))
    }

    /// An organization-scoped role must be active, tagged for the
    /// organization's type and strictly below the actor. The super role is
    /// global only; a membership binding would mint a second holder.
    async fn ensure_bindable(
        &self,
        ctx: &RequestContext,
        principal: &Principal,
        organization: &Organization,
        role_id: Option<RoleId>,
    ) -> AccessResult<()> {
        let Some(role_id) = role_id else {
            return Ok(());
        };
        let role = self.engine.role(ctx, role_id).await?;
        if role.is_super() {
            return Err(AccessError::validation(format!(
                "role '{}' cannot be bound to a membership",
                role.name
            )));
        }
        ensure_can_bind(principal, &role)?;
        if !role.is_active {
            return Err(AccessError::validation(format!(
                "role '{}' is inactive",
                role.name
            )));
        }
        let applicable = self
            .engine
            .validate_role_accessible_in_organization(
                ctx,
                role_id,
                organization.id,
                organization.org_type,
            )
            .await?;
        if !applicable {
            return Err(AccessError::validation(format!(
                "role '{}' does not apply to a {}",
                role.name, organization.org_type
            )));
        }
        Ok(())
    }
}
