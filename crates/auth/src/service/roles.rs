use std::collections::BTreeMap;

use chrono::Utc;

use tierguard_core::{AccessError, AccessResult, RequestContext, RoleId, UserId};

use super::AccessService;
use crate::principal::User;
use crate::roles::{NewRole, Role, RoleUpdate};

impl AccessService {
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id(), actor_id = %actor, role = %new.name))]
    pub async fn create_role(
        &self,
        ctx: &RequestContext,
        actor: UserId,
        new: NewRole,
    ) -> AccessResult<Role> {
        let principal = self.actor(ctx, actor).await?;
        let level = self.roles.ensure_can_create(&principal, &new)?;

        let name = new.name.trim().to_string();
        if ctx.run(self.directory.role_by_name(&name)).await??.is_some() {
            return Err(AccessError::conflict(format!("role '{name}' already exists")));
        }

        let now = Utc::now();
        let role = Role {
            id: RoleId::new(),
            name,
            description: new.description,
            level,
            is_system: false,
            is_active: true,
            organization_types: new.organization_types,
            created_at: now,
            updated_at: now,
        };
        ctx.run(self.directory.insert_role(&role)).await??;

        tracing::info!(role_id = %role.id, level = %role.level, "created role");
        Ok(role)
    }

    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id(), actor_id = %actor, role_id = %role_id))]
    pub async fn update_role(
        &self,
        ctx: &RequestContext,
        actor: UserId,
        role_id: RoleId,
        update: RoleUpdate,
    ) -> AccessResult<Role> {
        let principal = self.actor(ctx, actor).await?;
        let mut role = self.engine.role(ctx, role_id).await?;
        self.roles.ensure_can_modify(&principal, &role, &update)?;

        let deactivated = role.is_active && update.is_active == Some(false);
        if let Some(name) = update.name {
            role.name = name.trim().to_string();
        }
        if let Some(description) = update.description {
            role.description = description;
        }
        if let Some(level) = update.level {
            role.level = level.try_into()?;
        }
        if let Some(is_active) = update.is_active {
            role.is_active = is_active;
        }
        if let Some(types) = update.organization_types {
            role.organization_types = types;
        }
        role.updated_at = Utc::now();
        ctx.run(self.directory.update_role(&role)).await??;

        if deactivated {
            self.invalidate_after_change(ctx, role.id).await;
        }
        tracing::info!(role_id = %role.id, "updated role");
        Ok(role)
    }

    /// Delete a custom role nobody references any more.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id(), actor_id = %actor, role_id = %role_id))]
    pub async fn delete_role(
        &self,
        ctx: &RequestContext,
        actor: UserId,
        role_id: RoleId,
    ) -> AccessResult<()> {
        let principal = self.actor(ctx, actor).await?;
        let role = self.engine.role(ctx, role_id).await?;
        self.roles.ensure_can_delete(&principal, &role)?;

        let references = ctx.run(self.directory.role_reference_count(role_id)).await??;
        if references > 0 {
            return Err(AccessError::conflict(format!(
                "role '{}' is still assigned {references} time(s)",
                role.name
            )));
        }
        if !ctx.run(self.directory.delete_role(role_id)).await?? {
            return Err(AccessError::not_found(format!("role {role_id}")));
        }

        self.invalidate_after_change(ctx, role_id).await;
        tracing::info!(%role_id, "deleted role");
        Ok(())
    }

    /// Replace the permission set of a role, then invalidate its cache entry.
    /// Returns the new set ordered by name.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id(), actor_id = %actor, role_id = %role_id))]
    pub async fn set_role_permissions(
        &self,
        ctx: &RequestContext,
        actor: UserId,
        role_id: RoleId,
        permissions: &[String],
    ) -> AccessResult<Vec<String>> {
        let principal = self.actor(ctx, actor).await?;
        let role = self.engine.role(ctx, role_id).await?;
        self.roles.ensure_can_grant(&principal, &role)?;

        let mut resolved = BTreeMap::new();
        for name in permissions {
            let permission = ctx
                .run(self.directory.permission_by_name(name))
                .await??
                .ok_or_else(|| AccessError::not_found(format!("permission '{name}'")))?;
            resolved.insert(permission.name, permission.id);
        }
        let ids: Vec<_> = resolved.values().copied().collect();

        ctx.run(self.directory.replace_role_permissions(role_id, &ids))
            .await??;
        self.invalidate_after_change(ctx, role_id).await;

        tracing::info!(%role_id, count = ids.len(), "replaced role permissions");
        Ok(resolved.into_keys().collect())
    }

    /// Bind a global role to `target` and revoke the target's sessions.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id(), actor_id = %actor, target_id = %target, role_id = %role_id))]
    pub async fn assign_user_role(
        &self,
        ctx: &RequestContext,
        actor: UserId,
        target: UserId,
        role_id: RoleId,
    ) -> AccessResult<User> {
        let principal = self.actor(ctx, actor).await?;
        let (mut user, current) = self.target(ctx, target).await?;
        let role = self.engine.role(ctx, role_id).await?;

        self.roles
            .ensure_can_assign(&principal, target, &current, &role)?;
        if role.level.is_super() || role.is_super() {
            self.roles.ensure_super_available(ctx, target).await?;
        }
        if !role.is_active {
            return Err(AccessError::validation(format!(
                "role '{}' is inactive",
                role.name
            )));
        }

        user.role_id = Some(role.id);
        user.updated_at = Utc::now();
        ctx.run(self.directory.update_user(&user)).await??;
        self.revoke_after_change(ctx, target).await;

        tracing::info!(%target, %role_id, "assigned global role");
        Ok(user)
    }

    /// Strip `target`'s global role and revoke its sessions.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id(), actor_id = %actor, target_id = %target))]
    pub async fn remove_user_role(
        &self,
        ctx: &RequestContext,
        actor: UserId,
        target: UserId,
    ) -> AccessResult<User> {
        let principal = self.actor(ctx, actor).await?;
        let (mut user, current) = self.target(ctx, target).await?;
        self.roles.ensure_can_revoke(&principal, target, &current)?;

        if user.role_id.take().is_none() {
            return Ok(user);
        }
        user.updated_at = Utc::now();
        ctx.run(self.directory.update_user(&user)).await??;
        self.revoke_after_change(ctx, target).await;

        tracing::info!(%target, "removed global role");
        Ok(user)
    }

    /// Soft-delete `target` and revoke its sessions.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id(), actor_id = %actor, target_id = %target))]
    pub async fn deactivate_user(
        &self,
        ctx: &RequestContext,
        actor: UserId,
        target: UserId,
    ) -> AccessResult<User> {
        let principal = self.actor(ctx, actor).await?;
        let (mut user, current) = self.target(ctx, target).await?;
        self.roles.ensure_can_manage(&principal, target, &current)?;

        let now = Utc::now();
        user.is_active = false;
        user.deleted_at.get_or_insert(now);
        user.updated_at = now;
        ctx.run(self.directory.update_user(&user)).await??;
        self.revoke_after_change(ctx, target).await;

        tracing::info!(%target, "deactivated principal");
        Ok(user)
    }

    /// The association change has committed; a stale cache entry expires on
    /// its own within the cache TTL.
    async fn invalidate_after_change(&self, ctx: &RequestContext, role_id: RoleId) {
        if let Err(err) = self
            .engine
            .invalidate_role_permissions_cache(ctx, role_id)
            .await
        {
            tracing::error!(%role_id, error = %err, "permission cache invalidation failed");
        }
    }
}
