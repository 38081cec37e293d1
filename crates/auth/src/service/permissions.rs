use tierguard_core::{AccessError, AccessResult, RequestContext, UserId};

use super::AccessService;
use crate::permissions::Permission;

impl AccessService {
    /// Ordered by name. Any authenticated principal may read the catalogue.
    pub async fn list_permissions(
        &self,
        ctx: &RequestContext,
        actor: UserId,
    ) -> AccessResult<Vec<Permission>> {
        self.actor(ctx, actor).await?;
        Ok(ctx.run(self.directory.list_permissions()).await??)
    }

    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id(), actor_id = %actor, permission = %name))]
    pub async fn create_permission(
        &self,
        ctx: &RequestContext,
        actor: UserId,
        name: &str,
        description: &str,
    ) -> AccessResult<Permission> {
        self.require_super(ctx, actor).await?;
        let permission = Permission::new(name, description)?;
        ctx.run(self.directory.insert_permission(&permission))
            .await??;

        tracing::info!(permission_id = %permission.id, "created permission");
        Ok(permission)
    }

    /// Refused with `Conflict` while any role still references it.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id(), actor_id = %actor, permission = %name))]
    pub async fn delete_permission(
        &self,
        ctx: &RequestContext,
        actor: UserId,
        name: &str,
    ) -> AccessResult<()> {
        self.require_super(ctx, actor).await?;
        let permission = ctx
            .run(self.directory.permission_by_name(name))
            .await??
            .ok_or_else(|| AccessError::not_found(format!("permission '{name}'")))?;

        let references = ctx
            .run(self.directory.permission_reference_count(permission.id))
            .await??;
        if references > 0 {
            return Err(AccessError::conflict(format!(
                "permission '{name}' is still granted to {references} role(s)"
            )));
        }
        if !ctx
            .run(self.directory.delete_permission(permission.id))
            .await??
        {
            return Err(AccessError::not_found(format!("permission '{name}'")));
        }

        tracing::info!(permission_id = %permission.id, "deleted permission");
        Ok(())
    }

    async fn require_super(&self, ctx: &RequestContext, actor: UserId) -> AccessResult<()> {
        let principal = self.actor(ctx, actor).await?;
        if !principal.is_super() {
            return Err(AccessError::forbidden(
                "only a super holder may manage permissions",
            ));
        }
        Ok(())
    }
}
