//! Application-facing operations.
//!
//! Every privileged operation re-resolves the acting principal from the store
//! instead of trusting token claims, so a role change takes effect on the
//! very next call. The operations are split by concern:
//!
//! - `session`: register, login, refresh, logout, authenticate
//! - `roles`: role CRUD, permission sets, global role assignment
//! - `permissions`: permission catalogue (super holders only)
//! - `organizations`: tree management, memberships and listings

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::OnceCell;

use tierguard_core::{AccessError, AccessResult, RequestContext, UserId};

use crate::cache::PermissionCache;
use crate::credentials::CredentialVerifier;
use crate::engine::{AuthorizationEngine, PermissionSnapshot};
use crate::hierarchy::{OrganizationHierarchy, RoleHierarchy};
use crate::organization::MembershipHistory;
use crate::principal::{Principal, RoleAssignment, User};
use crate::session::SessionStore;
use crate::settings::AuthSettings;
use crate::store::{CacheStore, Directory};
use crate::tokens::{TokenIssuer, TokenPair};

mod organizations;
mod permissions;
mod roles;
mod session;

/// Result of a successful login or refresh.
#[derive(Debug, Clone, Serialize)]
pub struct AuthSession {
    pub user_id: UserId,
    pub username: String,
    pub tokens: TokenPair,
    pub snapshot: PermissionSnapshot,
}

#[derive(Clone)]
pub struct AccessService {
    directory: Arc<dyn Directory>,
    engine: AuthorizationEngine,
    roles: RoleHierarchy,
    sessions: SessionStore,
    tokens: TokenIssuer,
    verifier: Arc<dyn CredentialVerifier>,
    /// Hash verified against when there is no real one, so a rejected login
    /// costs the same whether or not the account exists.
    decoy_hash: Arc<OnceCell<String>>,
    settings: AuthSettings,
}

impl AccessService {
    pub fn new(
        directory: Arc<dyn Directory>,
        cache_store: Arc<dyn CacheStore>,
        verifier: Arc<dyn CredentialVerifier>,
        tokens: TokenIssuer,
        settings: AuthSettings,
    ) -> Self {
        let organizations =
            OrganizationHierarchy::new(directory.clone(), settings.platform_level_threshold);
        let engine = AuthorizationEngine::new(
            directory.clone(),
            PermissionCache::new(cache_store.clone(), settings.permission_cache_ttl),
            organizations,
        );
        let roles = RoleHierarchy::new(directory.clone(), settings.custom_role_level_floor);
        let sessions = SessionStore::new(
            cache_store,
            settings.refresh_token_ttl,
            settings.session_revocation,
        );

        Self {
            directory,
            engine,
            roles,
            sessions,
            tokens,
            verifier,
            decoy_hash: Arc::new(OnceCell::new()),
            settings,
        }
    }

    pub fn engine(&self) -> &AuthorizationEngine {
        &self.engine
    }

    pub fn settings(&self) -> &AuthSettings {
        &self.settings
    }

    /// The acting principal. Unknown or disabled actors are `Unauthorized`:
    /// a token can outlive the account it was issued to.
    async fn actor(&self, ctx: &RequestContext, actor: UserId) -> AccessResult<Principal> {
        let user = self.user(ctx, actor).await.map_err(AccessError::downgrade_not_found)?;
        if !user.can_authenticate() {
            return Err(AccessError::Unauthorized);
        }
        Ok(Principal {
            user_id: user.id,
            assignment: self.engine.assignment(ctx, user.role_id).await?,
        })
    }

    async fn user(&self, ctx: &RequestContext, id: UserId) -> AccessResult<User> {
        ctx.run(self.directory.user_by_id(id))
            .await??
            .ok_or_else(|| AccessError::not_found(format!("user {id}")))
    }

    async fn target(&self, ctx: &RequestContext, id: UserId) -> AccessResult<(User, RoleAssignment)> {
        let user = self.user(ctx, id).await?;
        let assignment = self.engine.assignment(ctx, user.role_id).await?;
        Ok((user, assignment))
    }

    /// Revoke every refresh token of `user` after a privilege change. The
    /// change itself has already committed, so failures are only logged.
    async fn revoke_after_change(&self, ctx: &RequestContext, user: UserId) {
        match ctx.run(self.sessions.revoke_all(user)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                tracing::error!(user_id = %user, error = %err, "session revocation after privilege change failed");
            }
            Err(err) => {
                tracing::error!(user_id = %user, error = %err, "session revocation after privilege change interrupted");
            }
        }
    }

    /// Append an audit record. The membership change has already committed,
    /// so failures are only logged.
    async fn record_history(&self, ctx: &RequestContext, record: MembershipHistory) {
        let outcome = match ctx
            .run(self.directory.append_membership_history(&record))
            .await
        {
            Ok(written) => written.map_err(|e| e.to_string()),
            Err(interrupted) => Err(interrupted.to_string()),
        };
        if let Err(err) = outcome {
            tracing::warn!(
                user_id = %record.user_id,
                organization_id = %record.organization_id,
                action = record.action.as_str(),
                error = %err,
                "failed to append membership history"
            );
        }
    }
}

impl core::fmt::Debug for AccessService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AccessService")
            .field("engine", &self.engine)
            .field("roles", &self.roles)
            .field("sessions", &self.sessions)
            .field("tokens", &self.tokens)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
