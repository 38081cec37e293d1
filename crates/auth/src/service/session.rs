use chrono::Utc;

use tierguard_core::{AccessError, AccessResult, OrganizationId, RequestContext, UserId};

use super::{AccessService, AuthSession};
use crate::claims::AccessClaims;
use crate::credentials::CredentialError;
use crate::principal::{Principal, User};

const MIN_PASSWORD_LEN: usize = 8;
const DECOY_SECRET: &str = "tierguard-decoy-credential";

impl AccessService {
    /// Create a local principal. The role is assigned separately.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id(), username = %username))]
    pub async fn register(
        &self,
        ctx: &RequestContext,
        username: &str,
        password: &str,
    ) -> AccessResult<User> {
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AccessError::validation(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        let hash = self.hash_secret(ctx, password).await?;
        let user = User::local(username, hash)?;
        ctx.run(self.directory.insert_user(&user)).await??;

        tracing::info!(user_id = %user.id, "registered principal");
        Ok(user)
    }

    /// Verify a local credential and open a session.
    ///
    /// Unknown usernames, wrong passwords, external principals and disabled
    /// accounts all fail with the same `Unauthorized`.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id(), username = %username))]
    pub async fn login(
        &self,
        ctx: &RequestContext,
        username: &str,
        password: &str,
        organization_id: Option<OrganizationId>,
    ) -> AccessResult<AuthSession> {
        let Some(user) = ctx.run(self.directory.user_by_username(username)).await?? else {
            tracing::debug!("login for unknown username");
            self.verify_decoy(ctx, password).await;
            return Err(AccessError::Unauthorized);
        };
        if !user.can_authenticate() {
            tracing::debug!(user_id = %user.id, "login for disabled principal");
            self.verify_decoy(ctx, password).await;
            return Err(AccessError::Unauthorized);
        }
        let Some(hash) = user.password_hash() else {
            tracing::debug!(user_id = %user.id, "password login for external principal");
            self.verify_decoy(ctx, password).await;
            return Err(AccessError::Unauthorized);
        };
        if !self.verify_secret(ctx, password, hash).await? {
            tracing::info!(user_id = %user.id, "login rejected: bad credentials");
            return Err(AccessError::Unauthorized);
        }

        self.open_session(ctx, &user, organization_id).await
    }

    /// Open a session for an identity already asserted by an external
    /// provider. The principal is created on first login.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id(), provider = %provider))]
    pub async fn login_external(
        &self,
        ctx: &RequestContext,
        provider: &str,
        subject: &str,
        username: &str,
        organization_id: Option<OrganizationId>,
    ) -> AccessResult<AuthSession> {
        let existing = ctx
            .run(self.directory.user_by_external_identity(provider, subject))
            .await??;
        let user = match existing {
            Some(user) => user,
            None => {
                let user = User::external(username, provider, subject)?;
                ctx.run(self.directory.insert_user(&user)).await??;
                tracing::info!(user_id = %user.id, "provisioned external principal");
                user
            }
        };
        if !user.can_authenticate() {
            return Err(AccessError::Unauthorized);
        }

        self.open_session(ctx, &user, organization_id).await
    }

    /// Rotate a refresh token.
    ///
    /// The presented token is deleted before anything is issued, and only the
    /// caller whose delete actually removed it proceeds. A failed delete fails
    /// closed. A requested organization is checked before the delete, so
    /// asking for one the principal does not belong to leaves the session
    /// intact.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id()))]
    pub async fn refresh(
        &self,
        ctx: &RequestContext,
        refresh_token: &str,
        organization_id: Option<OrganizationId>,
    ) -> AccessResult<AuthSession> {
        let claims = self
            .tokens
            .validate_refresh(refresh_token, Utc::now())
            .map_err(|err| {
                tracing::debug!(error = %err, "refresh token rejected");
                AccessError::Unauthorized
            })?;

        let Some(owner) = ctx.run(self.sessions.lookup(refresh_token)).await?? else {
            tracing::info!(user_id = %claims.sub, "refresh token not active");
            return Err(AccessError::Unauthorized);
        };
        if owner != claims.sub {
            tracing::warn!(user_id = %claims.sub, "refresh token registered to another principal");
            return Err(AccessError::Unauthorized);
        }

        if let Some(organization_id) = organization_id {
            self.engine
                .get_user_role_in_organization(ctx, owner, organization_id)
                .await?;
        }

        if !ctx.run(self.sessions.consume(refresh_token, owner)).await?? {
            tracing::warn!(user_id = %owner, "refresh token already consumed");
            return Err(AccessError::Unauthorized);
        }

        let user = self
            .user(ctx, owner)
            .await
            .map_err(AccessError::downgrade_not_found)?;
        if !user.can_authenticate() {
            return Err(AccessError::Unauthorized);
        }

        self.open_session(ctx, &user, organization_id).await
    }

    /// Drop the presented refresh token. Always reports success.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id()))]
    pub async fn logout(&self, ctx: &RequestContext, refresh_token: &str) {
        let owner = match ctx.run(self.sessions.lookup(refresh_token)).await {
            Ok(Ok(Some(owner))) => owner,
            Ok(Ok(None)) => {
                tracing::debug!("logout with inactive refresh token");
                return;
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "logout lookup failed");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "logout interrupted");
                return;
            }
        };

        match ctx.run(self.sessions.consume(refresh_token, owner)).await {
            Ok(Ok(_)) => tracing::info!(user_id = %owner, "logged out"),
            Ok(Err(err)) => tracing::warn!(user_id = %owner, error = %err, "logout delete failed"),
            Err(err) => tracing::warn!(user_id = %owner, error = %err, "logout interrupted"),
        }
    }

    /// Stateless access-token check.
    pub async fn authenticate(
        &self,
        ctx: &RequestContext,
        access_token: &str,
    ) -> AccessResult<AccessClaims> {
        if ctx.is_cancelled() {
            return Err(AccessError::Cancelled);
        }
        self.tokens
            .validate_access(access_token, Utc::now())
            .map_err(|err| {
                tracing::debug!(error = %err, "access token rejected");
                AccessError::Unauthorized
            })
    }

    /// Revoke every refresh token of `target`. Principals may always revoke
    /// their own sessions; anyone else needs strict seniority.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id(), actor_id = %actor, target_id = %target))]
    pub async fn revoke_all_sessions(
        &self,
        ctx: &RequestContext,
        actor: UserId,
        target: UserId,
    ) -> AccessResult<usize> {
        let principal = self.actor(ctx, actor).await?;
        if actor != target {
            let (_, current) = self.target(ctx, target).await?;
            self.roles.ensure_can_manage(&principal, target, &current)?;
        }
        Ok(ctx.run(self.sessions.revoke_all(target)).await??)
    }

    async fn open_session(
        &self,
        ctx: &RequestContext,
        user: &User,
        organization_id: Option<OrganizationId>,
    ) -> AccessResult<AuthSession> {
        let principal = Principal {
            user_id: user.id,
            assignment: self.engine.assignment(ctx, user.role_id).await?,
        };
        let snapshot = self
            .engine
            .permission_snapshot(ctx, &principal, organization_id)
            .await?;

        let tokens = self
            .tokens
            .issue_pair(user.id, snapshot.role.role_id(), organization_id)
            .map_err(|err| AccessError::internal(err.to_string()))?;
        ctx.run(self.sessions.register(&tokens.refresh_token, user.id))
            .await??;

        tracing::info!(
            user_id = %user.id,
            organization_id = ?organization_id,
            "session opened"
        );
        Ok(AuthSession {
            user_id: user.id,
            username: user.username.clone(),
            tokens,
            snapshot,
        })
    }

    /// Hashing is CPU-bound; keep it off the async workers.
    async fn hash_secret(&self, ctx: &RequestContext, plaintext: &str) -> AccessResult<String> {
        let verifier = self.verifier.clone();
        let plaintext = plaintext.to_owned();
        ctx.run(tokio::task::spawn_blocking(move || verifier.hash(&plaintext)))
            .await?
            .map_err(|e| AccessError::internal(format!("hashing task failed: {e}")))?
            .map_err(|e| AccessError::internal(e.to_string()))
    }

    /// Pay for one verification against a hash of the configured cost. The
    /// outcome is discarded.
    async fn verify_decoy(&self, ctx: &RequestContext, password: &str) {
        let decoy = self
            .decoy_hash
            .get_or_try_init(|| self.hash_secret(ctx, DECOY_SECRET))
            .await;
        let outcome = match decoy {
            Ok(hash) => self.verify_secret(ctx, password, hash).await.map(|_| ()),
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            tracing::debug!(error = %err, "decoy verification failed");
        }
    }

    async fn verify_secret(
        &self,
        ctx: &RequestContext,
        plaintext: &str,
        hash: &str,
    ) -> AccessResult<bool> {
        let verifier = self.verifier.clone();
        let plaintext = plaintext.to_owned();
        let hash = hash.to_owned();
        let outcome = ctx
            .run(tokio::task::spawn_blocking(move || {
                verifier.verify(&plaintext, &hash)
            }))
            .await?
            .map_err(|e| AccessError::internal(format!("verification task failed: {e}")))?;

        match outcome {
            Ok(matched) => Ok(matched),
            Err(CredentialError::MalformedHash(detail)) => {
                tracing::error!(error = %detail, "stored credential hash is malformed");
                Ok(false)
            }
            Err(err) => Err(AccessError::internal(err.to_string())),
        }
    }
}
