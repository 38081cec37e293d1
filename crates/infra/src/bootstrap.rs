//! Wire an `AccessService` from `AppConfig`.
//!
//! Persistent stores are used when their URL is configured; otherwise the
//! in-memory adapters stand in, with a warning, so a developer can run the
//! engine without Postgres or Redis.

use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;

use tierguard_auth::{
    AccessService, Argon2Verifier, CacheStore, Directory, InMemoryCacheStore, InMemoryDirectory,
    Role, RoleLevel, RoleRepository, StoreError, TokenIssuer, User, UserRepository,
};
use tierguard_core::{RoleId, UserId};

use crate::config::AppConfig;
use crate::db::PostgresDirectory;

/// A ready service plus the directory it runs on, for seeding and
/// administrative bootstrap.
#[derive(Clone)]
pub struct Runtime {
    pub service: AccessService,
    pub directory: Arc<dyn Directory>,
    pub cache: Arc<dyn CacheStore>,
}

pub async fn build_access_service(config: &AppConfig) -> anyhow::Result<Runtime> {
    let directory = build_directory(config).await?;
    let cache = build_cache_store(config).await?;

    let verifier =
        Argon2Verifier::new(config.hashing).context("invalid Argon2 hashing parameters")?;
    let tokens = TokenIssuer::new(
        config.jwt_secret.expose(),
        config.auth.access_token_ttl,
        config.auth.refresh_token_ttl,
    )
    .context("failed to build token issuer")?;

    seed_super_role(directory.as_ref())
        .await
        .context("failed to seed the super role")?;

    let service = AccessService::new(
        directory.clone(),
        cache.clone(),
        Arc::new(verifier),
        tokens,
        config.auth.clone(),
    );
    tracing::info!(
        persistent_directory = config.database_url.is_some(),
        session_revocation = ?config.auth.session_revocation,
        "access service ready"
    );
    Ok(Runtime {
        service,
        directory,
        cache,
    })
}

async fn build_directory(config: &AppConfig) -> anyhow::Result<Arc<dyn Directory>> {
    match &config.database_url {
        Some(url) => {
            let directory = PostgresDirectory::connect(url)
                .await
                .context("failed to connect to Postgres")?;
            directory
                .migrate()
                .await
                .context("failed to apply directory schema")?;
            Ok(Arc::new(directory))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory directory");
            Ok(InMemoryDirectory::arc())
        }
    }
}

#[cfg(feature = "redis")]
async fn build_cache_store(config: &AppConfig) -> anyhow::Result<Arc<dyn CacheStore>> {
    match &config.redis_url {
        Some(url) => {
            let store = crate::redis_store::RedisCacheStore::connect(url)
                .await
                .context("failed to connect to Redis")?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("REDIS_URL not set; using in-memory cache store");
            Ok(Arc::new(InMemoryCacheStore::new()))
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn build_cache_store(config: &AppConfig) -> anyhow::Result<Arc<dyn CacheStore>> {
    if config.redis_url.is_some() {
        tracing::warn!("REDIS_URL set but built without the `redis` feature; using in-memory cache store");
    } else {
        tracing::warn!("REDIS_URL not set; using in-memory cache store");
    }
    Ok(Arc::new(InMemoryCacheStore::new()))
}

/// Insert the reserved super role unless it already exists.
pub async fn seed_super_role(directory: &dyn Directory) -> anyhow::Result<Role> {
    if let Some(existing) = directory.role_by_id(RoleId::SUPER).await? {
        return Ok(existing);
    }
    let role = Role::seeded_super(Utc::now());
    match directory.insert_role(&role).await {
        Ok(()) => {
            tracing::info!(role_id = %role.id, "seeded super role");
            Ok(role)
        }
        // Another process seeded it first.
        Err(StoreError::Duplicate(_)) => directory
            .role_by_id(RoleId::SUPER)
            .await?
            .context("super role name is taken by a different role"),
        Err(err) => Err(err.into()),
    }
}

/// Hand the super role to `user`, but only while nobody holds it. This is
/// the one way to install the first administrator; afterwards the role only
/// moves through `AccessService::assign_user_role`.
pub async fn claim_super_role(directory: &dyn Directory, user: UserId) -> anyhow::Result<User> {
    let holders = directory.holders_at_or_above(RoleLevel::SUPER).await?;
    if holders.contains(&user) {
        return directory
            .user_by_id(user)
            .await?
            .with_context(|| format!("user {user} vanished"));
    }
    if let Some(holder) = holders.first() {
        bail!("super role is already held by {holder}");
    }

    let mut target = directory
        .user_by_id(user)
        .await?
        .with_context(|| format!("user {user} not found"))?;
    if !target.can_authenticate() {
        bail!("user {user} is inactive");
    }
    target.role_id = Some(RoleId::SUPER);
    target.updated_at = Utc::now();
    directory.update_user(&target).await?;

    tracing::info!(user_id = %user, "super role claimed");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AppConfig {
        AppConfig::from_lookup(|key| match key {
            "JWT_SECRET" => Some("0123456789abcdef0123456789abcdef".to_string()),
            "ARGON2_MEMORY_KIB" => Some("1024".to_string()),
            "ARGON2_ITERATIONS" => Some("1".to_string()),
            _ => None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let directory = InMemoryDirectory::new();
        let first = seed_super_role(&directory).await.unwrap();
        let second = seed_super_role(&directory).await.unwrap();
        assert_eq!(first.id, RoleId::SUPER);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn super_role_can_only_be_claimed_once() {
        let directory = InMemoryDirectory::new();
        seed_super_role(&directory).await.unwrap();

        let alice = User::local("alice", "h").unwrap();
        let bob = User::local("bob", "h").unwrap();
        directory.insert_user(&alice).await.unwrap();
        directory.insert_user(&bob).await.unwrap();

        let claimed = claim_super_role(&directory, alice.id).await.unwrap();
        assert_eq!(claimed.role_id, Some(RoleId::SUPER));

        // Re-claiming by the holder is a no-op.
        claim_super_role(&directory, alice.id).await.unwrap();

        let err = claim_super_role(&directory, bob.id).await.unwrap_err();
        assert!(err.to_string().contains("already held"));
    }

    #[tokio::test]
    async fn in_memory_runtime_comes_up_seeded() {
        let runtime = build_access_service(&config()).await.unwrap();
        let role = runtime
            .directory
            .role_by_id(RoleId::SUPER)
            .await
            .unwrap()
            .unwrap();
        assert!(role.is_super());
        assert!(role.is_system);
    }
}
