//! Refresh-token session records.
//!
//! Each active refresh token maps to its principal under
//! `refresh_token:{token}`. With `SessionRevocation::PrincipalIndex` the
//! tokens of a principal are also tracked in the set `user_sessions:{id}` so
//! bulk revocation does not have to walk the keyspace.

use std::sync::Arc;
use std::time::Duration;

use tierguard_core::UserId;

use crate::settings::SessionRevocation;
use crate::store::{CacheStore, StoreError, StoreResult};

const TOKEN_PREFIX: &str = "refresh_token:";

#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    revocation: SessionRevocation,
}

impl SessionStore {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration, revocation: SessionRevocation) -> Self {
        Self {
            store,
            ttl,
            revocation,
        }
    }

    pub fn token_key(token: &str) -> String {
        format!("{TOKEN_PREFIX}{token}")
    }

    pub fn principal_key(user: UserId) -> String {
        format!("user_sessions:{user}")
    }

    /// Record a freshly issued refresh token.
    pub async fn register(&self, token: &str, user: UserId) -> StoreResult<()> {
        let key = Self::token_key(token);
        self.store
            .set_with_ttl(&key, &user.to_string(), self.ttl)
            .await?;

        if self.revocation == SessionRevocation::PrincipalIndex {
            if let Err(err) = self
                .store
                .add_to_set(&Self::principal_key(user), token, self.ttl)
                .await
            {
                // An unindexed token would survive bulk revocation; drop it.
                if let Err(cleanup) = self.store.delete(&key).await {
                    tracing::error!(%user, error = %cleanup, "failed to drop unindexed refresh token");
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Principal the token is registered to, if it is still active.
    pub async fn lookup(&self, token: &str) -> StoreResult<Option<UserId>> {
        match self.store.get(&Self::token_key(token)).await? {
            Some(raw) => raw
                .parse::<UserId>()
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("session value: {e}"))),
            None => Ok(None),
        }
    }

    /// Delete the token. `true` only for the caller that actually removed it,
    /// which is what makes rotation single-use under concurrency.
    pub async fn consume(&self, token: &str, user: UserId) -> StoreResult<bool> {
        let removed = self.store.delete(&Self::token_key(token)).await?;
        if removed && self.revocation == SessionRevocation::PrincipalIndex {
            if let Err(err) = self
                .store
                .remove_from_set(&Self::principal_key(user), token)
                .await
            {
                tracing::warn!(%user, error = %err, "failed to unindex consumed refresh token");
            }
        }
        Ok(removed)
    }

    /// Delete every refresh token registered to `user`. Returns how many were
    /// still active.
    ///
    /// Only the index members actually processed are unindexed; a token
    /// registered mid-revocation stays indexed for the next call.
    pub async fn revoke_all(&self, user: UserId) -> StoreResult<usize> {
        let mut revoked = 0;
        match self.revocation {
            SessionRevocation::PrincipalIndex => {
                let index = Self::principal_key(user);
                for token in self.store.set_members(&index).await? {
                    if self.store.delete(&Self::token_key(&token)).await? {
                        revoked += 1;
                    }
                    self.store.remove_from_set(&index, &token).await?;
                }
            }
            SessionRevocation::KeyspaceScan => {
                let owner = user.to_string();
                let pattern = format!("{TOKEN_PREFIX}*");
                for key in self.store.scan_keys(&pattern).await? {
                    if self.store.get(&key).await?.as_deref() == Some(owner.as_str())
                        && self.store.delete(&key).await?
                    {
                        revoked += 1;
                    }
                }
            }
        }
        tracing::info!(%user, revoked, strategy = ?self.revocation, "revoked refresh tokens");
        Ok(revoked)
    }
}

impl core::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionStore")
            .field("ttl", &self.ttl)
            .field("revocation", &self.revocation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::store::InMemoryCacheStore;

    /// Registers one more token for a principal right after its index is read,
    /// the way a concurrent login would.
    struct LateLogin {
        inner: InMemoryCacheStore,
        pending: Mutex<Option<(String, UserId)>>,
    }

    #[async_trait]
    impl CacheStore for LateLogin {
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
            self.inner.set_with_ttl(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> StoreResult<bool> {
            self.inner.delete(key).await
        }

        async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
            self.inner.scan_keys(pattern).await
        }

        async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> StoreResult<()> {
            self.inner.add_to_set(key, member, ttl).await
        }

        async fn remove_from_set(&self, key: &str, member: &str) -> StoreResult<()> {
            self.inner.remove_from_set(key, member).await
        }

        async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
            let members = self.inner.set_members(key).await?;
            let pending = self.pending.lock().unwrap().take();
            if let Some((token, user)) = pending {
                let ttl = Duration::from_secs(3600);
                self.inner
                    .set_with_ttl(&SessionStore::token_key(&token), &user.to_string(), ttl)
                    .await?;
                self.inner
                    .add_to_set(&SessionStore::principal_key(user), &token, ttl)
                    .await?;
            }
            Ok(members)
        }
    }

    fn sessions(revocation: SessionRevocation) -> (Arc<InMemoryCacheStore>, SessionStore) {
        let cache = InMemoryCacheStore::arc();
        let store = SessionStore::new(cache.clone(), Duration::from_secs(3600), revocation);
        (cache, store)
    }

    #[tokio::test]
    async fn register_lookup_consume() {
        let (_cache, store) = sessions(SessionRevocation::PrincipalIndex);
        let user = UserId::new();

        store.register("tok-1", user).await.unwrap();
        assert_eq!(store.lookup("tok-1").await.unwrap(), Some(user));

        assert!(store.consume("tok-1", user).await.unwrap());
        assert!(!store.consume("tok-1", user).await.unwrap());
        assert_eq!(store.lookup("tok-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn revoke_all_via_index_only_touches_the_principal() {
        let (cache, store) = sessions(SessionRevocation::PrincipalIndex);
        let alice = UserId::new();
        let bob = UserId::new();

        store.register("a1", alice).await.unwrap();
        store.register("a2", alice).await.unwrap();
        store.register("b1", bob).await.unwrap();

        assert_eq!(store.revoke_all(alice).await.unwrap(), 2);
        assert_eq!(store.lookup("a1").await.unwrap(), None);
        assert_eq!(store.lookup("a2").await.unwrap(), None);
        assert_eq!(store.lookup("b1").await.unwrap(), Some(bob));
        assert!(
            cache
                .set_members(&SessionStore::principal_key(alice))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn revoke_all_via_scan_matches_on_stored_value() {
        let (_cache, store) = sessions(SessionRevocation::KeyspaceScan);
        let alice = UserId::new();
        let bob = UserId::new();

        store.register("a1", alice).await.unwrap();
        store.register("b1", bob).await.unwrap();

        assert_eq!(store.revoke_all(alice).await.unwrap(), 1);
        assert_eq!(store.lookup("a1").await.unwrap(), None);
        assert_eq!(store.lookup("b1").await.unwrap(), Some(bob));
    }

    #[tokio::test]
    async fn consumed_tokens_leave_the_index() {
        let (cache, store) = sessions(SessionRevocation::PrincipalIndex);
        let user = UserId::new();
        store.register("t", user).await.unwrap();
        store.consume("t", user).await.unwrap();
        assert!(
            cache
                .set_members(&SessionStore::principal_key(user))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn a_token_registered_mid_revocation_stays_revocable() {
        let user = UserId::new();
        let cache = Arc::new(LateLogin {
            inner: InMemoryCacheStore::new(),
            pending: Mutex::new(None),
        });
        let store = SessionStore::new(
            cache.clone(),
            Duration::from_secs(3600),
            SessionRevocation::PrincipalIndex,
        );
        store.register("early", user).await.unwrap();
        *cache.pending.lock().unwrap() = Some(("late".to_string(), user));

        assert_eq!(store.revoke_all(user).await.unwrap(), 1);
        assert_eq!(store.lookup("early").await.unwrap(), None);
        assert_eq!(
            cache
                .inner
                .set_members(&SessionStore::principal_key(user))
                .await
                .unwrap(),
            vec!["late".to_string()]
        );

        assert_eq!(store.revoke_all(user).await.unwrap(), 1);
        assert_eq!(store.lookup("late").await.unwrap(), None);
    }
}
