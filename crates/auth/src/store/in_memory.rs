//! In-memory directory and cache store for tests/dev.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use tierguard_core::{OrganizationId, PermissionId, RoleId, UserId};

use super::{
    CacheStore, OrganizationFilter, OrganizationRepository, Pagination, PermissionRepository,
    RoleRepository, StoreError, StoreResult, UserFilter, UserRepository,
};
use crate::organization::{Membership, MembershipHistory, Organization};
use crate::permissions::Permission;
use crate::principal::{AuthProvenance, User};
use crate::roles::{Role, RoleLevel};

#[derive(Debug, Default)]
struct DirectoryState {
    users: HashMap<UserId, User>,
    roles: HashMap<RoleId, Role>,
    permissions: HashMap<PermissionId, Permission>,
    role_permissions: HashMap<RoleId, BTreeSet<PermissionId>>,
    organizations: HashMap<OrganizationId, Organization>,
    memberships: HashMap<(UserId, OrganizationId), Membership>,
    history: Vec<MembershipHistory>,
}

impl DirectoryState {
    fn user_level(&self, user: &User) -> RoleLevel {
        user.role_id
            .and_then(|id| self.roles.get(&id))
            .map(|r| r.level)
            .unwrap_or(RoleLevel::NONE)
    }
}

/// In-memory relational directory.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, DirectoryState>> {
        self.state
            .read()
            .map_err(|_| StoreError::Backend("directory lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, DirectoryState>> {
        self.state
            .write()
            .map_err(|_| StoreError::Backend("directory lock poisoned".to_string()))
    }
}

fn page<T>(items: Vec<T>, pagination: Pagination) -> Vec<T> {
    items
        .into_iter()
        .skip(pagination.offset as usize)
        .take(pagination.limit as usize)
        .collect()
}

fn external_identity(user: &User) -> Option<(&str, &str)> {
    match &user.provenance {
        AuthProvenance::External { provider, subject } => Some((provider, subject)),
        AuthProvenance::Local { .. } => None,
    }
}

#[async_trait]
impl UserRepository for InMemoryDirectory {
    async fn user_by_id(&self, id: UserId) -> StoreResult<Option<User>> {
        Ok(self.read()?.users.get(&id).cloned())
    }

    async fn user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        Ok(self
            .read()?
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn user_by_external_identity(
        &self,
        provider: &str,
        subject: &str,
    ) -> StoreResult<Option<User>> {
        Ok(self
            .read()?
            .users
            .values()
            .find(|u| external_identity(u) == Some((provider, subject)))
            .cloned())
    }

    async fn insert_user(&self, user: &User) -> StoreResult<()> {
        let mut state = self.write()?;
        if state.users.contains_key(&user.id) {
            return Err(StoreError::Duplicate("user".to_string()));
        }
        if state.users.values().any(|u| u.username == user.username) {
            return Err(StoreError::Duplicate("username".to_string()));
        }
        if let Some(identity) = external_identity(user) {
            if state
                .users
                .values()
                .any(|u| external_identity(u) == Some(identity))
            {
                return Err(StoreError::Duplicate("external identity".to_string()));
            }
        }
        state.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn update_user(&self, user: &User) -> StoreResult<()> {
        let mut state = self.write()?;
        if !state.users.contains_key(&user.id) {
            return Err(StoreError::Missing("user".to_string()));
        }
        if state
            .users
            .values()
            .any(|u| u.id != user.id && u.username == user.username)
        {
            return Err(StoreError::Duplicate("username".to_string()));
        }
        state.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn holders_at_or_above(&self, level: RoleLevel) -> StoreResult<Vec<UserId>> {
        let state = self.read()?;
        let mut ids: Vec<UserId> = state
            .users
            .values()
            .filter(|u| u.can_authenticate() && state.user_level(u) >= level)
            .map(|u| u.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn list_users(&self, filter: &UserFilter) -> StoreResult<Vec<User>> {
        let state = self.read()?;
        let mut users: Vec<User> = state
            .users
            .values()
            .filter(|u| filter.include_inactive || u.can_authenticate())
            .filter(|u| filter.exclude_user != Some(u.id))
            .filter(|u| match filter.below_level {
                Some(level) => state.user_level(u) < level,
                None => true,
            })
            .filter(|u| match &filter.organization_ids {
                Some(orgs) => orgs.iter().any(|org| {
                    state
                        .memberships
                        .get(&(u.id, *org))
                        .is_some_and(|m| m.is_active)
                }),
                None => true,
            })
            .cloned()
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(page(users, filter.pagination))
    }
}

#[async_trait]
impl RoleRepository for InMemoryDirectory {
    async fn role_by_id(&self, id: RoleId) -> StoreResult<Option<Role>> {
        Ok(self.read()?.roles.get(&id).cloned())
    }

    async fn role_by_name(&self, name: &str) -> StoreResult<Option<Role>> {
        Ok(self
            .read()?
            .roles
            .values()
            .find(|r| r.name == name)
            .cloned())
    }

    async fn insert_role(&self, role: &Role) -> StoreResult<()> {
        let mut state = self.write()?;
        if state.roles.contains_key(&role.id) {
            return Err(StoreError::Duplicate("role".to_string()));
        }
        if state.roles.values().any(|r| r.name == role.name) {
            return Err(StoreError::Duplicate("role name".to_string()));
        }
        state.roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn update_role(&self, role: &Role) -> StoreResult<()> {
        let mut state = self.write()?;
        if !state.roles.contains_key(&role.id) {
            return Err(StoreError::Missing("role".to_string()));
        }
        if state
            .roles
            .values()
            .any(|r| r.id != role.id && r.name == role.name)
        {
            return Err(StoreError::Duplicate("role name".to_string()));
        }
        state.roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn delete_role(&self, id: RoleId) -> StoreResult<bool> {
        let mut state = self.write()?;
        state.role_permissions.remove(&id);
        Ok(state.roles.remove(&id).is_some())
    }

    async fn role_reference_count(&self, id: RoleId) -> StoreResult<u64> {
        let state = self.read()?;
        let users = state
            .users
            .values()
            .filter(|u| u.role_id == Some(id))
            .count();
        let memberships = state
            .memberships
            .values()
            .filter(|m| m.role_id == Some(id))
            .count();
        Ok((users + memberships) as u64)
    }

    async fn permissions_for_role(&self, id: RoleId) -> StoreResult<Vec<String>> {
        let state = self.read()?;
        let mut names: Vec<String> = state
            .role_permissions
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|pid| state.permissions.get(pid))
            .map(|p| p.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn replace_role_permissions(
        &self,
        id: RoleId,
        permissions: &[PermissionId],
    ) -> StoreResult<()> {
        let mut state = self.write()?;
        if !state.roles.contains_key(&id) {
            return Err(StoreError::Missing("role".to_string()));
        }
        if let Some(missing) = permissions
            .iter()
            .find(|pid| !state.permissions.contains_key(pid))
        {
            return Err(StoreError::Missing(format!("permission {missing}")));
        }
        state
            .role_permissions
            .insert(id, permissions.iter().copied().collect());
        Ok(())
    }
}

#[async_trait]
impl PermissionRepository for InMemoryDirectory {
    async fn permission_by_name(&self, name: &str) -> StoreResult<Option<Permission>> {
        Ok(self
            .read()?
            .permissions
            .values()
            .find(|p| p.name == name)
            .cloned())
    }

    async fn list_permissions(&self) -> StoreResult<Vec<Permission>> {
        let mut all: Vec<Permission> = self.read()?.permissions.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn insert_permission(&self, permission: &Permission) -> StoreResult<()> {
        let mut state = self.write()?;
        if state.permissions.contains_key(&permission.id)
            || state.permissions.values().any(|p| p.name == permission.name)
        {
            return Err(StoreError::Duplicate("permission name".to_string()));
        }
        state.permissions.insert(permission.id, permission.clone());
        Ok(())
    }

    async fn delete_permission(&self, id: PermissionId) -> StoreResult<bool> {
        let mut state = self.write()?;
        for set in state.role_permissions.values_mut() {
            set.remove(&id);
        }
        Ok(state.permissions.remove(&id).is_some())
    }

    async fn permission_reference_count(&self, id: PermissionId) -> StoreResult<u64> {
        let state = self.read()?;
        Ok(state
            .role_permissions
            .values()
            .filter(|set| set.contains(&id))
            .count() as u64)
    }
}

#[async_trait]
impl OrganizationRepository for InMemoryDirectory {
    async fn organization_by_id(&self, id: OrganizationId) -> StoreResult<Option<Organization>> {
        Ok(self.read()?.organizations.get(&id).cloned())
    }

    async fn insert_organization(&self, organization: &Organization) -> StoreResult<()> {
        let mut state = self.write()?;
        if state.organizations.contains_key(&organization.id) {
            return Err(StoreError::Duplicate("organization".to_string()));
        }
        if state
            .organizations
            .values()
            .any(|o| o.code == organization.code)
        {
            return Err(StoreError::Duplicate("organization code".to_string()));
        }
        state
            .organizations
            .insert(organization.id, organization.clone());
        Ok(())
    }

    async fn update_organization(&self, organization: &Organization) -> StoreResult<()> {
        let mut state = self.write()?;
        if !state.organizations.contains_key(&organization.id) {
            return Err(StoreError::Missing("organization".to_string()));
        }
        if state
            .organizations
            .values()
            .any(|o| o.id != organization.id && o.code == organization.code)
        {
            return Err(StoreError::Duplicate("organization code".to_string()));
        }
        state
            .organizations
            .insert(organization.id, organization.clone());
        Ok(())
    }

    async fn child_organizations(&self, parent: OrganizationId) -> StoreResult<Vec<Organization>> {
        let mut children: Vec<Organization> = self
            .read()?
            .organizations
            .values()
            .filter(|o| o.parent_id == Some(parent))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(children)
    }

    async fn list_organizations(&self, filter: &OrganizationFilter) -> StoreResult<Vec<Organization>> {
        let state = self.read()?;
        let mut orgs: Vec<Organization> = state
            .organizations
            .values()
            .filter(|o| filter.include_inactive || o.is_active)
            .filter(|o| filter.org_type.is_none_or(|t| o.org_type == t))
            .filter(|o| filter.parent_id.is_none() || o.parent_id == filter.parent_id)
            .filter(|o| match &filter.ids {
                Some(ids) => ids.contains(&o.id),
                None => true,
            })
            .cloned()
            .collect();
        orgs.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(page(orgs, filter.pagination))
    }

    async fn membership(
        &self,
        user: UserId,
        organization: OrganizationId,
    ) -> StoreResult<Option<Membership>> {
        Ok(self.read()?.memberships.get(&(user, organization)).cloned())
    }

    async fn memberships_for_user(&self, user: UserId) -> StoreResult<Vec<Membership>> {
        let mut memberships: Vec<Membership> = self
            .read()?
            .memberships
            .values()
            .filter(|m| m.user_id == user)
            .cloned()
            .collect();
        memberships.sort_by_key(|m| m.organization_id);
        Ok(memberships)
    }

    async fn upsert_membership(&self, membership: &Membership) -> StoreResult<()> {
        let mut state = self.write()?;
        if !state.users.contains_key(&membership.user_id) {
            return Err(StoreError::Missing("user".to_string()));
        }
        if !state.organizations.contains_key(&membership.organization_id) {
            return Err(StoreError::Missing("organization".to_string()));
        }
        state.memberships.insert(
            (membership.user_id, membership.organization_id),
            membership.clone(),
        );
        Ok(())
    }

    async fn append_membership_history(&self, record: &MembershipHistory) -> StoreResult<()> {
        self.write()?.history.push(record.clone());
        Ok(())
    }

    async fn membership_history(
        &self,
        user: UserId,
        organization: OrganizationId,
    ) -> StoreResult<Vec<MembershipHistory>> {
        Ok(self
            .read()?
            .history
            .iter()
            .filter(|h| h.user_id == user && h.organization_id == organization)
            .cloned()
            .collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Slot {
    Value(String),
    Set(BTreeSet<String>),
}

#[derive(Debug)]
struct Entry {
    slot: Slot,
    expires_at: Instant,
}

/// Single-process stand-in for the shared cache store. Expiry is passive:
/// stale entries are dropped when touched.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Backend("cache lock poisoned".to_string()))
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|map| map.values().filter(|e| e.expires_at > now).count())
            .unwrap_or(0)
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Backend(format!("WRONGTYPE operation against key '{key}'"))
}

/// Remove `key` if it has expired; return the live entry otherwise.
fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if map.get(key).is_some_and(|e| e.expires_at <= now) {
        map.remove(key);
    }
    map.get_mut(key)
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut map = self.lock()?;
        match live(&mut map, key) {
            Some(Entry {
                slot: Slot::Value(v),
                ..
            }) => Ok(Some(v.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.lock()?.insert(
            key.to_string(),
            Entry {
                slot: Slot::Value(value.to_string()),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut map = self.lock()?;
        Ok(match map.remove(key) {
            Some(entry) => entry.expires_at > Instant::now(),
            None => false,
        })
    }

    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut map = self.lock()?;
        let now = Instant::now();
        map.retain(|_, e| e.expires_at > now);
        let mut keys: Vec<String> = map
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> StoreResult<()> {
        let mut map = self.lock()?;
        let expires_at = Instant::now() + ttl;
        match live(&mut map, key) {
            Some(Entry {
                slot: Slot::Set(set),
                expires_at: exp,
            }) => {
                set.insert(member.to_string());
                *exp = expires_at;
            }
            Some(_) => return Err(wrong_type(key)),
            None => {
                map.insert(
                    key.to_string(),
                    Entry {
                        slot: Slot::Set(BTreeSet::from([member.to_string()])),
                        expires_at,
                    },
                );
            }
        }
        Ok(())
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut map = self.lock()?;
        let now_empty = match live(&mut map, key) {
            Some(Entry {
                slot: Slot::Set(set),
                ..
            }) => {
                set.remove(member);
                set.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
            None => false,
        };
        if now_empty {
            map.remove(key);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut map = self.lock()?;
        match live(&mut map, key) {
            Some(Entry {
                slot: Slot::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }
}

/// Redis-style glob supporting `*` and `?`.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matching() {
        assert!(glob_match("refresh_token:*", "refresh_token:abc"));
        assert!(glob_match("*", ""));
        assert!(glob_match("a?c", "abc"));
        assert!(glob_match("*:x:*", "a:x:b"));
        assert!(!glob_match("refresh_token:*", "role_permissions:1"));
        assert!(!glob_match("a?c", "ac"));
    }

    #[tokio::test]
    async fn delete_reports_whether_a_live_key_was_removed() {
        let cache = InMemoryCacheStore::new();
        cache
            .set_with_ttl("k", "v", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_are_invisible() {
        let cache = InMemoryCacheStore::new();
        cache.set_with_ttl("k", "v", Duration::ZERO).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(!cache.delete("k").await.unwrap());
        assert_eq!(cache.key_count(), 0);
    }

    #[tokio::test]
    async fn sets_track_members_and_vanish_when_empty() {
        let cache = InMemoryCacheStore::new();
        let ttl = Duration::from_secs(60);
        cache.add_to_set("s", "a", ttl).await.unwrap();
        cache.add_to_set("s", "b", ttl).await.unwrap();
        assert_eq!(cache.set_members("s").await.unwrap(), vec!["a", "b"]);

        cache.remove_from_set("s", "a").await.unwrap();
        cache.remove_from_set("s", "b").await.unwrap();
        assert!(cache.set_members("s").await.unwrap().is_empty());
        assert!(cache.scan_keys("*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn type_mismatch_is_a_backend_error() {
        let cache = InMemoryCacheStore::new();
        let ttl = Duration::from_secs(60);
        cache.add_to_set("s", "a", ttl).await.unwrap();
        assert!(matches!(cache.get("s").await, Err(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn duplicate_usernames_are_rejected() {
        let dir = InMemoryDirectory::new();
        dir.insert_user(&User::local("alice", "h").unwrap()).await.unwrap();
        let err = dir
            .insert_user(&User::local("alice", "h2").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Duplicate("username".to_string()));
    }

    #[tokio::test]
    async fn replace_role_permissions_rejects_unknown_permissions() {
        let dir = InMemoryDirectory::new();
        let role = Role::seeded_super(chrono::Utc::now());
        dir.insert_role(&role).await.unwrap();
        let err = dir
            .replace_role_permissions(role.id, &[PermissionId::new()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Missing(_)));
    }
}
