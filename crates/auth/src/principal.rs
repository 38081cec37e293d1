use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tierguard_core::{AccessError, AccessResult, RoleId, UserId};

use crate::roles::{RoleLevel, is_super_role};

/// How a principal proves its identity.
///
/// Exactly one provenance is active at a time, so an externally linked
/// principal can never also carry a local credential hash.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthProvenance {
    Local { password_hash: String },
    External { provider: String, subject: String },
}

impl core::fmt::Debug for AuthProvenance {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Local { .. } => f
                .debug_struct("Local")
                .field("password_hash", &"<redacted>")
                .finish(),
            Self::External { provider, subject } => f
                .debug_struct("External")
                .field("provider", provider)
                .field("subject", subject)
                .finish(),
        }
    }
}

/// An authenticated actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub provenance: AuthProvenance,
    /// Global role. Organization-scoped roles live on memberships.
    pub role_id: Option<RoleId>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker; rows are never removed.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn local(username: impl Into<String>, password_hash: impl Into<String>) -> AccessResult<Self> {
        Self::with_provenance(
            username.into(),
            AuthProvenance::Local {
                password_hash: password_hash.into(),
            },
        )
    }

    pub fn external(
        username: impl Into<String>,
        provider: impl Into<String>,
        subject: impl Into<String>,
    ) -> AccessResult<Self> {
        Self::with_provenance(
            username.into(),
            AuthProvenance::External {
                provider: provider.into(),
                subject: subject.into(),
            },
        )
    }

    fn with_provenance(username: String, provenance: AuthProvenance) -> AccessResult<Self> {
        validate_username(&username)?;
        let now = Utc::now();
        Ok(Self {
            id: UserId::new(),
            username,
            provenance,
            role_id: None,
            is_active: true,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    /// Active and not soft-deleted.
    pub fn can_authenticate(&self) -> bool {
        self.is_active && self.deleted_at.is_none()
    }

    pub fn password_hash(&self) -> Option<&str> {
        match &self.provenance {
            AuthProvenance::Local { password_hash } => Some(password_hash),
            AuthProvenance::External { .. } => None,
        }
    }
}

fn validate_username(username: &str) -> AccessResult<()> {
    if username.is_empty() || username.len() > 64 {
        return Err(AccessError::validation("username must be 1..=64 characters"));
    }
    if username.chars().any(char::is_whitespace) {
        return Err(AccessError::validation("username must not contain whitespace"));
    }
    Ok(())
}

/// Lightweight view of a role bound to a principal or membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRef {
    pub id: RoleId,
    pub level: RoleLevel,
    pub name: String,
}

/// Whether a principal (or membership) carries a role at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoleAssignment {
    NoRole,
    Assigned(RoleRef),
}

impl RoleAssignment {
    /// A missing role ranks at level zero.
    pub fn level(&self) -> RoleLevel {
        match self {
            Self::NoRole => RoleLevel::NONE,
            Self::Assigned(role) => role.level,
        }
    }

    pub fn is_super(&self) -> bool {
        match self {
            Self::NoRole => false,
            Self::Assigned(role) => is_super_role(role.id, &role.name, role.level),
        }
    }

    pub fn role_id(&self) -> Option<RoleId> {
        match self {
            Self::NoRole => None,
            Self::Assigned(role) => Some(role.id),
        }
    }
}

/// A fully resolved principal for hierarchical decisions.
///
/// Built from the store on every privileged call; never from token claims,
/// which may lag a role change by up to the access-token lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub assignment: RoleAssignment,
}

impl Principal {
    pub fn level(&self) -> RoleLevel {
        self.assignment.level()
    }

    pub fn is_super(&self) -> bool {
        self.assignment.is_super()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_never_contains_the_hash() {
        let user = User::local("alice", "$argon2id$v=19$secret").unwrap();
        let rendered = format!("{user:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn external_principals_have_no_local_hash() {
        let user = User::external("bob", "github", "12345").unwrap();
        assert_eq!(user.password_hash(), None);
    }

    #[test]
    fn no_role_ranks_at_zero_and_is_not_super() {
        assert_eq!(RoleAssignment::NoRole.level(), RoleLevel::NONE);
        assert!(!RoleAssignment::NoRole.is_super());
        assert_eq!(RoleAssignment::NoRole.role_id(), None);
    }

    #[test]
    fn soft_deleted_users_cannot_authenticate() {
        let mut user = User::local("carol", "h").unwrap();
        assert!(user.can_authenticate());
        user.deleted_at = Some(Utc::now());
        assert!(!user.can_authenticate());
    }

    #[test]
    fn usernames_are_validated() {
        assert!(User::local("", "h").is_err());
        assert!(User::local("has space", "h").is_err());
    }
}
