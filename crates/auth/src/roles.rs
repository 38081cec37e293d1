use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tierguard_core::{AccessError, AccessResult, RoleId};

use crate::organization::OrganizationType;
use crate::principal::RoleRef;

/// Reserved name of the seeded apex role.
pub const SUPER_ROLE_NAME: &str = "super_admin";

/// Integer trust rank in `[0, 100]`; higher is more privileged.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct RoleLevel(u8);

impl RoleLevel {
    /// Level of a principal without any role.
    pub const NONE: RoleLevel = RoleLevel(0);
    /// Reserved apex level.
    pub const SUPER: RoleLevel = RoleLevel(100);

    pub fn new(level: u8) -> AccessResult<Self> {
        if level > Self::SUPER.0 {
            return Err(AccessError::validation(format!(
                "role level {level} is outside 0..=100"
            )));
        }
        Ok(Self(level))
    }

    /// Clamp `level` into range. For constants and configuration defaults.
    pub const fn saturating(level: u8) -> Self {
        if level > Self::SUPER.0 {
            Self::SUPER
        } else {
            Self(level)
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn is_super(self) -> bool {
        self >= Self::SUPER
    }

    /// Strict descent: `self` may manage `target` only when it is strictly higher.
    pub fn outranks(self, target: RoleLevel) -> bool {
        self > target
    }
}

impl TryFrom<u8> for RoleLevel {
    type Error = AccessError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoleLevel> for u8 {
    fn from(value: RoleLevel) -> Self {
        value.0
    }
}

impl core::fmt::Display for RoleLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Super detection. Any one signal suffices: reserved id, reserved name or
/// apex level.
pub fn is_super_role(id: RoleId, name: &str, level: RoleLevel) -> bool {
    id == RoleId::SUPER || name == SUPER_ROLE_NAME || level.is_super()
}

/// A named capability bundle.
///
/// Permissions are not embedded: they are resolved through the permission
/// cache so that a role row stays cheap to load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub description: String,
    pub level: RoleLevel,
    /// Seeded roles cannot be renamed or deleted.
    pub is_system: bool,
    pub is_active: bool,
    /// Organization types this role may be bound to through a membership.
    pub organization_types: BTreeSet<OrganizationType>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Role {
    /// The seeded apex role. Its permission list stays empty: its authority is
    /// a structural bypass.
    pub fn seeded_super(now: DateTime<Utc>) -> Self {
        Self {
            id: RoleId::SUPER,
            name: SUPER_ROLE_NAME.to_string(),
            description: "Platform super administrator".to_string(),
            level: RoleLevel::SUPER,
            is_system: true,
            is_active: true,
            organization_types: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_super(&self) -> bool {
        is_super_role(self.id, &self.name, self.level)
    }

    /// Whether the role may be bound within an organization of type `org_type`.
    pub fn applies_to(&self, org_type: OrganizationType) -> bool {
        self.is_super() || self.organization_types.contains(&org_type)
    }

    pub fn to_ref(&self) -> RoleRef {
        RoleRef {
            id: self.id,
            level: self.level,
            name: self.name.clone(),
        }
    }
}

/// Input for creating a custom role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRole {
    pub name: String,
    pub description: String,
    pub level: u8,
    #[serde(default)]
    pub organization_types: BTreeSet<OrganizationType>,
}

/// Partial update of a role. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub level: Option<u8>,
    pub is_active: Option<bool>,
    pub organization_types: Option<BTreeSet<OrganizationType>>,
}

pub(crate) fn validate_role_name(name: &str) -> AccessResult<()> {
    let name = name.trim();
    if name.is_empty() || name.len() > 64 {
        return Err(AccessError::validation("role name must be 1..=64 characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_rejects_values_above_apex() {
        assert!(RoleLevel::new(100).is_ok());
        assert!(matches!(RoleLevel::new(101), Err(AccessError::Validation(_))));
    }

    #[test]
    fn super_detection_matches_any_signal() {
        let low = RoleLevel::new(10).unwrap();
        assert!(is_super_role(RoleId::SUPER, "anything", low));
        assert!(is_super_role(RoleId::new(), SUPER_ROLE_NAME, low));
        assert!(is_super_role(RoleId::new(), "root", RoleLevel::SUPER));
        assert!(!is_super_role(RoleId::new(), "manager", low));
    }

    #[test]
    fn outranks_is_strict() {
        let forty = RoleLevel::new(40).unwrap();
        let fifty = RoleLevel::new(50).unwrap();
        assert!(fifty.outranks(forty));
        assert!(!forty.outranks(forty));
        assert!(!forty.outranks(fifty));
    }

    #[test]
    fn role_level_deserializes_with_bounds() {
        let ok: RoleLevel = serde_json::from_str("55").unwrap();
        assert_eq!(ok.get(), 55);
        assert!(serde_json::from_str::<RoleLevel>("150").is_err());
    }

    #[test]
    fn super_role_applies_everywhere() {
        let role = Role::seeded_super(Utc::now());
        assert!(role.applies_to(OrganizationType::Store));
        assert!(role.applies_to(OrganizationType::Holding));
    }
}
