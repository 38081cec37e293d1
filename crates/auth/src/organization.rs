//! Organization tree and membership records.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tierguard_core::{AccessError, AccessResult, MembershipEventId, OrganizationId, RoleId, UserId};

/// Tier of an organization node.
///
/// The platform is the implicit root above every holding and has no row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrganizationType {
    Holding,
    Company,
    Store,
}

impl OrganizationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Holding => "holding",
            Self::Company => "company",
            Self::Store => "store",
        }
    }

    /// Fixed adjacency: holding → company → store. `None` means the node must
    /// be a root (directly under the platform).
    pub fn required_parent(self) -> Option<OrganizationType> {
        match self {
            Self::Holding => None,
            Self::Company => Some(Self::Holding),
            Self::Store => Some(Self::Company),
        }
    }

    /// Descendant types a member of this type may see, keyed on the ancestor.
    pub fn reachable_descendants(self) -> &'static [OrganizationType] {
        match self {
            Self::Holding => &[Self::Company, Self::Store],
            Self::Company => &[Self::Store],
            Self::Store => &[],
        }
    }
}

impl core::fmt::Display for OrganizationType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrganizationType {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "holding" => Ok(Self::Holding),
            "company" => Ok(Self::Company),
            "store" => Ok(Self::Store),
            other => Err(AccessError::validation(format!(
                "unknown organization type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrganizationId,
    pub name: String,
    /// Unique short code.
    pub code: String,
    pub org_type: OrganizationType,
    pub parent_id: Option<OrganizationId>,
    pub is_active: bool,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrganization {
    pub name: String,
    pub code: String,
    pub org_type: OrganizationType,
    pub parent_id: Option<OrganizationId>,
}

impl NewOrganization {
    pub(crate) fn validate(&self) -> AccessResult<()> {
        if self.name.trim().is_empty() {
            return Err(AccessError::validation("organization name must not be empty"));
        }
        let code_ok = !self.code.is_empty()
            && self.code.len() <= 32
            && self
                .code
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !code_ok {
            return Err(AccessError::validation(
                "organization code must be 1..=32 characters of [A-Za-z0-9_-]",
            ));
        }
        Ok(())
    }
}

/// A principal's membership in one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    /// Role scoped to this organization, independent of the global role.
    pub role_id: Option<RoleId>,
    pub is_active: bool,
    pub joined_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipAction {
    Joined,
    Rejoined,
    RoleChanged,
    Activated,
    Deactivated,
}

impl MembershipAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Joined => "joined",
            Self::Rejoined => "rejoined",
            Self::RoleChanged => "role_changed",
            Self::Activated => "activated",
            Self::Deactivated => "deactivated",
        }
    }
}

impl FromStr for MembershipAction {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "joined" => Ok(Self::Joined),
            "rejoined" => Ok(Self::Rejoined),
            "role_changed" => Ok(Self::RoleChanged),
            "activated" => Ok(Self::Activated),
            "deactivated" => Ok(Self::Deactivated),
            other => Err(AccessError::validation(format!(
                "unknown membership action '{other}'"
            ))),
        }
    }
}

/// Append-only audit record of a membership transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipHistory {
    pub id: MembershipEventId,
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    pub action: MembershipAction,
    pub previous_role_id: Option<RoleId>,
    pub new_role_id: Option<RoleId>,
    pub previous_active: Option<bool>,
    pub new_active: bool,
    pub actor_id: UserId,
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl MembershipHistory {
    /// Record the transition from `previous` (if any) to `current`.
    pub fn transition(
        action: MembershipAction,
        previous: Option<&Membership>,
        current: &Membership,
        actor_id: UserId,
        reason: Option<String>,
    ) -> Self {
        Self {
            id: MembershipEventId::new(),
            user_id: current.user_id,
            organization_id: current.organization_id,
            action,
            previous_role_id: previous.and_then(|m| m.role_id),
            new_role_id: current.role_id,
            previous_active: previous.map(|m| m.is_active),
            new_active: current.is_active,
            actor_id,
            reason,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacency_is_holding_company_store() {
        assert_eq!(OrganizationType::Holding.required_parent(), None);
        assert_eq!(
            OrganizationType::Company.required_parent(),
            Some(OrganizationType::Holding)
        );
        assert_eq!(
            OrganizationType::Store.required_parent(),
            Some(OrganizationType::Company)
        );
    }

    #[test]
    fn reachability_is_keyed_on_the_ancestor() {
        assert_eq!(
            OrganizationType::Holding.reachable_descendants(),
            &[OrganizationType::Company, OrganizationType::Store]
        );
        assert_eq!(
            OrganizationType::Company.reachable_descendants(),
            &[OrganizationType::Store]
        );
        assert!(OrganizationType::Store.reachable_descendants().is_empty());
    }

    #[test]
    fn type_parses_from_its_wire_name() {
        for t in [
            OrganizationType::Holding,
            OrganizationType::Company,
            OrganizationType::Store,
        ] {
            assert_eq!(t.as_str().parse::<OrganizationType>().unwrap(), t);
        }
        assert!("platform".parse::<OrganizationType>().is_err());
    }

    #[test]
    fn organization_codes_are_validated() {
        let mut input = NewOrganization {
            name: "Acme".into(),
            code: "ACME-01".into(),
            org_type: OrganizationType::Holding,
            parent_id: None,
        };
        assert!(input.validate().is_ok());
        input.code = "bad code".into();
        assert!(input.validate().is_err());
    }
}
