//! Organization visibility and placement.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tierguard_core::{AccessError, AccessResult, OrganizationId, RequestContext};

use crate::organization::{Organization, OrganizationType};
use crate::principal::Principal;
use crate::roles::RoleLevel;
use crate::store::Directory;

/// The organizations a principal may see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "ids", rename_all = "snake_case")]
pub enum AccessibleOrganizations {
    All,
    Only(BTreeSet<OrganizationId>),
}

impl AccessibleOrganizations {
    pub fn contains(&self, id: OrganizationId) -> bool {
        match self {
            Self::All => true,
            Self::Only(ids) => ids.contains(&id),
        }
    }

    /// Narrow an optional id filter to what is visible. `None` stays
    /// unrestricted only under `All`.
    pub fn restrict(&self, requested: Option<Vec<OrganizationId>>) -> Option<Vec<OrganizationId>> {
        match (self, requested) {
            (Self::All, requested) => requested,
            (Self::Only(ids), None) => Some(ids.iter().copied().collect()),
            (Self::Only(ids), Some(requested)) => Some(
                requested
                    .into_iter()
                    .filter(|id| ids.contains(id))
                    .collect(),
            ),
        }
    }
}

#[derive(Clone)]
pub struct OrganizationHierarchy {
    directory: Arc<dyn Directory>,
    platform_level_threshold: RoleLevel,
}

impl OrganizationHierarchy {
    pub fn new(directory: Arc<dyn Directory>, platform_level_threshold: RoleLevel) -> Self {
        Self {
            directory,
            platform_level_threshold,
        }
    }

    pub fn platform_level_threshold(&self) -> RoleLevel {
        self.platform_level_threshold
    }

    /// Platform-level principals (and super holders) see the whole tree.
    pub fn sees_everything(&self, principal: &Principal) -> bool {
        principal.is_super() || principal.level() >= self.platform_level_threshold
    }

    /// Direct active memberships plus every descendant they reach.
    pub async fn accessible_organizations(
        &self,
        ctx: &RequestContext,
        principal: &Principal,
    ) -> AccessResult<AccessibleOrganizations> {
        if self.sees_everything(principal) {
            return Ok(AccessibleOrganizations::All);
        }

        let memberships = ctx
            .run(self.directory.memberships_for_user(principal.user_id))
            .await??;

        let mut visible = BTreeSet::new();
        for membership in memberships.into_iter().filter(|m| m.is_active) {
            if visible.contains(&membership.organization_id) {
                continue;
            }
            let Some(root) = ctx
                .run(self.directory.organization_by_id(membership.organization_id))
                .await??
            else {
                tracing::warn!(
                    user_id = %principal.user_id,
                    organization_id = %membership.organization_id,
                    "membership points at a missing organization"
                );
                continue;
            };
            if !root.is_active {
                continue;
            }
            visible.insert(root.id);
            for descendant in self.descendants(ctx, &root).await? {
                visible.insert(descendant.id);
            }
        }

        Ok(AccessibleOrganizations::Only(visible))
    }

    /// Every organization below `root` whose type `root`'s type may reach.
    ///
    /// Breadth-first with a visited set, so corrupt parent links cannot loop.
    pub async fn descendants(
        &self,
        ctx: &RequestContext,
        root: &Organization,
    ) -> AccessResult<Vec<Organization>> {
        let reachable = root.org_type.reachable_descendants();
        if reachable.is_empty() {
            return Ok(Vec::new());
        }

        let mut visited = HashSet::from([root.id]);
        let mut queue = VecDeque::from([root.id]);
        let mut found = Vec::new();

        while let Some(parent) = queue.pop_front() {
            let children = ctx
                .run(self.directory.child_organizations(parent))
                .await??;
            for child in children {
                if !reachable.contains(&child.org_type) || !visited.insert(child.id) {
                    continue;
                }
                queue.push_back(child.id);
                found.push(child);
            }
        }
        Ok(found)
    }

    /// Ancestors of `id`, nearest first, root last.
    pub async fn parent_chain(
        &self,
        ctx: &RequestContext,
        id: OrganizationId,
    ) -> AccessResult<Vec<Organization>> {
        let start = self.organization(ctx, id).await?;
        let mut seen = HashSet::from([start.id]);
        let mut chain = Vec::new();
        let mut next = start.parent_id;

        while let Some(parent_id) = next {
            if !seen.insert(parent_id) {
                tracing::error!(organization_id = %id, "cycle in organization parent chain");
                return Err(AccessError::internal(format!(
                    "cycle in parent chain of organization {id}"
                )));
            }
            let parent = self.organization(ctx, parent_id).await?;
            next = parent.parent_id;
            chain.push(parent);
        }
        Ok(chain)
    }

    /// Check that an organization of `org_type` may sit under `parent`.
    ///
    /// `moving` is the organization being re-parented, if any; placing it under
    /// itself or one of its own descendants is rejected. Returns the loaded
    /// parent.
    pub async fn ensure_valid_placement(
        &self,
        ctx: &RequestContext,
        org_type: OrganizationType,
        parent: Option<OrganizationId>,
        moving: Option<OrganizationId>,
    ) -> AccessResult<Option<Organization>> {
        let parent = match (org_type.required_parent(), parent) {
            (None, None) => return Ok(None),
            (None, Some(_)) => {
                return Err(AccessError::validation(format!(
                    "a {org_type} must be a root organization"
                )));
            }
            (Some(required), None) => {
                return Err(AccessError::validation(format!(
                    "a {org_type} requires a {required} parent"
                )));
            }
            (Some(required), Some(parent_id)) => {
                let parent = self.organization(ctx, parent_id).await?;
                if parent.org_type != required {
                    return Err(AccessError::validation(format!(
                        "a {org_type} cannot be placed under a {}",
                        parent.org_type
                    )));
                }
                parent
            }
        };

        if let Some(moving) = moving {
            let creates_cycle = parent.id == moving
                || self
                    .parent_chain(ctx, parent.id)
                    .await?
                    .iter()
                    .any(|ancestor| ancestor.id == moving);
            if creates_cycle {
                return Err(AccessError::validation(
                    "an organization cannot be placed under itself or its descendants",
                ));
            }
        }
        Ok(Some(parent))
    }

    async fn organization(
        &self,
        ctx: &RequestContext,
        id: OrganizationId,
    ) -> AccessResult<Organization> {
        ctx.run(self.directory.organization_by_id(id))
            .await??
            .ok_or_else(|| AccessError::not_found(format!("organization {id}")))
    }
}

impl core::fmt::Debug for OrganizationHierarchy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OrganizationHierarchy")
            .field("platform_level_threshold", &self.platform_level_threshold)
            .finish_non_exhaustive()
    }
}
