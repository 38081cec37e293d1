//! Role assignment and management rules.
//!
//! All checks compare *levels*; a principal without a role ranks at zero.
//! The rules are:
//!
//! - an actor only acts on roles (and principals) strictly below its own level
//! - nobody changes their own role
//! - the apex role is assignable only by a super holder, and only one
//!   principal may hold it
//! - the role carrying the reserved super name is guarded independently of
//!   its stored level
//! - system roles keep their name and cannot be deleted

use std::sync::Arc;

use tierguard_core::{AccessError, AccessResult, RequestContext, UserId};

use crate::principal::{Principal, RoleAssignment};
use crate::roles::{NewRole, Role, RoleLevel, RoleUpdate, SUPER_ROLE_NAME, validate_role_name};
use crate::store::Directory;

#[derive(Clone)]
pub struct RoleHierarchy {
    directory: Arc<dyn Directory>,
    custom_role_level_floor: RoleLevel,
}

impl RoleHierarchy {
    pub fn new(directory: Arc<dyn Directory>, custom_role_level_floor: RoleLevel) -> Self {
        Self {
            directory,
            custom_role_level_floor,
        }
    }

    pub fn custom_role_level_floor(&self) -> RoleLevel {
        self.custom_role_level_floor
    }

    /// May `actor` bind `role` to `target`, whose current global role is
    /// `current`?
    ///
    /// Apex uniqueness needs the store and is checked separately by
    /// [`RoleHierarchy::ensure_super_available`].
    pub fn ensure_can_assign(
        &self,
        actor: &Principal,
        target: UserId,
        current: &RoleAssignment,
        role: &Role,
    ) -> AccessResult<()> {
        ensure_not_self(actor, target)?;
        ensure_can_bind(actor, role)?;
        ensure_outranks_target(actor, current)
    }

    /// May `actor` strip `target`'s current role?
    pub fn ensure_can_revoke(
        &self,
        actor: &Principal,
        target: UserId,
        current: &RoleAssignment,
    ) -> AccessResult<()> {
        ensure_not_self(actor, target)?;
        if current.is_super() && !actor.is_super() {
            return Err(AccessError::forbidden("only a super holder may revoke the super role"));
        }
        ensure_outranks_target(actor, current)
    }

    /// May `actor` act on `target` as a whole (deactivate, revoke sessions,
    /// change a membership)? Requires strict seniority and forbids self-action.
    pub fn ensure_can_manage(
        &self,
        actor: &Principal,
        target: UserId,
        current: &RoleAssignment,
    ) -> AccessResult<()> {
        ensure_not_self(actor, target)?;
        ensure_outranks_target(actor, current)
    }

    /// Fail with `Conflict` when someone other than `target` already holds an
    /// apex-level role.
    pub async fn ensure_super_available(
        &self,
        ctx: &RequestContext,
        target: UserId,
    ) -> AccessResult<()> {
        let holders = ctx
            .run(self.directory.holders_at_or_above(RoleLevel::SUPER))
            .await??;
        if holders.iter().any(|holder| *holder != target) {
            tracing::warn!(%target, "rejected second super role holder");
            return Err(AccessError::conflict("the super role already has a holder"));
        }
        Ok(())
    }

    /// Validate a new custom role against the creation band
    /// `[custom_role_level_floor, 100)` and the creator's own level.
    pub fn ensure_can_create(&self, actor: &Principal, new: &NewRole) -> AccessResult<RoleLevel> {
        validate_role_name(&new.name)?;
        let level = RoleLevel::new(new.level)?;

        if level.is_super() || new.name.trim() == SUPER_ROLE_NAME {
            return Err(reserved_for_seeded_super(actor));
        }
        self.ensure_in_band(level)?;
        if !actor.level().outranks(level) {
            return Err(AccessError::forbidden(format!(
                "cannot create a role at level {level} from level {}",
                actor.level()
            )));
        }
        Ok(level)
    }

    /// May `actor` apply `update` to `role`?
    pub fn ensure_can_modify(
        &self,
        actor: &Principal,
        role: &Role,
        update: &RoleUpdate,
    ) -> AccessResult<()> {
        if role.is_super() {
            if !actor.is_super() {
                return Err(AccessError::forbidden("only a super holder may modify the super role"));
            }
            if update.level.is_some_and(|l| l != role.level.get())
                || update.is_active == Some(false)
                || update.organization_types.is_some()
            {
                return Err(AccessError::validation(
                    "only the super role's description may change",
                ));
            }
        } else if !actor.level().outranks(role.level) {
            return Err(AccessError::forbidden(format!(
                "cannot modify a role at level {} from level {}",
                role.level,
                actor.level()
            )));
        }

        if let Some(name) = &update.name {
            validate_role_name(name)?;
            if role.is_system && name != &role.name {
                return Err(AccessError::forbidden("system roles cannot be renamed"));
            }
            if name.trim() == SUPER_ROLE_NAME && !role.is_super() {
                return Err(reserved_for_seeded_super(actor));
            }
        }

        if let Some(raw) = update.level {
            if !role.is_super() {
                let level = RoleLevel::new(raw)?;
                if level.is_super() {
                    return Err(reserved_for_seeded_super(actor));
                }
                self.ensure_in_band(level)?;
                if !actor.level().outranks(level) {
                    return Err(AccessError::forbidden(format!(
                        "cannot raise a role to level {level} from level {}",
                        actor.level()
                    )));
                }
            }
        }
        Ok(())
    }

    /// May `actor` delete `role`? Reference checks are the caller's job.
    pub fn ensure_can_delete(&self, actor: &Principal, role: &Role) -> AccessResult<()> {
        if role.is_system || role.is_super() {
            return Err(AccessError::forbidden("system roles cannot be deleted"));
        }
        if !actor.level().outranks(role.level) {
            return Err(AccessError::forbidden(format!(
                "cannot delete a role at level {} from level {}",
                role.level,
                actor.level()
            )));
        }
        Ok(())
    }

    /// May `actor` edit the permission set of `role`?
    pub fn ensure_can_grant(&self, actor: &Principal, role: &Role) -> AccessResult<()> {
        if role.is_super() {
            return Err(AccessError::validation(
                "the super role carries no explicit permissions",
            ));
        }
        if !actor.level().outranks(role.level) {
            return Err(AccessError::forbidden(format!(
                "cannot edit permissions of a role at level {} from level {}",
                role.level,
                actor.level()
            )));
        }
        Ok(())
    }

    fn ensure_in_band(&self, level: RoleLevel) -> AccessResult<()> {
        if level < self.custom_role_level_floor {
            return Err(AccessError::validation(format!(
                "custom role level must be at least {}",
                self.custom_role_level_floor
            )));
        }
        Ok(())
    }
}

impl core::fmt::Debug for RoleHierarchy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RoleHierarchy")
            .field("custom_role_level_floor", &self.custom_role_level_floor)
            .finish_non_exhaustive()
    }
}

/// May `actor` bind `role` to anyone (globally or through a membership)?
pub(crate) fn ensure_can_bind(actor: &Principal, role: &Role) -> AccessResult<()> {
    if role.is_super() {
        // Name guard and apex guard collapse here: both need a super actor.
        if !actor.is_super() {
            return Err(AccessError::forbidden("only a super holder may assign the super role"));
        }
        return Ok(());
    }
    if !actor.level().outranks(role.level) {
        return Err(AccessError::forbidden(format!(
            "cannot assign a role at level {} from level {}",
            role.level,
            actor.level()
        )));
    }
    Ok(())
}

fn ensure_not_self(actor: &Principal, target: UserId) -> AccessResult<()> {
    if actor.user_id == target {
        return Err(AccessError::forbidden("principals cannot change their own role"));
    }
    Ok(())
}

fn ensure_outranks_target(actor: &Principal, current: &RoleAssignment) -> AccessResult<()> {
    if !actor.level().outranks(current.level()) {
        return Err(AccessError::forbidden(format!(
            "target holds level {} which is not below {}",
            current.level(),
            actor.level()
        )));
    }
    Ok(())
}

fn reserved_for_seeded_super(actor: &Principal) -> AccessError {
    if actor.is_super() {
        AccessError::validation("level 100 and the super role name are reserved for the seeded role")
    } else {
        AccessError::forbidden("level 100 and the super role name are reserved")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Utc;
    use proptest::prelude::*;
    use tierguard_core::RoleId;

    use super::*;
    use crate::principal::RoleRef;
    use crate::store::{InMemoryDirectory, RoleRepository, UserRepository};

    fn hierarchy() -> RoleHierarchy {
        RoleHierarchy::new(InMemoryDirectory::arc(), RoleLevel::saturating(10))
    }

    fn role(level: u8) -> Role {
        let now = Utc::now();
        Role {
            id: RoleId::new(),
            name: format!("role-{level}"),
            description: String::new(),
            level: RoleLevel::saturating(level),
            is_system: false,
            is_active: true,
            organization_types: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn assigned(role: &Role) -> RoleAssignment {
        RoleAssignment::Assigned(RoleRef {
            id: role.id,
            level: role.level,
            name: role.name.clone(),
        })
    }

    fn actor_at(level: u8) -> Principal {
        Principal {
            user_id: UserId::new(),
            assignment: assigned(&role(level)),
        }
    }

    fn super_actor() -> Principal {
        Principal {
            user_id: UserId::new(),
            assignment: assigned(&Role::seeded_super(Utc::now())),
        }
    }

    fn new_role(level: u8) -> NewRole {
        NewRole {
            name: format!("custom-{level}"),
            description: String::new(),
            level,
            organization_types: BTreeSet::new(),
        }
    }

    #[test]
    fn self_change_is_forbidden_even_for_super() {
        let h = hierarchy();
        let actor = super_actor();
        let err = h
            .ensure_can_assign(&actor, actor.user_id, &actor.assignment, &role(10))
            .unwrap_err();
        assert!(matches!(err, AccessError::Forbidden(_)));
    }

    #[test]
    fn equal_level_assignment_is_forbidden() {
        let h = hierarchy();
        let actor = actor_at(50);
        let err = h
            .ensure_can_assign(&actor, UserId::new(), &RoleAssignment::NoRole, &role(50))
            .unwrap_err();
        assert!(matches!(err, AccessError::Forbidden(_)));
    }

    #[test]
    fn target_must_currently_rank_below_actor() {
        let h = hierarchy();
        let actor = actor_at(50);
        let peer = assigned(&role(50));
        assert!(matches!(
            h.ensure_can_assign(&actor, UserId::new(), &peer, &role(20)),
            Err(AccessError::Forbidden(_))
        ));
        assert!(matches!(
            h.ensure_can_revoke(&actor, UserId::new(), &peer),
            Err(AccessError::Forbidden(_))
        ));
    }

    #[test]
    fn super_role_needs_super_actor() {
        let h = hierarchy();
        let apex = Role::seeded_super(Utc::now());
        assert!(matches!(
            h.ensure_can_assign(&actor_at(99), UserId::new(), &RoleAssignment::NoRole, &apex),
            Err(AccessError::Forbidden(_))
        ));
        assert!(
            h.ensure_can_assign(&super_actor(), UserId::new(), &RoleAssignment::NoRole, &apex)
                .is_ok()
        );
    }

    #[test]
    fn reserved_name_is_guarded_regardless_of_level() {
        let h = hierarchy();
        let mut impostor = role(20);
        impostor.name = SUPER_ROLE_NAME.to_string();
        assert!(matches!(
            h.ensure_can_assign(&actor_at(90), UserId::new(), &RoleAssignment::NoRole, &impostor),
            Err(AccessError::Forbidden(_))
        ));
    }

    #[test]
    fn creation_band() {
        let h = hierarchy();
        assert!(matches!(
            h.ensure_can_create(&actor_at(40), &new_role(50)),
            Err(AccessError::Forbidden(_))
        ));
        assert!(matches!(
            h.ensure_can_create(&actor_at(90), &new_role(5)),
            Err(AccessError::Validation(_))
        ));
        assert!(matches!(
            h.ensure_can_create(&actor_at(90), &new_role(100)),
            Err(AccessError::Forbidden(_))
        ));
        assert!(matches!(
            h.ensure_can_create(&super_actor(), &new_role(100)),
            Err(AccessError::Validation(_))
        ));
        assert_eq!(
            h.ensure_can_create(&actor_at(90), &new_role(89)).unwrap(),
            RoleLevel::saturating(89)
        );
    }

    #[test]
    fn system_roles_keep_their_name_and_survive() {
        let h = hierarchy();
        let mut system = role(30);
        system.is_system = true;
        let rename = RoleUpdate {
            name: Some("renamed".to_string()),
            ..RoleUpdate::default()
        };
        assert!(matches!(
            h.ensure_can_modify(&actor_at(90), &system, &rename),
            Err(AccessError::Forbidden(_))
        ));
        assert!(matches!(
            h.ensure_can_delete(&super_actor(), &system),
            Err(AccessError::Forbidden(_))
        ));
    }

    #[test]
    fn super_role_only_takes_description_changes() {
        let h = hierarchy();
        let apex = Role::seeded_super(Utc::now());
        let describe = RoleUpdate {
            description: Some("root of trust".to_string()),
            ..RoleUpdate::default()
        };
        assert!(h.ensure_can_modify(&super_actor(), &apex, &describe).is_ok());
        assert!(matches!(
            h.ensure_can_modify(&actor_at(99), &apex, &describe),
            Err(AccessError::Forbidden(_))
        ));
        let demote = RoleUpdate {
            level: Some(50),
            ..RoleUpdate::default()
        };
        assert!(matches!(
            h.ensure_can_modify(&super_actor(), &apex, &demote),
            Err(AccessError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn second_super_holder_conflicts() {
        let directory = InMemoryDirectory::arc();
        let apex = Role::seeded_super(Utc::now());
        directory.insert_role(&apex).await.unwrap();

        let mut holder = crate::principal::User::local("root", "h").unwrap();
        holder.role_id = Some(apex.id);
        directory.insert_user(&holder).await.unwrap();

        let h = RoleHierarchy::new(directory, RoleLevel::saturating(10));
        let ctx = RequestContext::new();

        assert!(h.ensure_super_available(&ctx, holder.id).await.is_ok());
        assert!(matches!(
            h.ensure_super_available(&ctx, UserId::new()).await,
            Err(AccessError::Conflict(_))
        ));
    }

    proptest! {
        #[test]
        fn assignment_succeeds_iff_role_is_strictly_below_actor(
            actor_level in 0u8..100,
            role_level in 10u8..100,
        ) {
            let h = hierarchy();
            let actor = actor_at(actor_level);
            let res = h.ensure_can_assign(&actor, UserId::new(), &RoleAssignment::NoRole, &role(role_level));
            if role_level < actor_level {
                prop_assert!(res.is_ok());
            } else {
                prop_assert!(matches!(res, Err(AccessError::Forbidden(_))));
            }
        }

        #[test]
        fn creation_never_reaches_the_creator(actor_level in 0u8..100, level in 0u8..=100) {
            let h = hierarchy();
            if let Ok(created) = h.ensure_can_create(&actor_at(actor_level), &new_role(level)) {
                prop_assert!(created.get() < actor_level);
                prop_assert!(created.get() >= 10);
            }
        }
    }
}
