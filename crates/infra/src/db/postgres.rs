//! Postgres-backed directory.
//!
//! Implements every repository trait of `tierguard_auth::store` over one
//! `PgPool`. Schema: `migrations/0001_directory.sql`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (foreign key violation) | `23503` | `Missing` |
//! | Database (other) | Any other | `Backend` |
//! | Column decode | N/A | `Corrupt` |
//! | PoolClosed, network, other | N/A | `Backend` |

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use tierguard_auth::{
    AuthProvenance, Membership, MembershipAction, MembershipHistory, Organization,
    OrganizationFilter, OrganizationRepository, OrganizationType, Permission,
    PermissionRepository, Role, RoleLevel, RoleRepository, StoreError, StoreResult, User,
    UserFilter, UserRepository,
};
use tierguard_core::{MembershipEventId, OrganizationId, PermissionId, RoleId, UserId};

const SCHEMA: &str = include_str!("../../migrations/0001_directory.sql");

/// Postgres-backed relational directory.
///
/// `Clone` is cheap: the pool is reference counted internally.
#[derive(Debug, Clone)]
pub struct PostgresDirectory {
    pool: PgPool,
}

impl PostgresDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create missing tables and indexes. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn ids<T: Copy + Into<Uuid>>(ids: &[T]) -> Vec<Uuid> {
    ids.iter().map(|id| (*id).into()).collect()
}

fn level_param(level: RoleLevel) -> i16 {
    i16::from(level.get())
}

fn limit_offset(limit: u32, offset: u32) -> (i64, i64) {
    (i64::from(limit), i64::from(offset))
}

fn count(row: PgRow, operation: &str) -> StoreResult<u64> {
    let n: i64 = row
        .try_get(0)
        .map_err(|e| map_sqlx_error(operation, e))?;
    u64::try_from(n).map_err(|_| StoreError::Corrupt(format!("negative count in {operation}")))
}

#[async_trait]
impl UserRepository for PostgresDirectory {
    async fn user_by_id(&self, id: UserId) -> StoreResult<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT id, username, password_hash, external_provider, external_subject,
                   role_id, is_active, created_at, updated_at, deleted_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("user_by_id", e))?;
        row.map(|r| decode::<UserRow, User>(&r)).transpose()
    }

    async fn user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT id, username, password_hash, external_provider, external_subject,
                   role_id, is_active, created_at, updated_at, deleted_at
            FROM users
            WHERE username = $1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("user_by_username", e))?;
        row.map(|r| decode::<UserRow, User>(&r)).transpose()
    }

    async fn user_by_external_identity(
        &self,
        provider: &str,
        subject: &str,
    ) -> StoreResult<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT id, username, password_hash, external_provider, external_subject,
                   role_id, is_active, created_at, updated_at, deleted_at
            FROM users
            WHERE external_provider = $1 AND external_subject = $2
            "#,
        )
        .bind(provider)
        .bind(subject)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("user_by_external_identity", e))?;
        row.map(|r| decode::<UserRow, User>(&r)).transpose()
    }

    #[instrument(skip_all, fields(user_id = %user.id), err)]
    async fn insert_user(&self, user: &User) -> StoreResult<()> {
        let (hash, provider, subject) = provenance_columns(&user.provenance);
        sqlx::query(
            r#"
            INSERT INTO users (
                id, username, password_hash, external_provider, external_subject,
                role_id, is_active, created_at, updated_at, deleted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(user.id.as_uuid())
        .bind(&user.username)
        .bind(hash)
        .bind(provider)
        .bind(subject)
        .bind(user.role_id.map(Uuid::from))
        .bind(user.is_active)
        .bind(user.created_at)
        .bind(user.updated_at)
        .bind(user.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_user", e))?;
        Ok(())
    }

    #[instrument(skip_all, fields(user_id = %user.id), err)]
    async fn update_user(&self, user: &User) -> StoreResult<()> {
        let (hash, provider, subject) = provenance_columns(&user.provenance);
        let result = sqlx::query(
            r#"
            UPDATE users
            SET username = $2, password_hash = $3, external_provider = $4,
                external_subject = $5, role_id = $6, is_active = $7,
                updated_at = $8, deleted_at = $9
            WHERE id = $1
            "#,
        )
        .bind(user.id.as_uuid())
        .bind(&user.username)
        .bind(hash)
        .bind(provider)
        .bind(subject)
        .bind(user.role_id.map(Uuid::from))
        .bind(user.is_active)
        .bind(user.updated_at)
        .bind(user.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_user", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Missing("user".to_string()));
        }
        Ok(())
    }

    async fn holders_at_or_above(&self, level: RoleLevel) -> StoreResult<Vec<UserId>> {
        let rows = sqlx::query(
            r#"
            SELECT u.id
            FROM users u
            JOIN roles r ON r.id = u.role_id
            WHERE u.is_active AND u.deleted_at IS NULL AND r.level >= $1
            ORDER BY u.id
            "#,
        )
        .bind(level_param(level))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("holders_at_or_above", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<Uuid, _>("id")
                    .map(UserId::from_uuid)
                    .map_err(|e| map_sqlx_error("holders_at_or_above", e))
            })
            .collect()
    }

    async fn list_users(&self, filter: &UserFilter) -> StoreResult<Vec<User>> {
        let (limit, offset) = limit_offset(filter.pagination.limit, filter.pagination.offset);
        let rows = sqlx::query(
            r#"
            SELECT u.id, u.username, u.password_hash, u.external_provider, u.external_subject,
                   u.role_id, u.is_active, u.created_at, u.updated_at, u.deleted_at
            FROM users u
            LEFT JOIN roles r ON r.id = u.role_id
            WHERE ($1 OR (u.is_active AND u.deleted_at IS NULL))
              AND ($2::uuid IS NULL OR u.id <> $2)
              AND ($3::smallint IS NULL OR COALESCE(r.level, 0) < $3)
              AND ($4::uuid[] IS NULL OR EXISTS (
                    SELECT 1 FROM user_organizations m
                    WHERE m.user_id = u.id AND m.is_active AND m.organization_id = ANY($4)
              ))
            ORDER BY u.username
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(filter.include_inactive)
        .bind(filter.exclude_user.map(Uuid::from))
        .bind(filter.below_level.map(level_param))
        .bind(filter.organization_ids.as_deref().map(ids))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_users", e))?;

        rows.iter().map(decode::<UserRow, User>).collect()
    }
}

#[async_trait]
impl RoleRepository for PostgresDirectory {
    async fn role_by_id(&self, id: RoleId) -> StoreResult<Option<Role>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, description, level, is_system, is_active,
                   organization_types, created_at, updated_at
            FROM roles
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("role_by_id", e))?;
        row.map(|r| decode::<RoleRow, Role>(&r)).transpose()
    }

    async fn role_by_name(&self, name: &str) -> StoreResult<Option<Role>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, description, level, is_system, is_active,
                   organization_types, created_at, updated_at
            FROM roles
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("role_by_name", e))?;
        row.map(|r| decode::<RoleRow, Role>(&r)).transpose()
    }

    #[instrument(skip_all, fields(role_id = %role.id), err)]
    async fn insert_role(&self, role: &Role) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO roles (
                id, name, description, level, is_system, is_active,
                organization_types, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(role.id.as_uuid())
        .bind(&role.name)
        .bind(&role.description)
        .bind(level_param(role.level))
        .bind(role.is_system)
        .bind(role.is_active)
        .bind(type_names(&role.organization_types))
        .bind(role.created_at)
        .bind(role.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_role", e))?;
        Ok(())
    }

    #[instrument(skip_all, fields(role_id = %role.id), err)]
    async fn update_role(&self, role: &Role) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE roles
            SET name = $2, description = $3, level = $4, is_system = $5,
                is_active = $6, organization_types = $7, updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(role.id.as_uuid())
        .bind(&role.name)
        .bind(&role.description)
        .bind(level_param(role.level))
        .bind(role.is_system)
        .bind(role.is_active)
        .bind(type_names(&role.organization_types))
        .bind(role.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_role", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Missing("role".to_string()));
        }
        Ok(())
    }

    async fn delete_role(&self, id: RoleId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM roles WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_role", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn role_reference_count(&self, id: RoleId) -> StoreResult<u64> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM users WHERE role_id = $1)
                 + (SELECT COUNT(*) FROM user_organizations WHERE role_id = $1)
            "#,
        )
        .bind(id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("role_reference_count", e))?;
        count(row, "role_reference_count")
    }

    async fn permissions_for_role(&self, id: RoleId) -> StoreResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT p.name
            FROM role_permissions rp
            JOIN permissions p ON p.id = rp.permission_id
            WHERE rp.role_id = $1
            ORDER BY p.name
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("permissions_for_role", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("name")
                    .map_err(|e| map_sqlx_error("permissions_for_role", e))
            })
            .collect()
    }

    /// Delete and re-insert inside one transaction; a failure leaves the
    /// previous set intact.
    #[instrument(skip_all, fields(role_id = %id, count = permissions.len()), err)]
    async fn replace_role_permissions(
        &self,
        id: RoleId,
        permissions: &[PermissionId],
    ) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let exists = sqlx::query("SELECT 1 FROM roles WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("replace_role_permissions", e))?;
        if exists.is_none() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::Missing("role".to_string()));
        }

        sqlx::query("DELETE FROM role_permissions WHERE role_id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("replace_role_permissions", e))?;

        if !permissions.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO role_permissions (role_id, permission_id)
                SELECT $1, UNNEST($2::uuid[])
                "#,
            )
            .bind(id.as_uuid())
            .bind(ids(permissions))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("replace_role_permissions", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(())
    }
}

#[async_trait]
impl PermissionRepository for PostgresDirectory {
    async fn permission_by_name(&self, name: &str) -> StoreResult<Option<Permission>> {
        let row = sqlx::query(
            "SELECT id, name, description, created_at FROM permissions WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("permission_by_name", e))?;
        row.map(|r| decode::<PermissionRow, Permission>(&r))
            .transpose()
    }

    async fn list_permissions(&self) -> StoreResult<Vec<Permission>> {
        let rows =
            sqlx::query("SELECT id, name, description, created_at FROM permissions ORDER BY name")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("list_permissions", e))?;
        rows.iter().map(decode::<PermissionRow, Permission>).collect()
    }

    async fn insert_permission(&self, permission: &Permission) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO permissions (id, name, description, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(permission.id.as_uuid())
        .bind(&permission.name)
        .bind(&permission.description)
        .bind(permission.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_permission", e))?;
        Ok(())
    }

    async fn delete_permission(&self, id: PermissionId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM permissions WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_permission", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn permission_reference_count(&self, id: PermissionId) -> StoreResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) FROM role_permissions WHERE permission_id = $1")
            .bind(id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("permission_reference_count", e))?;
        count(row, "permission_reference_count")
    }
}

#[async_trait]
impl OrganizationRepository for PostgresDirectory {
    async fn organization_by_id(&self, id: OrganizationId) -> StoreResult<Option<Organization>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, code, org_type, parent_id, is_active, created_by,
                   created_at, updated_at
            FROM organizations
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("organization_by_id", e))?;
        row.map(|r| decode::<OrganizationRow, Organization>(&r))
            .transpose()
    }

    #[instrument(skip_all, fields(organization_id = %organization.id), err)]
    async fn insert_organization(&self, organization: &Organization) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO organizations (
                id, name, code, org_type, parent_id, is_active, created_by,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(organization.id.as_uuid())
        .bind(&organization.name)
        .bind(&organization.code)
        .bind(organization.org_type.as_str())
        .bind(organization.parent_id.map(Uuid::from))
        .bind(organization.is_active)
        .bind(organization.created_by.map(Uuid::from))
        .bind(organization.created_at)
        .bind(organization.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_organization", e))?;
        Ok(())
    }

    #[instrument(skip_all, fields(organization_id = %organization.id), err)]
    async fn update_organization(&self, organization: &Organization) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE organizations
            SET name = $2, code = $3, org_type = $4, parent_id = $5,
                is_active = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(organization.id.as_uuid())
        .bind(&organization.name)
        .bind(&organization.code)
        .bind(organization.org_type.as_str())
        .bind(organization.parent_id.map(Uuid::from))
        .bind(organization.is_active)
        .bind(organization.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_organization", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Missing("organization".to_string()));
        }
        Ok(())
    }

    async fn child_organizations(&self, parent: OrganizationId) -> StoreResult<Vec<Organization>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, code, org_type, parent_id, is_active, created_by,
                   created_at, updated_at
            FROM organizations
            WHERE parent_id = $1
            ORDER BY code
            "#,
        )
        .bind(parent.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("child_organizations", e))?;
        rows.iter()
            .map(decode::<OrganizationRow, Organization>)
            .collect()
    }

    async fn list_organizations(&self, filter: &OrganizationFilter) -> StoreResult<Vec<Organization>> {
        let (limit, offset) = limit_offset(filter.pagination.limit, filter.pagination.offset);
        let rows = sqlx::query(
            r#"
            SELECT id, name, code, org_type, parent_id, is_active, created_by,
                   created_at, updated_at
            FROM organizations
            WHERE ($1 OR is_active)
              AND ($2::text IS NULL OR org_type = $2)
              AND ($3::uuid IS NULL OR parent_id = $3)
              AND ($4::uuid[] IS NULL OR id = ANY($4))
            ORDER BY code
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(filter.include_inactive)
        .bind(filter.org_type.map(OrganizationType::as_str))
        .bind(filter.parent_id.map(Uuid::from))
        .bind(filter.ids.as_deref().map(ids))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_organizations", e))?;
        rows.iter()
            .map(decode::<OrganizationRow, Organization>)
            .collect()
    }

    async fn membership(
        &self,
        user: UserId,
        organization: OrganizationId,
    ) -> StoreResult<Option<Membership>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, organization_id, role_id, is_active, joined_at, updated_at
            FROM user_organizations
            WHERE user_id = $1 AND organization_id = $2
            "#,
        )
        .bind(user.as_uuid())
        .bind(organization.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("membership", e))?;
        row.map(|r| decode::<MembershipRow, Membership>(&r))
            .transpose()
    }

    async fn memberships_for_user(&self, user: UserId) -> StoreResult<Vec<Membership>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, organization_id, role_id, is_active, joined_at, updated_at
            FROM user_organizations
            WHERE user_id = $1
            ORDER BY organization_id
            "#,
        )
        .bind(user.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("memberships_for_user", e))?;
        rows.iter().map(decode::<MembershipRow, Membership>).collect()
    }

    #[instrument(skip_all, fields(user_id = %membership.user_id, organization_id = %membership.organization_id), err)]
    async fn upsert_membership(&self, membership: &Membership) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_organizations (
                user_id, organization_id, role_id, is_active, joined_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, organization_id) DO UPDATE
            SET role_id = EXCLUDED.role_id,
                is_active = EXCLUDED.is_active,
                joined_at = EXCLUDED.joined_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(membership.user_id.as_uuid())
        .bind(membership.organization_id.as_uuid())
        .bind(membership.role_id.map(Uuid::from))
        .bind(membership.is_active)
        .bind(membership.joined_at)
        .bind(membership.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_membership", e))?;
        Ok(())
    }

    async fn append_membership_history(&self, record: &MembershipHistory) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_organization_history (
                id, user_id, organization_id, action, previous_role_id, new_role_id,
                previous_active, new_active, actor_id, reason, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.user_id.as_uuid())
        .bind(record.organization_id.as_uuid())
        .bind(record.action.as_str())
        .bind(record.previous_role_id.map(Uuid::from))
        .bind(record.new_role_id.map(Uuid::from))
        .bind(record.previous_active)
        .bind(record.new_active)
        .bind(record.actor_id.as_uuid())
        .bind(record.reason.as_deref())
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_membership_history", e))?;
        Ok(())
    }

    async fn membership_history(
        &self,
        user: UserId,
        organization: OrganizationId,
    ) -> StoreResult<Vec<MembershipHistory>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, organization_id, action, previous_role_id, new_role_id,
                   previous_active, new_active, actor_id, reason, recorded_at
            FROM user_organization_history
            WHERE user_id = $1 AND organization_id = $2
            ORDER BY recorded_at ASC, id ASC
            "#,
        )
        .bind(user.as_uuid())
        .bind(organization.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("membership_history", e))?;
        rows.iter()
            .map(decode::<HistoryRow, MembershipHistory>)
            .collect()
    }
}

/// Map SQLx errors onto `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let what = db_err
                .constraint()
                .map(str::to_string)
                .unwrap_or_else(|| operation.to_string());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Duplicate(what),
                Some("23503") => StoreError::Missing(what),
                _ => StoreError::Backend(format!(
                    "database error in {operation}: {}",
                    db_err.message()
                )),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Corrupt(format!("{operation}: {err}"))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

/// Decode a row through its intermediate row type into the domain type.
fn decode<R, T>(row: &PgRow) -> StoreResult<T>
where
    R: for<'r> FromRow<'r, PgRow>,
    T: TryFrom<R, Error = StoreError>,
{
    let raw = R::from_row(row).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    T::try_from(raw)
}

fn provenance_columns(
    provenance: &AuthProvenance,
) -> (Option<&str>, Option<&str>, Option<&str>) {
    match provenance {
        AuthProvenance::Local { password_hash } => (Some(password_hash.as_str()), None, None),
        AuthProvenance::External { provider, subject } => {
            (None, Some(provider.as_str()), Some(subject.as_str()))
        }
    }
}

fn type_names(types: &BTreeSet<OrganizationType>) -> Vec<String> {
    types.iter().map(|t| t.as_str().to_string()).collect()
}

fn parse_level(raw: i16) -> StoreResult<RoleLevel> {
    u8::try_from(raw)
        .ok()
        .and_then(|l| RoleLevel::new(l).ok())
        .ok_or_else(|| StoreError::Corrupt(format!("role level {raw} out of range")))
}

fn parse_org_type(raw: &str) -> StoreResult<OrganizationType> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("unknown organization type '{raw}'")))
}

#[derive(Debug)]
struct UserRow {
    id: Uuid,
    username: String,
    password_hash: Option<String>,
    external_provider: Option<String>,
    external_subject: Option<String>,
    role_id: Option<Uuid>,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for UserRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(UserRow {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            password_hash: row.try_get("password_hash")?,
            external_provider: row.try_get("external_provider")?,
            external_subject: row.try_get("external_subject")?,
            role_id: row.try_get("role_id")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let provenance = match (row.password_hash, row.external_provider, row.external_subject) {
            (Some(password_hash), None, None) => AuthProvenance::Local { password_hash },
            (None, Some(provider), Some(subject)) => AuthProvenance::External { provider, subject },
            _ => {
                return Err(StoreError::Corrupt(format!(
                    "user {} has no single provenance",
                    row.id
                )));
            }
        };
        Ok(User {
            id: UserId::from_uuid(row.id),
            username: row.username,
            provenance,
            role_id: row.role_id.map(RoleId::from_uuid),
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(Debug)]
struct RoleRow {
    id: Uuid,
    name: String,
    description: String,
    level: i16,
    is_system: bool,
    is_active: bool,
    organization_types: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for RoleRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(RoleRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            level: row.try_get("level")?,
            is_system: row.try_get("is_system")?,
            is_active: row.try_get("is_active")?,
            organization_types: row.try_get("organization_types")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<RoleRow> for Role {
    type Error = StoreError;

    fn try_from(row: RoleRow) -> Result<Self, Self::Error> {
        Ok(Role {
            id: RoleId::from_uuid(row.id),
            name: row.name,
            description: row.description,
            level: parse_level(row.level)?,
            is_system: row.is_system,
            is_active: row.is_active,
            organization_types: row
                .organization_types
                .iter()
                .map(|t| parse_org_type(t))
                .collect::<StoreResult<_>>()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct PermissionRow {
    id: Uuid,
    name: String,
    description: String,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for PermissionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(PermissionRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<PermissionRow> for Permission {
    type Error = StoreError;

    fn try_from(row: PermissionRow) -> Result<Self, Self::Error> {
        Ok(Permission {
            id: PermissionId::from_uuid(row.id),
            name: row.name,
            description: row.description,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct OrganizationRow {
    id: Uuid,
    name: String,
    code: String,
    org_type: String,
    parent_id: Option<Uuid>,
    is_active: bool,
    created_by: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for OrganizationRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OrganizationRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            code: row.try_get("code")?,
            org_type: row.try_get("org_type")?,
            parent_id: row.try_get("parent_id")?,
            is_active: row.try_get("is_active")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<OrganizationRow> for Organization {
    type Error = StoreError;

    fn try_from(row: OrganizationRow) -> Result<Self, Self::Error> {
        Ok(Organization {
            id: OrganizationId::from_uuid(row.id),
            name: row.name,
            code: row.code,
            org_type: parse_org_type(&row.org_type)?,
            parent_id: row.parent_id.map(OrganizationId::from_uuid),
            is_active: row.is_active,
            created_by: row.created_by.map(UserId::from_uuid),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct MembershipRow {
    user_id: Uuid,
    organization_id: Uuid,
    role_id: Option<Uuid>,
    is_active: bool,
    joined_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for MembershipRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(MembershipRow {
            user_id: row.try_get("user_id")?,
            organization_id: row.try_get("organization_id")?,
            role_id: row.try_get("role_id")?,
            is_active: row.try_get("is_active")?,
            joined_at: row.try_get("joined_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<MembershipRow> for Membership {
    type Error = StoreError;

    fn try_from(row: MembershipRow) -> Result<Self, Self::Error> {
        Ok(Membership {
            user_id: UserId::from_uuid(row.user_id),
            organization_id: OrganizationId::from_uuid(row.organization_id),
            role_id: row.role_id.map(RoleId::from_uuid),
            is_active: row.is_active,
            joined_at: row.joined_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct HistoryRow {
    id: Uuid,
    user_id: Uuid,
    organization_id: Uuid,
    action: String,
    previous_role_id: Option<Uuid>,
    new_role_id: Option<Uuid>,
    previous_active: Option<bool>,
    new_active: bool,
    actor_id: Uuid,
    reason: Option<String>,
    recorded_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for HistoryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(HistoryRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            organization_id: row.try_get("organization_id")?,
            action: row.try_get("action")?,
            previous_role_id: row.try_get("previous_role_id")?,
            new_role_id: row.try_get("new_role_id")?,
            previous_active: row.try_get("previous_active")?,
            new_active: row.try_get("new_active")?,
            actor_id: row.try_get("actor_id")?,
            reason: row.try_get("reason")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

impl TryFrom<HistoryRow> for MembershipHistory {
    type Error = StoreError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        let action: MembershipAction = row
            .action
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("unknown membership action '{}'", row.action)))?;
        Ok(MembershipHistory {
            id: MembershipEventId::from_uuid(row.id),
            user_id: UserId::from_uuid(row.user_id),
            organization_id: OrganizationId::from_uuid(row.organization_id),
            action,
            previous_role_id: row.previous_role_id.map(RoleId::from_uuid),
            new_role_id: row.new_role_id.map(RoleId::from_uuid),
            previous_active: row.previous_active,
            new_active: row.new_active,
            actor_id: UserId::from_uuid(row.actor_id),
            reason: row.reason,
            recorded_at: row.recorded_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_row() -> UserRow {
        let now = Utc::now();
        UserRow {
            id: Uuid::now_v7(),
            username: "alice".into(),
            password_hash: Some("$argon2id$hash".into()),
            external_provider: None,
            external_subject: None,
            role_id: None,
            is_active: true,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn user_rows_decode_exactly_one_provenance() {
        let user = User::try_from(user_row()).unwrap();
        assert_eq!(user.password_hash(), Some("$argon2id$hash"));

        let external = UserRow {
            password_hash: None,
            external_provider: Some("github".into()),
            external_subject: Some("42".into()),
            ..user_row()
        };
        assert!(matches!(
            User::try_from(external).unwrap().provenance,
            AuthProvenance::External { .. }
        ));

        let both = UserRow {
            external_provider: Some("github".into()),
            external_subject: Some("42".into()),
            ..user_row()
        };
        assert!(matches!(User::try_from(both), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn role_rows_reject_out_of_range_levels_and_unknown_types() {
        let now = Utc::now();
        let row = || RoleRow {
            id: Uuid::now_v7(),
            name: "manager".into(),
            description: String::new(),
            level: 50,
            is_system: false,
            is_active: true,
            organization_types: vec!["company".into(), "store".into()],
            created_at: now,
            updated_at: now,
        };
        let role = Role::try_from(row()).unwrap();
        assert_eq!(role.level, RoleLevel::saturating(50));
        assert!(role.applies_to(OrganizationType::Store));

        assert!(matches!(
            Role::try_from(RoleRow { level: 101, ..row() }),
            Err(StoreError::Corrupt(_))
        ));
        assert!(matches!(
            Role::try_from(RoleRow { level: -1, ..row() }),
            Err(StoreError::Corrupt(_))
        ));
        assert!(matches!(
            Role::try_from(RoleRow {
                organization_types: vec!["platform".into()],
                ..row()
            }),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn provenance_maps_onto_exclusive_columns() {
        let local = AuthProvenance::Local {
            password_hash: "h".into(),
        };
        assert_eq!(provenance_columns(&local), (Some("h"), None, None));

        let external = AuthProvenance::External {
            provider: "oidc".into(),
            subject: "s".into(),
        };
        assert_eq!(provenance_columns(&external), (None, Some("oidc"), Some("s")));
    }

    #[test]
    fn pool_closed_is_a_backend_failure() {
        assert!(matches!(
            map_sqlx_error("op", sqlx::Error::PoolClosed),
            StoreError::Backend(_)
        ));
    }
}
