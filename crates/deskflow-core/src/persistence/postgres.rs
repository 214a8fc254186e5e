// Copyright (C) 2025 The deskflow-core contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.
//!
//! Same contract as the SQLite backend; queries differ only in placeholder
//! syntax and the explicit casts Postgres needs for nullable parameters.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use crate::error::DeskError;

use super::{
    AgentCredentialsRecord, AgentRecord, AttachmentRecord, Catalog, CatalogEntry, CommentRecord,
    HistoryKind, NewAgent, NewAttachment, NewHistoryEntry, NewTicketRecord, NewUser, Persistence,
    PermissionRecord, RoleRecord, TICKET_COLUMNS, TicketFilter, TicketHistoryRecord, TicketRecord,
    TicketTagRecord, UserRecord, relation_key,
};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const AGENT_COLUMNS: &str = "id, name, email, phone, role_id, supervisor_id, team_id, unit_id, \
     created_at, updated_at, deactivated_at";

async fn insert_history(
    conn: &mut PgConnection,
    ticket_id: i64,
    entry: &NewHistoryEntry,
    at: DateTime<Utc>,
) -> Result<(), DeskError> {
    sqlx::query(
        r#"
        INSERT INTO ticket_history (ticket_id, kind, from_value, to_value, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(ticket_id)
    .bind(entry.kind.as_str())
    .bind(&entry.from_value)
    .bind(&entry.to_value)
    .bind(at)
    .execute(conn)
    .await?;

    Ok(())
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn health_check_db(&self) -> Result<bool, DeskError> {
        let result: Result<(i32,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }

    // ========================================================================
    // Agents
    // ========================================================================

    async fn create_agent(&self, agent: &NewAgent) -> Result<AgentRecord, DeskError> {
        let sql = format!(
            r#"
            INSERT INTO agents (name, email, phone, role_id, supervisor_id, team_id, unit_id,
                                created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            RETURNING {AGENT_COLUMNS}
            "#
        );
        let record = sqlx::query_as::<_, AgentRecord>(&sql)
            .bind(&agent.name)
            .bind(&agent.email)
            .bind(&agent.phone)
            .bind(agent.role_id)
            .bind(agent.supervisor_id)
            .bind(agent.team_id)
            .bind(agent.unit_id)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DeskError::from(e).with_entity("agent"))?;

        Ok(record)
    }

    async fn get_agent(&self, agent_id: i64) -> Result<Option<AgentRecord>, DeskError> {
        let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = $1");
        let record = sqlx::query_as::<_, AgentRecord>(&sql)
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn update_agent(&self, agent: &AgentRecord) -> Result<AgentRecord, DeskError> {
        let sql = format!(
            r#"
            UPDATE agents
            SET name = $1, email = $2, phone = $3, role_id = $4, supervisor_id = $5,
                team_id = $6, unit_id = $7, updated_at = $8
            WHERE id = $9
            RETURNING {AGENT_COLUMNS}
            "#
        );
        let record = sqlx::query_as::<_, AgentRecord>(&sql)
            .bind(&agent.name)
            .bind(&agent.email)
            .bind(&agent.phone)
            .bind(agent.role_id)
            .bind(agent.supervisor_id)
            .bind(agent.team_id)
            .bind(agent.unit_id)
            .bind(Utc::now())
            .bind(agent.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DeskError::from(e).with_entity("agent"))?;

        record.ok_or_else(|| DeskError::not_found("agent", agent.id))
    }

    async fn delete_agent(&self, agent_id: i64) -> Result<(), DeskError> {
        let result = sqlx::query("DELETE FROM agents WHERE id = $1")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DeskError::not_found("agent", agent_id));
        }
        Ok(())
    }

    async fn deactivate_agent(&self, agent_id: i64) -> Result<AgentRecord, DeskError> {
        let sql = format!(
            r#"
            UPDATE agents
            SET deactivated_at = COALESCE(deactivated_at, $1), updated_at = $1
            WHERE id = $2
            RETURNING {AGENT_COLUMNS}
            "#
        );
        let record = sqlx::query_as::<_, AgentRecord>(&sql)
            .bind(Utc::now())
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;

        record.ok_or_else(|| DeskError::not_found("agent", agent_id))
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, DeskError> {
        let sql = format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE deactivated_at IS NULL ORDER BY id"
        );
        let rows = sqlx::query_as::<_, AgentRecord>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn set_agent_primary_role(
        &self,
        agent_id: i64,
        role_id: Option<i64>,
    ) -> Result<(), DeskError> {
        let result = sqlx::query("UPDATE agents SET role_id = $1, updated_at = $2 WHERE id = $3")
            .bind(role_id)
            .bind(Utc::now())
            .bind(agent_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DeskError::not_found("agent", agent_id));
        }
        Ok(())
    }

    async fn upsert_agent_credentials(
        &self,
        agent_id: i64,
        username: &str,
        password_hash: &str,
    ) -> Result<AgentCredentialsRecord, DeskError> {
        let record = sqlx::query_as::<_, AgentCredentialsRecord>(
            r#"
            INSERT INTO agent_login_credentials (agent_id, username, password_hash, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (agent_id) DO UPDATE SET
                username = EXCLUDED.username,
                password_hash = EXCLUDED.password_hash,
                updated_at = EXCLUDED.updated_at
            RETURNING agent_id, username, password_hash, updated_at
            "#,
        )
        .bind(agent_id)
        .bind(username)
        .bind(password_hash)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DeskError::from(e).with_entity("agent credentials"))?;

        Ok(record)
    }

    async fn get_agent_credentials(
        &self,
        agent_id: i64,
    ) -> Result<Option<AgentCredentialsRecord>, DeskError> {
        let record = sqlx::query_as::<_, AgentCredentialsRecord>(
            r#"
            SELECT agent_id, username, password_hash, updated_at
            FROM agent_login_credentials
            WHERE agent_id = $1
            "#,
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    // ========================================================================
    // Users
    // ========================================================================

    async fn create_user(&self, user: &NewUser) -> Result<UserRecord, DeskError> {
        let record = sqlx::query_as::<_, UserRecord>(
            r#"
            INSERT INTO users (name, email, phone, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            RETURNING id, name, email, phone, created_at, updated_at
            "#,
        )
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.phone)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DeskError::from(e).with_entity("user"))?;

        Ok(record)
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<UserRecord>, DeskError> {
        let record = sqlx::query_as::<_, UserRecord>(
            "SELECT id, name, email, phone, created_at, updated_at FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_user(&self, user: &UserRecord) -> Result<UserRecord, DeskError> {
        let record = sqlx::query_as::<_, UserRecord>(
            r#"
            UPDATE users
            SET name = $1, email = $2, phone = $3, updated_at = $4
            WHERE id = $5
            RETURNING id, name, email, phone, created_at, updated_at
            "#,
        )
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.phone)
        .bind(Utc::now())
        .bind(user.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DeskError::from(e).with_entity("user"))?;

        record.ok_or_else(|| DeskError::not_found("user", user.id))
    }

    async fn delete_user(&self, user_id: i64) -> Result<(), DeskError> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DeskError::not_found("user", user_id));
        }
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>, DeskError> {
        let rows = sqlx::query_as::<_, UserRecord>(
            "SELECT id, name, email, phone, created_at, updated_at FROM users ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ========================================================================
    // Catalogs
    // ========================================================================

    async fn create_catalog_entry(
        &self,
        catalog: Catalog,
        name: &str,
        description: Option<&str>,
    ) -> Result<CatalogEntry, DeskError> {
        let sql = format!(
            "INSERT INTO {} (name, description, created_at) VALUES ($1, $2, $3) \
             RETURNING id, name, description, created_at",
            catalog.table()
        );
        let record = sqlx::query_as::<_, CatalogEntry>(&sql)
            .bind(name)
            .bind(description)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DeskError::from(e).with_entity(catalog.entity()))?;

        Ok(record)
    }

    async fn get_catalog_entry(
        &self,
        catalog: Catalog,
        id: i64,
    ) -> Result<Option<CatalogEntry>, DeskError> {
        let sql = format!(
            "SELECT id, name, description, created_at FROM {} WHERE id = $1",
            catalog.table()
        );
        let record = sqlx::query_as::<_, CatalogEntry>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn get_catalog_entry_by_name(
        &self,
        catalog: Catalog,
        name: &str,
    ) -> Result<Option<CatalogEntry>, DeskError> {
        let sql = format!(
            "SELECT id, name, description, created_at FROM {} WHERE name = $1",
            catalog.table()
        );
        let record = sqlx::query_as::<_, CatalogEntry>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn update_catalog_entry(
        &self,
        catalog: Catalog,
        entry: &CatalogEntry,
    ) -> Result<CatalogEntry, DeskError> {
        let sql = format!(
            "UPDATE {} SET name = $1, description = $2 WHERE id = $3 \
             RETURNING id, name, description, created_at",
            catalog.table()
        );
        let record = sqlx::query_as::<_, CatalogEntry>(&sql)
            .bind(&entry.name)
            .bind(&entry.description)
            .bind(entry.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DeskError::from(e).with_entity(catalog.entity()))?;

        record.ok_or_else(|| DeskError::not_found(catalog.entity(), entry.id))
    }

    async fn delete_catalog_entry(&self, catalog: Catalog, id: i64) -> Result<(), DeskError> {
        let sql = format!("DELETE FROM {} WHERE id = $1", catalog.table());
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;

        if result.rows_affected() == 0 {
            return Err(DeskError::not_found(catalog.entity(), id));
        }
        Ok(())
    }

    async fn list_catalog_entries(
        &self,
        catalog: Catalog,
    ) -> Result<Vec<CatalogEntry>, DeskError> {
        let sql = format!(
            "SELECT id, name, description, created_at FROM {} ORDER BY id",
            catalog.table()
        );
        let rows = sqlx::query_as::<_, CatalogEntry>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    // ========================================================================
    // Roles and permissions
    // ========================================================================

    async fn create_role(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<RoleRecord, DeskError> {
        let record = sqlx::query_as::<_, RoleRecord>(
            r#"
            INSERT INTO roles (name, description, created_at)
            VALUES ($1, $2, $3)
            RETURNING id, name, description, created_at
            "#,
        )
        .bind(name)
        .bind(description)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DeskError::from(e).with_entity("role"))?;

        Ok(record)
    }

    async fn get_role(&self, role_id: i64) -> Result<Option<RoleRecord>, DeskError> {
        let record = sqlx::query_as::<_, RoleRecord>(
            "SELECT id, name, description, created_at FROM roles WHERE id = $1",
        )
        .bind(role_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_role_by_name(&self, name: &str) -> Result<Option<RoleRecord>, DeskError> {
        let record = sqlx::query_as::<_, RoleRecord>(
            "SELECT id, name, description, created_at FROM roles WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_role(&self, role: &RoleRecord) -> Result<RoleRecord, DeskError> {
        let record = sqlx::query_as::<_, RoleRecord>(
            r#"
            UPDATE roles
            SET name = $1, description = $2
            WHERE id = $3
            RETURNING id, name, description, created_at
            "#,
        )
        .bind(&role.name)
        .bind(&role.description)
        .bind(role.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DeskError::from(e).with_entity("role"))?;

        record.ok_or_else(|| DeskError::not_found("role", role.id))
    }

    async fn delete_role(&self, role_id: i64) -> Result<(), DeskError> {
        let result = sqlx::query("DELETE FROM roles WHERE id = $1")
            .bind(role_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DeskError::not_found("role", role_id));
        }
        Ok(())
    }

    async fn list_roles(&self) -> Result<Vec<RoleRecord>, DeskError> {
        let rows = sqlx::query_as::<_, RoleRecord>(
            "SELECT id, name, description, created_at FROM roles ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn create_permission(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<PermissionRecord, DeskError> {
        let record = sqlx::query_as::<_, PermissionRecord>(
            r#"
            INSERT INTO permissions (name, description, created_at)
            VALUES ($1, $2, $3)
            RETURNING id, name, description, created_at
            "#,
        )
        .bind(name)
        .bind(description)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DeskError::from(e).with_entity("permission"))?;

        Ok(record)
    }

    async fn get_permission(
        &self,
        permission_id: i64,
    ) -> Result<Option<PermissionRecord>, DeskError> {
        let record = sqlx::query_as::<_, PermissionRecord>(
            "SELECT id, name, description, created_at FROM permissions WHERE id = $1",
        )
        .bind(permission_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_permission_by_name(
        &self,
        name: &str,
    ) -> Result<Option<PermissionRecord>, DeskError> {
        let record = sqlx::query_as::<_, PermissionRecord>(
            "SELECT id, name, description, created_at FROM permissions WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_permission(
        &self,
        permission: &PermissionRecord,
    ) -> Result<PermissionRecord, DeskError> {
        let record = sqlx::query_as::<_, PermissionRecord>(
            r#"
            UPDATE permissions
            SET name = $1, description = $2
            WHERE id = $3
            RETURNING id, name, description, created_at
            "#,
        )
        .bind(&permission.name)
        .bind(&permission.description)
        .bind(permission.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DeskError::from(e).with_entity("permission"))?;

        record.ok_or_else(|| DeskError::not_found("permission", permission.id))
    }

    async fn delete_permission(&self, permission_id: i64) -> Result<(), DeskError> {
        let result = sqlx::query("DELETE FROM permissions WHERE id = $1")
            .bind(permission_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DeskError::not_found("permission", permission_id));
        }
        Ok(())
    }

    async fn list_permissions(&self) -> Result<Vec<PermissionRecord>, DeskError> {
        let rows = sqlx::query_as::<_, PermissionRecord>(
            "SELECT id, name, description, created_at FROM permissions ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn add_role_permission(
        &self,
        role_id: i64,
        permission_id: i64,
    ) -> Result<bool, DeskError> {
        let result = sqlx::query(
            r#"
            INSERT INTO role_permissions (role_id, permission_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (role_id, permission_id) DO NOTHING
            "#,
        )
        .bind(role_id)
        .bind(permission_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove_role_permission(
        &self,
        role_id: i64,
        permission_id: i64,
    ) -> Result<bool, DeskError> {
        let result =
            sqlx::query("DELETE FROM role_permissions WHERE role_id = $1 AND permission_id = $2")
                .bind(role_id)
                .bind(permission_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_role_permissions(
        &self,
        role_id: i64,
    ) -> Result<Vec<PermissionRecord>, DeskError> {
        let rows = sqlx::query_as::<_, PermissionRecord>(
            r#"
            SELECT p.id, p.name, p.description, p.created_at
            FROM permissions p
            JOIN role_permissions rp ON rp.permission_id = p.id
            WHERE rp.role_id = $1
            ORDER BY p.name
            "#,
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ========================================================================
    // Agent roles
    // ========================================================================

    async fn replace_agent_roles(&self, agent_id: i64, role_ids: &[i64]) -> Result<(), DeskError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE agents SET role_id = NULL, updated_at = $1 WHERE id = $2")
            .bind(now)
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DeskError::not_found("agent", agent_id));
        }

        sqlx::query("DELETE FROM agent_roles WHERE agent_id = $1")
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO agent_roles (agent_id, role_id, created_at)
            SELECT $1::BIGINT, role_id, $3::TIMESTAMPTZ FROM UNNEST($2::BIGINT[]) AS role_id
            ON CONFLICT (agent_id, role_id) DO NOTHING
            "#,
        )
        .bind(agent_id)
        .bind(role_ids)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn add_agent_role(&self, agent_id: i64, role_id: i64) -> Result<bool, DeskError> {
        let result = sqlx::query(
            r#"
            INSERT INTO agent_roles (agent_id, role_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (agent_id, role_id) DO NOTHING
            "#,
        )
        .bind(agent_id)
        .bind(role_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove_agent_role(&self, agent_id: i64, role_id: i64) -> Result<bool, DeskError> {
        let mut tx = self.pool.begin().await?;

        let primary = sqlx::query(
            r#"
            UPDATE agents
            SET role_id = NULL, updated_at = $1
            WHERE id = $2 AND role_id = $3
            "#,
        )
        .bind(Utc::now())
        .bind(agent_id)
        .bind(role_id)
        .execute(&mut *tx)
        .await?;

        let additional =
            sqlx::query("DELETE FROM agent_roles WHERE agent_id = $1 AND role_id = $2")
                .bind(agent_id)
                .bind(role_id)
                .execute(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok(primary.rows_affected() + additional.rows_affected() > 0)
    }

    async fn list_agent_roles(&self, agent_id: i64) -> Result<Vec<RoleRecord>, DeskError> {
        let rows = sqlx::query_as::<_, RoleRecord>(
            r#"
            SELECT r.id, r.name, r.description, r.created_at
            FROM roles r
            WHERE r.id IN (
                SELECT role_id FROM agents WHERE id = $1 AND role_id IS NOT NULL
                UNION
                SELECT role_id FROM agent_roles WHERE agent_id = $1
            )
            ORDER BY r.name
            "#,
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn agent_has_permission(
        &self,
        agent_id: i64,
        permission_name: &str,
    ) -> Result<bool, DeskError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM role_permissions rp
                JOIN permissions p ON p.id = rp.permission_id
                WHERE p.name = $2
                  AND rp.role_id IN (
                      SELECT role_id FROM agents WHERE id = $1 AND role_id IS NOT NULL
                      UNION
                      SELECT role_id FROM agent_roles WHERE agent_id = $1
                  )
                  AND EXISTS (
                      SELECT 1 FROM agents WHERE id = $1 AND deactivated_at IS NULL
                  )
            )
            "#,
        )
        .bind(agent_id)
        .bind(permission_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn list_agent_permissions(
        &self,
        agent_id: i64,
    ) -> Result<Vec<PermissionRecord>, DeskError> {
        let rows = sqlx::query_as::<_, PermissionRecord>(
            r#"
            SELECT DISTINCT p.id, p.name, p.description, p.created_at
            FROM permissions p
            JOIN role_permissions rp ON rp.permission_id = p.id
            WHERE rp.role_id IN (
                SELECT role_id FROM agents WHERE id = $1 AND role_id IS NOT NULL
                UNION
                SELECT role_id FROM agent_roles WHERE agent_id = $1
            )
              AND EXISTS (SELECT 1 FROM agents WHERE id = $1 AND deactivated_at IS NULL)
            ORDER BY p.name
            "#,
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ========================================================================
    // Tickets
    // ========================================================================

    async fn create_ticket(&self, ticket: &NewTicketRecord) -> Result<TicketRecord, DeskError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            INSERT INTO tickets (subject, description, user_id, status_id, priority_id,
                                 category_id, sub_category_id, sla_id, due_at,
                                 created_at, updated_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10, 1)
            RETURNING {TICKET_COLUMNS}
            "#
        );
        let record = sqlx::query_as::<_, TicketRecord>(&sql)
            .bind(&ticket.subject)
            .bind(&ticket.description)
            .bind(ticket.user_id)
            .bind(ticket.status_id)
            .bind(ticket.priority_id)
            .bind(ticket.category_id)
            .bind(ticket.sub_category_id)
            .bind(ticket.sla_id)
            .bind(ticket.due_at)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO ticket_history (ticket_id, kind, from_value, to_value, created_at)
            VALUES ($1, $2, NULL, (SELECT name FROM ticket_statuses WHERE id = $3), $4)
            "#,
        )
        .bind(record.id)
        .bind(HistoryKind::Created.as_str())
        .bind(record.status_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record)
    }

    async fn get_ticket(&self, ticket_id: i64) -> Result<Option<TicketRecord>, DeskError> {
        let sql = format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1");
        let record = sqlx::query_as::<_, TicketRecord>(&sql)
            .bind(ticket_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn update_ticket_with_history(
        &self,
        ticket: &TicketRecord,
        expected_version: i64,
        history: Option<&NewHistoryEntry>,
    ) -> Result<TicketRecord, DeskError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            UPDATE tickets
            SET subject = $1, description = $2, user_id = $3, agent_id = $4, status_id = $5,
                priority_id = $6, category_id = $7, sub_category_id = $8, sla_id = $9,
                due_at = $10, updated_at = $11, version = version + 1
            WHERE id = $12 AND version = $13
            RETURNING {TICKET_COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, TicketRecord>(&sql)
            .bind(&ticket.subject)
            .bind(&ticket.description)
            .bind(ticket.user_id)
            .bind(ticket.agent_id)
            .bind(ticket.status_id)
            .bind(ticket.priority_id)
            .bind(ticket.category_id)
            .bind(ticket.sub_category_id)
            .bind(ticket.sla_id)
            .bind(ticket.due_at)
            .bind(now)
            .bind(ticket.id)
            .bind(expected_version)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(updated) = updated else {
            let current: Option<i64> =
                sqlx::query_scalar("SELECT version FROM tickets WHERE id = $1")
                    .bind(ticket.id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match current {
                None => DeskError::not_found("ticket", ticket.id),
                Some(version) => DeskError::Conflict {
                    entity: "ticket",
                    details: format!(
                        "ticket {} is at version {}, expected {}",
                        ticket.id, version, expected_version
                    ),
                },
            });
        };

        if let Some(entry) = history {
            insert_history(&mut tx, ticket.id, entry, now).await?;
        }

        tx.commit().await?;
        Ok(updated)
    }

    async fn delete_ticket(&self, ticket_id: i64) -> Result<(), DeskError> {
        let result = sqlx::query("DELETE FROM tickets WHERE id = $1")
            .bind(ticket_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DeskError::not_found("ticket", ticket_id));
        }
        Ok(())
    }

    async fn list_tickets(
        &self,
        filter: &TicketFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TicketRecord>, DeskError> {
        let sql = format!(
            r#"
            SELECT {TICKET_COLUMNS}
            FROM tickets
            WHERE ($1::BIGINT IS NULL OR status_id = $1)
              AND ($2::BIGINT IS NULL OR agent_id = $2)
              AND ($3::BIGINT IS NULL OR user_id = $3)
              AND (NOT $4::BOOLEAN OR $2::BIGINT IS NOT NULL OR agent_id IS NULL)
            ORDER BY created_at DESC, id DESC
            LIMIT $5 OFFSET $6
            "#
        );
        let rows = sqlx::query_as::<_, TicketRecord>(&sql)
            .bind(filter.status_id)
            .bind(filter.agent_id)
            .bind(filter.user_id)
            .bind(filter.unassigned_only)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn list_ticket_history(
        &self,
        ticket_id: i64,
    ) -> Result<Vec<TicketHistoryRecord>, DeskError> {
        let rows = sqlx::query_as::<_, TicketHistoryRecord>(
            r#"
            SELECT id, ticket_id, kind, from_value, to_value, created_at
            FROM ticket_history
            WHERE ticket_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(ticket_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn insert_comment(
        &self,
        ticket_id: i64,
        author_agent_id: Option<i64>,
        body: &str,
    ) -> Result<CommentRecord, DeskError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let comment = sqlx::query_as::<_, CommentRecord>(
            r#"
            INSERT INTO ticket_comments (ticket_id, author_agent_id, body, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, ticket_id, author_agent_id, body, created_at
            "#,
        )
        .bind(ticket_id)
        .bind(author_agent_id)
        .bind(body)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let entry = NewHistoryEntry::transition(
            HistoryKind::CommentAdded,
            None,
            Some(comment.id.to_string()),
        );
        insert_history(&mut tx, ticket_id, &entry, now).await?;

        tx.commit().await?;
        Ok(comment)
    }

    async fn list_comments(&self, ticket_id: i64) -> Result<Vec<CommentRecord>, DeskError> {
        let rows = sqlx::query_as::<_, CommentRecord>(
            r#"
            SELECT id, ticket_id, author_agent_id, body, created_at
            FROM ticket_comments
            WHERE ticket_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(ticket_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn add_ticket_tag(
        &self,
        ticket_id: i64,
        name: &str,
    ) -> Result<TicketTagRecord, DeskError> {
        let record = sqlx::query_as::<_, TicketTagRecord>(
            r#"
            INSERT INTO ticket_tags (ticket_id, name, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (ticket_id, name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, ticket_id, name, created_at
            "#,
        )
        .bind(ticket_id)
        .bind(name)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn remove_ticket_tag(&self, ticket_id: i64, name: &str) -> Result<bool, DeskError> {
        let result = sqlx::query("DELETE FROM ticket_tags WHERE ticket_id = $1 AND name = $2")
            .bind(ticket_id)
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_ticket_tags(&self, ticket_id: i64) -> Result<Vec<TicketTagRecord>, DeskError> {
        let rows = sqlx::query_as::<_, TicketTagRecord>(
            r#"
            SELECT id, ticket_id, name, created_at
            FROM ticket_tags
            WHERE ticket_id = $1
            ORDER BY name
            "#,
        )
        .bind(ticket_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn add_ticket_attachment(
        &self,
        attachment: &NewAttachment,
    ) -> Result<AttachmentRecord, DeskError> {
        let record = sqlx::query_as::<_, AttachmentRecord>(
            r#"
            INSERT INTO ticket_attachments (ticket_id, file_name, url, content_type, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, ticket_id, file_name, url, content_type, created_at
            "#,
        )
        .bind(attachment.ticket_id)
        .bind(&attachment.file_name)
        .bind(&attachment.url)
        .bind(&attachment.content_type)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_ticket_attachments(
        &self,
        ticket_id: i64,
    ) -> Result<Vec<AttachmentRecord>, DeskError> {
        let rows = sqlx::query_as::<_, AttachmentRecord>(
            r#"
            SELECT id, ticket_id, file_name, url, content_type, created_at
            FROM ticket_attachments
            WHERE ticket_id = $1
            ORDER BY id
            "#,
        )
        .bind(ticket_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn relate_tickets(&self, ticket_id: i64, related_id: i64) -> Result<bool, DeskError> {
        if ticket_id == related_id {
            return Err(DeskError::invalid(
                "related_ticket_id",
                "a ticket cannot be related to itself",
            ));
        }
        let (low, high) = relation_key(ticket_id, related_id);

        let result = sqlx::query(
            r#"
            INSERT INTO ticket_relations (ticket_id, related_ticket_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (ticket_id, related_ticket_id) DO NOTHING
            "#,
        )
        .bind(low)
        .bind(high)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn unrelate_tickets(
        &self,
        ticket_id: i64,
        related_id: i64,
    ) -> Result<bool, DeskError> {
        let (low, high) = relation_key(ticket_id, related_id);

        let result = sqlx::query(
            "DELETE FROM ticket_relations WHERE ticket_id = $1 AND related_ticket_id = $2",
        )
        .bind(low)
        .bind(high)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_related_tickets(&self, ticket_id: i64) -> Result<Vec<TicketRecord>, DeskError> {
        let sql = format!(
            r#"
            SELECT {TICKET_COLUMNS}
            FROM tickets
            WHERE id IN (
                SELECT related_ticket_id FROM ticket_relations WHERE ticket_id = $1
                UNION
                SELECT ticket_id FROM ticket_relations WHERE related_ticket_id = $1
            )
            ORDER BY id
            "#
        );
        let rows = sqlx::query_as::<_, TicketRecord>(&sql)
            .bind(ticket_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }
}
