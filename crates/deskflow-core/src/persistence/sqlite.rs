//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::DeskError;

use super::{
    AgentCredentialsRecord, AgentRecord, AttachmentRecord, Catalog, CatalogEntry, CommentRecord,
    HistoryKind, NewAgent, NewAttachment, NewHistoryEntry, NewTicketRecord, NewUser, Persistence,
    PermissionRecord, RoleRecord, TICKET_COLUMNS, TicketFilter, TicketHistoryRecord, TicketRecord,
    TicketTagRecord, UserRecord, relation_key,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, connects,
    /// and runs all migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/deskflow.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, DeskError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| DeskError::Storage {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let path_str = path.to_string_lossy();
        let url = format!("sqlite:{}?mode=rwc", path_str);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| DeskError::Storage {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Private in-memory database with migrations applied.
    ///
    /// Limited to one connection: each SQLite connection to `:memory:` would
    /// otherwise see a different database.
    pub async fn in_memory() -> Result<Self, DeskError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }
}

async fn insert_history(
    conn: &mut SqliteConnection,
    ticket_id: i64,
    entry: &NewHistoryEntry,
    at: DateTime<Utc>,
) -> Result<(), DeskError> {
    sqlx::query(
        r#"
        INSERT INTO ticket_history (ticket_id, kind, from_value, to_value, created_at)
        VALUES (?, ?, ?, ?, ?)
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
impl Persistence for SqlitePersistence {
    async fn health_check_db(&self) -> Result<bool, DeskError> {
        let result: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }

    // ========================================================================
    // Agents
    // ========================================================================

    async fn create_agent(&self, agent: &NewAgent) -> Result<AgentRecord, DeskError> {
        let record = sqlx::query_as::<_, AgentRecord>(
            r#"
            INSERT INTO agents (name, email, phone, role_id, supervisor_id, team_id, unit_id,
                                created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            RETURNING id, name, email, phone, role_id, supervisor_id, team_id, unit_id,
                      created_at, updated_at, deactivated_at
            "#,
        )
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
        let record = sqlx::query_as::<_, AgentRecord>(
            r#"
            SELECT id, name, email, phone, role_id, supervisor_id, team_id, unit_id,
                   created_at, updated_at, deactivated_at
            FROM agents
            WHERE id = ?
            "#,
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_agent(&self, agent: &AgentRecord) -> Result<AgentRecord, DeskError> {
        let record = sqlx::query_as::<_, AgentRecord>(
            r#"
            UPDATE agents
            SET name = ?1, email = ?2, phone = ?3, role_id = ?4, supervisor_id = ?5,
                team_id = ?6, unit_id = ?7, updated_at = ?8
            WHERE id = ?9
            RETURNING id, name, email, phone, role_id, supervisor_id, team_id, unit_id,
                      created_at, updated_at, deactivated_at
            "#,
        )
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
        let result = sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DeskError::not_found("agent", agent_id));
        }
        Ok(())
    }

    async fn deactivate_agent(&self, agent_id: i64) -> Result<AgentRecord, DeskError> {
        let record = sqlx::query_as::<_, AgentRecord>(
            r#"
            UPDATE agents
            SET deactivated_at = COALESCE(deactivated_at, ?1), updated_at = ?1
            WHERE id = ?2
            RETURNING id, name, email, phone, role_id, supervisor_id, team_id, unit_id,
                      created_at, updated_at, deactivated_at
            "#,
        )
        .bind(Utc::now())
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| DeskError::not_found("agent", agent_id))
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, DeskError> {
        let rows = sqlx::query_as::<_, AgentRecord>(
            r#"
            SELECT id, name, email, phone, role_id, supervisor_id, team_id, unit_id,
                   created_at, updated_at, deactivated_at
            FROM agents
            WHERE deactivated_at IS NULL
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn set_agent_primary_role(
        &self,
        agent_id: i64,
        role_id: Option<i64>,
    ) -> Result<(), DeskError> {
        let result = sqlx::query(
            r#"
            UPDATE agents
            SET role_id = ?1, updated_at = ?2
            WHERE id = ?3
            "#,
        )
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
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (agent_id) DO UPDATE SET
                username = excluded.username,
                password_hash = excluded.password_hash,
                updated_at = excluded.updated_at
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
            WHERE agent_id = ?
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
            VALUES (?1, ?2, ?3, ?4, ?4)
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
            r#"
            SELECT id, name, email, phone, created_at, updated_at
            FROM users
            WHERE id = ?
            "#,
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
            SET name = ?1, email = ?2, phone = ?3, updated_at = ?4
            WHERE id = ?5
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
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
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
            r#"
            SELECT id, name, email, phone, created_at, updated_at
            FROM users
            ORDER BY id
            "#,
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
            "INSERT INTO {} (name, description, created_at) VALUES (?, ?, ?) \
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
            "SELECT id, name, description, created_at FROM {} WHERE id = ?",
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
            "SELECT id, name, description, created_at FROM {} WHERE name = ?",
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
            "UPDATE {} SET name = ?, description = ? WHERE id = ? \
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
        let sql = format!("DELETE FROM {} WHERE id = ?", catalog.table());
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
            VALUES (?, ?, ?)
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
            "SELECT id, name, description, created_at FROM roles WHERE id = ?",
        )
        .bind(role_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_role_by_name(&self, name: &str) -> Result<Option<RoleRecord>, DeskError> {
        let record = sqlx::query_as::<_, RoleRecord>(
            "SELECT id, name, description, created_at FROM roles WHERE name = ?",
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
            SET name = ?, description = ?
            WHERE id = ?
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
        let result = sqlx::query("DELETE FROM roles WHERE id = ?")
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
            VALUES (?, ?, ?)
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
            "SELECT id, name, description, created_at FROM permissions WHERE id = ?",
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
            "SELECT id, name, description, created_at FROM permissions WHERE name = ?",
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
            SET name = ?, description = ?
            WHERE id = ?
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
        let result = sqlx::query("DELETE FROM permissions WHERE id = ?")
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
            VALUES (?, ?, ?)
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
            sqlx::query("DELETE FROM role_permissions WHERE role_id = ? AND permission_id = ?")
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
            WHERE rp.role_id = ?
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

        let result = sqlx::query("UPDATE agents SET role_id = NULL, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DeskError::not_found("agent", agent_id));
        }

        sqlx::query("DELETE FROM agent_roles WHERE agent_id = ?")
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;

        for role_id in role_ids {
            sqlx::query(
                r#"
                INSERT INTO agent_roles (agent_id, role_id, created_at)
                VALUES (?, ?, ?)
                ON CONFLICT (agent_id, role_id) DO NOTHING
                "#,
            )
            .bind(agent_id)
            .bind(role_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn add_agent_role(&self, agent_id: i64, role_id: i64) -> Result<bool, DeskError> {
        let result = sqlx::query(
            r#"
            INSERT INTO agent_roles (agent_id, role_id, created_at)
            VALUES (?, ?, ?)
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
            SET role_id = NULL, updated_at = ?
            WHERE id = ? AND role_id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(agent_id)
        .bind(role_id)
        .execute(&mut *tx)
        .await?;

        let additional = sqlx::query("DELETE FROM agent_roles WHERE agent_id = ? AND role_id = ?")
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
                SELECT role_id FROM agents WHERE id = ?1 AND role_id IS NOT NULL
                UNION
                SELECT role_id FROM agent_roles WHERE agent_id = ?1
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
        // SQLite reports EXISTS as an integer.
        let exists: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM role_permissions rp
                JOIN permissions p ON p.id = rp.permission_id
                WHERE p.name = ?2
                  AND rp.role_id IN (
                      SELECT role_id FROM agents WHERE id = ?1 AND role_id IS NOT NULL
                      UNION
                      SELECT role_id FROM agent_roles WHERE agent_id = ?1
                  )
                  AND EXISTS (
                      SELECT 1 FROM agents WHERE id = ?1 AND deactivated_at IS NULL
                  )
            )
            "#,
        )
        .bind(agent_id)
        .bind(permission_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists != 0)
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
                SELECT role_id FROM agents WHERE id = ?1 AND role_id IS NOT NULL
                UNION
                SELECT role_id FROM agent_roles WHERE agent_id = ?1
            )
              AND EXISTS (SELECT 1 FROM agents WHERE id = ?1 AND deactivated_at IS NULL)
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
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, 1)
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
            VALUES (?1, ?2, NULL, (SELECT name FROM ticket_statuses WHERE id = ?3), ?4)
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
        let sql = format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ?");
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
            SET subject = ?1, description = ?2, user_id = ?3, agent_id = ?4, status_id = ?5,
                priority_id = ?6, category_id = ?7, sub_category_id = ?8, sla_id = ?9,
                due_at = ?10, updated_at = ?11, version = version + 1
            WHERE id = ?12 AND version = ?13
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
                sqlx::query_scalar("SELECT version FROM tickets WHERE id = ?")
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
        let result = sqlx::query("DELETE FROM tickets WHERE id = ?")
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
            WHERE (?1 IS NULL OR status_id = ?1)
              AND (?2 IS NULL OR agent_id = ?2)
              AND (?3 IS NULL OR user_id = ?3)
              AND (?4 = 0 OR ?2 IS NOT NULL OR agent_id IS NULL)
            ORDER BY created_at DESC, id DESC
            LIMIT ?5 OFFSET ?6
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
            WHERE ticket_id = ?
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
            VALUES (?, ?, ?, ?)
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
            WHERE ticket_id = ?
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
            VALUES (?, ?, ?)
            ON CONFLICT (ticket_id, name) DO UPDATE SET name = excluded.name
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
        let result = sqlx::query("DELETE FROM ticket_tags WHERE ticket_id = ? AND name = ?")
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
            WHERE ticket_id = ?
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
            VALUES (?, ?, ?, ?, ?)
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
            WHERE ticket_id = ?
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
            VALUES (?, ?, ?)
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

        let result =
            sqlx::query("DELETE FROM ticket_relations WHERE ticket_id = ? AND related_ticket_id = ?")
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
                SELECT related_ticket_id FROM ticket_relations WHERE ticket_id = ?1
                UNION
                SELECT ticket_id FROM ticket_relations WHERE related_ticket_id = ?1
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

#[cfg(test)]
mod tests {
    use super::*;

    /// Create an in-memory SQLite pool for testing.
    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        pool
    }

    async fn seed_user(persistence: &SqlitePersistence) -> UserRecord {
        persistence
            .create_user(&NewUser::new("Reporter", "reporter@example.com"))
            .await
            .expect("Failed to create user")
    }

    async fn open_status(persistence: &SqlitePersistence) -> i64 {
        persistence
            .get_catalog_entry_by_name(Catalog::TicketStatus, "open")
            .await
            .expect("Query should succeed")
            .expect("open status is seeded")
            .id
    }

    async fn seed_ticket(persistence: &SqlitePersistence) -> TicketRecord {
        let user = seed_user(persistence).await;
        let status_id = open_status(persistence).await;
        persistence
            .create_ticket(&NewTicketRecord {
                subject: "Printer on fire".to_string(),
                description: "Third floor".to_string(),
                user_id: user.id,
                status_id,
                ..Default::default()
            })
            .await
            .expect("Failed to create ticket")
    }

    #[tokio::test]
    async fn test_create_and_get_agent() {
        let persistence = SqlitePersistence::new(test_pool().await);

        let created = persistence
            .create_agent(&NewAgent::new("Ada", "ada@example.com"))
            .await
            .expect("Failed to create agent");

        let agent = persistence
            .get_agent(created.id)
            .await
            .expect("Failed to get agent")
            .expect("Agent should exist");

        assert_eq!(agent.name, "Ada");
        assert_eq!(agent.email, "ada@example.com");
        assert_eq!(agent.role_id, None);
        assert!(!agent.is_deactivated());
    }

    #[tokio::test]
    async fn test_get_agent_not_found() {
        let persistence = SqlitePersistence::new(test_pool().await);

        let result = persistence
            .get_agent(999)
            .await
            .expect("Query should succeed");

        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_agent_email_is_conflict() {
        let persistence = SqlitePersistence::new(test_pool().await);

        persistence
            .create_agent(&NewAgent::new("Ada", "ada@example.com"))
            .await
            .unwrap();
        let err = persistence
            .create_agent(&NewAgent::new("Other Ada", "ada@example.com"))
            .await
            .unwrap_err();

        assert!(matches!(err, DeskError::Conflict { entity: "agent", .. }));
    }

    #[tokio::test]
    async fn test_update_and_delete_agent() {
        let persistence = SqlitePersistence::new(test_pool().await);

        let mut agent = persistence
            .create_agent(&NewAgent::new("Ada", "ada@example.com"))
            .await
            .unwrap();
        agent.phone = Some("+44 20 7946 0000".to_string());

        let updated = persistence.update_agent(&agent).await.unwrap();
        assert_eq!(updated.phone.as_deref(), Some("+44 20 7946 0000"));
        assert!(updated.updated_at >= agent.updated_at);

        persistence.delete_agent(agent.id).await.unwrap();
        assert!(persistence.get_agent(agent.id).await.unwrap().is_none());

        let err = persistence.delete_agent(agent.id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_deactivate_agent_hides_from_list() {
        let persistence = SqlitePersistence::new(test_pool().await);

        let ada = persistence
            .create_agent(&NewAgent::new("Ada", "ada@example.com"))
            .await
            .unwrap();
        let bob = persistence
            .create_agent(&NewAgent::new("Bob", "bob@example.com"))
            .await
            .unwrap();

        let deactivated = persistence.deactivate_agent(ada.id).await.unwrap();
        assert!(deactivated.is_deactivated());

        let listed: Vec<i64> = persistence
            .list_agents()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(listed, vec![bob.id]);

        // Soft-deleted rows stay addressable by id.
        assert!(persistence.get_agent(ada.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_upsert_agent_credentials() {
        let persistence = SqlitePersistence::new(test_pool().await);

        let agent = persistence
            .create_agent(&NewAgent::new("Ada", "ada@example.com"))
            .await
            .unwrap();

        persistence
            .upsert_agent_credentials(agent.id, "ada", "hash-1")
            .await
            .unwrap();
        let creds = persistence
            .upsert_agent_credentials(agent.id, "ada.l", "hash-2")
            .await
            .unwrap();

        assert_eq!(creds.username, "ada.l");
        assert_eq!(creds.password_hash, "hash-2");

        let stored = persistence
            .get_agent_credentials(agent.id)
            .await
            .unwrap()
            .expect("credentials exist");
        assert_eq!(stored, creds);
    }

    #[tokio::test]
    async fn test_catalog_crud() {
        let persistence = SqlitePersistence::new(test_pool().await);

        let team = persistence
            .create_catalog_entry(Catalog::Team, "Network", Some("Routers and switches"))
            .await
            .unwrap();

        let mut fetched = persistence
            .get_catalog_entry(Catalog::Team, team.id)
            .await
            .unwrap()
            .expect("team exists");
        assert_eq!(fetched.name, "Network");

        fetched.description = None;
        let updated = persistence
            .update_catalog_entry(Catalog::Team, &fetched)
            .await
            .unwrap();
        assert_eq!(updated.description, None);

        // Same name in a different catalog is fine.
        persistence
            .create_catalog_entry(Catalog::Unit, "Network", None)
            .await
            .unwrap();

        let err = persistence
            .create_catalog_entry(Catalog::Team, "Network", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DeskError::Conflict { entity: "team", .. }));

        persistence
            .delete_catalog_entry(Catalog::Team, team.id)
            .await
            .unwrap();
        assert!(
            persistence
                .list_catalog_entries(Catalog::Team)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_default_statuses_seeded() {
        let persistence = SqlitePersistence::new(test_pool().await);

        let names: Vec<String> = persistence
            .list_catalog_entries(Catalog::TicketStatus)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();

        assert_eq!(
            names,
            vec!["open", "in_progress", "pending", "resolved", "closed"]
        );
    }

    #[tokio::test]
    async fn test_add_role_permission_is_idempotent() {
        let persistence = SqlitePersistence::new(test_pool().await);

        let role = persistence.create_role("agent", None).await.unwrap();
        let permission = persistence
            .create_permission("view_tickets", None)
            .await
            .unwrap();

        assert!(
            persistence
                .add_role_permission(role.id, permission.id)
                .await
                .unwrap()
        );
        assert!(
            !persistence
                .add_role_permission(role.id, permission.id)
                .await
                .unwrap()
        );

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM role_permissions WHERE role_id = ? AND permission_id = ?",
        )
        .bind(role.id)
        .bind(permission.id)
        .fetch_one(&persistence.pool)
        .await
        .unwrap();
        assert_eq!(count, 1);

        assert!(
            persistence
                .remove_role_permission(role.id, permission.id)
                .await
                .unwrap()
        );
        assert!(
            !persistence
                .remove_role_permission(role.id, permission.id)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_effective_roles_and_permission_check() {
        let persistence = SqlitePersistence::new(test_pool().await);

        let admin = persistence.create_role("admin", None).await.unwrap();
        let agent_role = persistence.create_role("agent", None).await.unwrap();
        let manage = persistence
            .create_permission("manage_users", None)
            .await
            .unwrap();
        let view = persistence
            .create_permission("view_tickets", None)
            .await
            .unwrap();
        persistence
            .add_role_permission(admin.id, manage.id)
            .await
            .unwrap();
        persistence
            .add_role_permission(agent_role.id, view.id)
            .await
            .unwrap();

        let agent = persistence
            .create_agent(&NewAgent::new("Ada", "ada@example.com"))
            .await
            .unwrap();
        assert!(
            !persistence
                .agent_has_permission(agent.id, "view_tickets")
                .await
                .unwrap()
        );

        persistence
            .set_agent_primary_role(agent.id, Some(agent_role.id))
            .await
            .unwrap();
        persistence.add_agent_role(agent.id, admin.id).await.unwrap();

        let roles: Vec<String> = persistence
            .list_agent_roles(agent.id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(roles, vec!["admin", "agent"]);

        assert!(
            persistence
                .agent_has_permission(agent.id, "view_tickets")
                .await
                .unwrap()
        );
        assert!(
            persistence
                .agent_has_permission(agent.id, "manage_users")
                .await
                .unwrap()
        );
        assert!(
            !persistence
                .agent_has_permission(agent.id, "delete_everything")
                .await
                .unwrap()
        );

        let permissions = persistence.list_agent_permissions(agent.id).await.unwrap();
        assert_eq!(permissions.len(), 2);

        persistence.deactivate_agent(agent.id).await.unwrap();
        assert!(
            !persistence
                .agent_has_permission(agent.id, "view_tickets")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_replace_agent_roles() {
        let persistence = SqlitePersistence::new(test_pool().await);

        let a = persistence.create_role("a", None).await.unwrap();
        let b = persistence.create_role("b", None).await.unwrap();
        let c = persistence.create_role("c", None).await.unwrap();

        let agent = persistence
            .create_agent(&NewAgent {
                role_id: Some(a.id),
                ..NewAgent::new("Ada", "ada@example.com")
            })
            .await
            .unwrap();

        persistence
            .replace_agent_roles(agent.id, &[b.id, c.id, b.id])
            .await
            .unwrap();

        let roles: Vec<i64> = persistence
            .list_agent_roles(agent.id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(roles, vec![b.id, c.id]);

        let err = persistence.replace_agent_roles(999, &[a.id]).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_remove_agent_role_covers_primary_and_additional() {
        let persistence = SqlitePersistence::new(test_pool().await);

        let role = persistence.create_role("agent", None).await.unwrap();
        let agent = persistence
            .create_agent(&NewAgent {
                role_id: Some(role.id),
                ..NewAgent::new("Ada", "ada@example.com")
            })
            .await
            .unwrap();
        persistence.add_agent_role(agent.id, role.id).await.unwrap();

        assert!(persistence.remove_agent_role(agent.id, role.id).await.unwrap());
        assert!(persistence.list_agent_roles(agent.id).await.unwrap().is_empty());
        assert!(!persistence.remove_agent_role(agent.id, role.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_ticket_records_created_entry() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let ticket = seed_ticket(&persistence).await;

        assert_eq!(ticket.agent_id, None);
        assert_eq!(ticket.version, 1);

        let history = persistence.list_ticket_history(ticket.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind(), Some(HistoryKind::Created));
        assert_eq!(history[0].to_value.as_deref(), Some("open"));
    }

    #[tokio::test]
    async fn test_create_ticket_with_unknown_user_is_invalid() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let status_id = open_status(&persistence).await;

        let err = persistence
            .create_ticket(&NewTicketRecord {
                subject: "Orphan".to_string(),
                description: String::new(),
                user_id: 4242,
                status_id,
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn test_update_ticket_checks_version() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let ticket = seed_ticket(&persistence).await;

        let mut edit = ticket.clone();
        edit.subject = "Printer still on fire".to_string();
        let updated = persistence.update_ticket(&edit).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.subject, "Printer still on fire");

        // Writing again from the stale copy must not silently win.
        let err = persistence.update_ticket(&edit).await.unwrap_err();
        assert!(err.is_conflict());

        let mut missing = updated.clone();
        missing.id = 999;
        let err = persistence.update_ticket(&missing).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_with_history_is_atomic() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let ticket = seed_ticket(&persistence).await;

        let entry = NewHistoryEntry::transition(
            HistoryKind::StatusChanged,
            Some("open".to_string()),
            Some("closed".to_string()),
        );

        // Stale version: neither the row nor the history changes.
        let err = persistence
            .update_ticket_with_history(&ticket, ticket.version + 5, Some(&entry))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(
            persistence.list_ticket_history(ticket.id).await.unwrap().len(),
            1
        );

        persistence
            .update_ticket_with_history(&ticket, ticket.version, Some(&entry))
            .await
            .unwrap();
        let history = persistence.list_ticket_history(ticket.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].kind(), Some(HistoryKind::StatusChanged));
    }

    #[tokio::test]
    async fn test_comment_does_not_touch_ticket_row() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let ticket = seed_ticket(&persistence).await;

        let comment = persistence
            .insert_comment(ticket.id, None, "Extinguisher deployed")
            .await
            .unwrap();

        let after = persistence.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(after.version, ticket.version);

        let comments = persistence.list_comments(ticket.id).await.unwrap();
        assert_eq!(comments, vec![comment.clone()]);

        let history = persistence.list_ticket_history(ticket.id).await.unwrap();
        assert_eq!(history.last().unwrap().kind(), Some(HistoryKind::CommentAdded));
        assert_eq!(
            history.last().unwrap().to_value,
            Some(comment.id.to_string())
        );
    }

    #[tokio::test]
    async fn test_ticket_tags() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let ticket = seed_ticket(&persistence).await;

        let first = persistence.add_ticket_tag(ticket.id, "hardware").await.unwrap();
        let again = persistence.add_ticket_tag(ticket.id, "hardware").await.unwrap();
        assert_eq!(first.id, again.id);

        persistence.add_ticket_tag(ticket.id, "floor-3").await.unwrap();
        let names: Vec<String> = persistence
            .list_ticket_tags(ticket.id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["floor-3", "hardware"]);

        assert!(persistence.remove_ticket_tag(ticket.id, "hardware").await.unwrap());
        assert!(!persistence.remove_ticket_tag(ticket.id, "hardware").await.unwrap());
    }

    #[tokio::test]
    async fn test_related_tickets_are_symmetric() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let first = seed_ticket(&persistence).await;
        let status_id = open_status(&persistence).await;
        let second = persistence
            .create_ticket(&NewTicketRecord {
                subject: "Smoke alarm".to_string(),
                description: String::new(),
                user_id: first.user_id,
                status_id,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(persistence.relate_tickets(second.id, first.id).await.unwrap());
        assert!(!persistence.relate_tickets(first.id, second.id).await.unwrap());

        let from_first = persistence.list_related_tickets(first.id).await.unwrap();
        let from_second = persistence.list_related_tickets(second.id).await.unwrap();
        assert_eq!(from_first.len(), 1);
        assert_eq!(from_first[0].id, second.id);
        assert_eq!(from_second[0].id, first.id);

        assert!(persistence.relate_tickets(first.id, first.id).await.is_err());
        assert!(persistence.unrelate_tickets(first.id, second.id).await.unwrap());
        assert!(persistence.list_related_tickets(first.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_tickets_with_filter() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let ticket = seed_ticket(&persistence).await;
        let agent = persistence
            .create_agent(&NewAgent::new("Ada", "ada@example.com"))
            .await
            .unwrap();

        let mut second = persistence
            .create_ticket(&NewTicketRecord {
                subject: "Keyboard".to_string(),
                description: String::new(),
                user_id: ticket.user_id,
                status_id: ticket.status_id,
                ..Default::default()
            })
            .await
            .unwrap();
        second.agent_id = Some(agent.id);
        persistence.update_ticket(&second).await.unwrap();

        let all = persistence
            .list_tickets(&TicketFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second.id, "newest first");

        let assigned = persistence
            .list_tickets(
                &TicketFilter {
                    agent_id: Some(agent.id),
                    ..Default::default()
                },
                10,
                0,
            )
            .await
            .unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].id, second.id);

        let unassigned = persistence
            .list_tickets(
                &TicketFilter {
                    unassigned_only: true,
                    ..Default::default()
                },
                10,
                0,
            )
            .await
            .unwrap();
        assert_eq!(unassigned.len(), 1);
        assert_eq!(unassigned[0].id, ticket.id);

        let paged = persistence
            .list_tickets(&TicketFilter::default(), 1, 1)
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].id, ticket.id);
    }

    #[tokio::test]
    async fn test_attachments() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let ticket = seed_ticket(&persistence).await;

        persistence
            .add_ticket_attachment(&NewAttachment {
                ticket_id: ticket.id,
                file_name: "photo.jpg".to_string(),
                url: "s3://desk/photo.jpg".to_string(),
                content_type: Some("image/jpeg".to_string()),
            })
            .await
            .unwrap();

        let attachments = persistence.list_ticket_attachments(ticket.id).await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].file_name, "photo.jpg");
    }

    #[tokio::test]
    async fn test_delete_ticket_cascades_history() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let ticket = seed_ticket(&persistence).await;
        persistence
            .insert_comment(ticket.id, None, "note")
            .await
            .unwrap();

        persistence.delete_ticket(ticket.id).await.unwrap();

        assert!(persistence.get_ticket(ticket.id).await.unwrap().is_none());
        assert!(
            persistence
                .list_ticket_history(ticket.id)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(persistence.delete_ticket(ticket.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_from_path_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("desk.db");

        let persistence = SqlitePersistence::from_path(&path).await.unwrap();

        assert!(path.exists());
        assert!(persistence.health_check_db().await.unwrap());
    }
}
