//! Persistence interfaces and backends for deskflow-core.
//!
//! This module defines the entity store abstraction and its backend implementations.
//! Relationships are stored as plain foreign-key identifiers; nothing here embeds one
//! record inside another.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

use crate::config::Config;
use crate::error::DeskError;

// ============================================================================
// People
// ============================================================================

/// Agent record from the persistence layer.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Database primary key.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Work email, unique across agents.
    pub email: String,
    /// Contact phone number.
    pub phone: Option<String>,
    /// Primary role reference.
    pub role_id: Option<i64>,
    /// Supervising agent.
    pub supervisor_id: Option<i64>,
    /// Team the agent belongs to.
    pub team_id: Option<i64>,
    /// Organisational unit the agent belongs to.
    pub unit_id: Option<i64>,
    /// When the agent was created.
    pub created_at: DateTime<Utc>,
    /// When the agent was last updated.
    pub updated_at: DateTime<Utc>,
    /// Set when the agent was offboarded without deleting the row.
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl AgentRecord {
    /// Whether the agent has been offboarded.
    pub fn is_deactivated(&self) -> bool {
        self.deactivated_at.is_some()
    }
}

/// Fields for a new agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewAgent {
    /// Display name.
    pub name: String,
    /// Work email, unique across agents.
    pub email: String,
    /// Contact phone number.
    pub phone: Option<String>,
    /// Primary role reference.
    pub role_id: Option<i64>,
    /// Supervising agent.
    pub supervisor_id: Option<i64>,
    /// Team the agent belongs to.
    pub team_id: Option<i64>,
    /// Organisational unit the agent belongs to.
    pub unit_id: Option<i64>,
}

impl NewAgent {
    /// New agent with only the required fields set.
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            ..Default::default()
        }
    }
}

/// Login credentials owned by exactly one agent.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize)]
pub struct AgentCredentialsRecord {
    /// Owning agent.
    pub agent_id: i64,
    /// Login name, unique across agents.
    pub username: String,
    /// Password hash as produced by the authentication layer.
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// When the credentials were last written.
    pub updated_at: DateTime<Utc>,
}

/// End user who reports tickets.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct UserRecord {
    /// Database primary key.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Email, unique across users.
    pub email: String,
    /// Contact phone number.
    pub phone: Option<String>,
    /// When the user was created.
    pub created_at: DateTime<Utc>,
    /// When the user was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Fields for a new user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewUser {
    /// Display name.
    pub name: String,
    /// Email, unique across users.
    pub email: String,
    /// Contact phone number.
    pub phone: Option<String>,
}

impl NewUser {
    /// New user with only the required fields set.
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            phone: None,
        }
    }
}

// ============================================================================
// Catalogs (teams, units, ticket lookups)
// ============================================================================

/// Name-keyed reference tables that share one shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Catalog {
    /// Agent teams.
    Team,
    /// Organisational units.
    Unit,
    /// Ticket statuses.
    TicketStatus,
    /// Ticket priorities.
    Priority,
    /// Ticket categories.
    Category,
    /// Ticket sub-categories.
    SubCategory,
    /// Service level agreements.
    Sla,
}

impl Catalog {
    /// Backing table name.
    pub fn table(self) -> &'static str {
        match self {
            Catalog::Team => "teams",
            Catalog::Unit => "units",
            Catalog::TicketStatus => "ticket_statuses",
            Catalog::Priority => "ticket_priorities",
            Catalog::Category => "ticket_categories",
            Catalog::SubCategory => "ticket_sub_categories",
            Catalog::Sla => "slas",
        }
    }

    /// Entity name used in errors.
    pub fn entity(self) -> &'static str {
        match self {
            Catalog::Team => "team",
            Catalog::Unit => "unit",
            Catalog::TicketStatus => "ticket status",
            Catalog::Priority => "priority",
            Catalog::Category => "category",
            Catalog::SubCategory => "sub-category",
            Catalog::Sla => "sla",
        }
    }
}

/// Row of any [`Catalog`] table.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Database primary key.
    pub id: i64,
    /// Unique name within the catalog.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Access control
// ============================================================================

/// Named permission bundle.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct RoleRecord {
    /// Database primary key.
    pub id: i64,
    /// Unique role name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// When the role was created.
    pub created_at: DateTime<Utc>,
}

/// Named capability.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct PermissionRecord {
    /// Database primary key.
    pub id: i64,
    /// Unique permission name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// When the permission was created.
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Tickets
// ============================================================================

/// Ticket record from the persistence layer.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct TicketRecord {
    /// Database primary key.
    pub id: i64,
    /// Short summary.
    pub subject: String,
    /// Full problem description.
    pub description: String,
    /// Reporting user.
    pub user_id: i64,
    /// Assigned agent; `None` until explicitly assigned.
    pub agent_id: Option<i64>,
    /// Current status ([`Catalog::TicketStatus`]).
    pub status_id: i64,
    /// Priority ([`Catalog::Priority`]).
    pub priority_id: Option<i64>,
    /// Category ([`Catalog::Category`]).
    pub category_id: Option<i64>,
    /// Sub-category ([`Catalog::SubCategory`]).
    pub sub_category_id: Option<i64>,
    /// Applicable SLA ([`Catalog::Sla`]).
    pub sla_id: Option<i64>,
    /// When the ticket is due.
    pub due_at: Option<DateTime<Utc>>,
    /// When the ticket was created.
    pub created_at: DateTime<Utc>,
    /// When the ticket was last updated.
    pub updated_at: DateTime<Utc>,
    /// Row version, bumped on every update. Used as an etag.
    pub version: i64,
}

/// Fields for a new ticket, with every reference already resolved to an id.
#[derive(Debug, Clone, Default)]
pub struct NewTicketRecord {
    /// Short summary.
    pub subject: String,
    /// Full problem description.
    pub description: String,
    /// Reporting user.
    pub user_id: i64,
    /// Initial status.
    pub status_id: i64,
    /// Priority.
    pub priority_id: Option<i64>,
    /// Category.
    pub category_id: Option<i64>,
    /// Sub-category.
    pub sub_category_id: Option<i64>,
    /// SLA.
    pub sla_id: Option<i64>,
    /// Due date.
    pub due_at: Option<DateTime<Utc>>,
}

/// Filter options for listing tickets.
#[derive(Debug, Clone, Default)]
pub struct TicketFilter {
    /// Only tickets in this status.
    pub status_id: Option<i64>,
    /// Only tickets assigned to this agent.
    pub agent_id: Option<i64>,
    /// Only tickets reported by this user.
    pub user_id: Option<i64>,
    /// Only tickets with no assignee. Ignored when `agent_id` is set.
    pub unassigned_only: bool,
}

/// Kind of change recorded in a ticket's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    /// Ticket was created.
    Created,
    /// Status moved from one value to another.
    StatusChanged,
    /// Ticket was assigned to an agent.
    Assigned,
    /// Assignee was removed.
    Unassigned,
    /// A comment was added.
    CommentAdded,
}

impl HistoryKind {
    /// Stored representation.
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryKind::Created => "created",
            HistoryKind::StatusChanged => "status_changed",
            HistoryKind::Assigned => "assigned",
            HistoryKind::Unassigned => "unassigned",
            HistoryKind::CommentAdded => "comment_added",
        }
    }
}

impl std::fmt::Display for HistoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HistoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(HistoryKind::Created),
            "status_changed" => Ok(HistoryKind::StatusChanged),
            "assigned" => Ok(HistoryKind::Assigned),
            "unassigned" => Ok(HistoryKind::Unassigned),
            "comment_added" => Ok(HistoryKind::CommentAdded),
            _ => Err(format!("Unknown history kind: {}", s)),
        }
    }
}

/// Append-only audit entry for a ticket.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct TicketHistoryRecord {
    /// Database primary key.
    pub id: i64,
    /// Ticket the entry belongs to.
    pub ticket_id: i64,
    /// Stored [`HistoryKind`].
    pub kind: String,
    /// Value before the change.
    pub from_value: Option<String>,
    /// Value after the change.
    pub to_value: Option<String>,
    /// When the change happened.
    pub created_at: DateTime<Utc>,
}

impl TicketHistoryRecord {
    /// Parsed kind, `None` if the stored value is unknown.
    pub fn kind(&self) -> Option<HistoryKind> {
        self.kind.parse().ok()
    }
}

/// History entry to append alongside a ticket write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHistoryEntry {
    /// What changed.
    pub kind: HistoryKind,
    /// Value before the change.
    pub from_value: Option<String>,
    /// Value after the change.
    pub to_value: Option<String>,
}

impl NewHistoryEntry {
    /// Entry recording a transition between two values.
    pub fn transition(
        kind: HistoryKind,
        from_value: Option<String>,
        to_value: Option<String>,
    ) -> Self {
        Self {
            kind,
            from_value,
            to_value,
        }
    }
}

/// Free-text note attached to a ticket.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct CommentRecord {
    /// Database primary key.
    pub id: i64,
    /// Ticket the comment belongs to.
    pub ticket_id: i64,
    /// Agent who wrote it, if any.
    pub author_agent_id: Option<i64>,
    /// Comment text.
    pub body: String,
    /// When the comment was created.
    pub created_at: DateTime<Utc>,
}

/// Tag scoped to one ticket.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct TicketTagRecord {
    /// Database primary key.
    pub id: i64,
    /// Ticket the tag belongs to.
    pub ticket_id: i64,
    /// Tag name, unique per ticket.
    pub name: String,
    /// When the tag was added.
    pub created_at: DateTime<Utc>,
}

/// Media attached to a ticket.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct AttachmentRecord {
    /// Database primary key.
    pub id: i64,
    /// Ticket the attachment belongs to.
    pub ticket_id: i64,
    /// Original file name.
    pub file_name: String,
    /// Where the content is stored.
    pub url: String,
    /// MIME type, if known.
    pub content_type: Option<String>,
    /// When the attachment was added.
    pub created_at: DateTime<Utc>,
}

/// Fields for a new attachment.
#[derive(Debug, Clone, Default)]
pub struct NewAttachment {
    /// Ticket to attach to.
    pub ticket_id: i64,
    /// Original file name.
    pub file_name: String,
    /// Where the content is stored.
    pub url: String,
    /// MIME type, if known.
    pub content_type: Option<String>,
}

/// Orders a relation pair so each relation is stored once.
pub(crate) fn relation_key(a: i64, b: i64) -> (i64, i64) {
    if a < b { (a, b) } else { (b, a) }
}

pub(crate) const TICKET_COLUMNS: &str = "id, subject, description, user_id, agent_id, status_id, \
     priority_id, category_id, sub_category_id, sla_id, due_at, created_at, updated_at, version";

// ============================================================================
// Persistence trait
// ============================================================================

/// Entity store used by the access-control and ticket services.
///
/// `get_*` methods return `Ok(None)` for a missing row; `update_*` and
/// `delete_*` return [`DeskError::NotFound`] when no row matched.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn health_check_db(&self) -> Result<bool, DeskError>;

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    async fn create_agent(&self, agent: &NewAgent) -> Result<AgentRecord, DeskError>;

    async fn get_agent(&self, agent_id: i64) -> Result<Option<AgentRecord>, DeskError>;

    /// Write every mutable field of the agent and bump `updated_at`.
    async fn update_agent(&self, agent: &AgentRecord) -> Result<AgentRecord, DeskError>;

    async fn delete_agent(&self, agent_id: i64) -> Result<(), DeskError>;

    /// Soft-delete: stamps `deactivated_at`, keeps the row.
    async fn deactivate_agent(&self, agent_id: i64) -> Result<AgentRecord, DeskError>;

    /// Active agents only, ordered by id.
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, DeskError>;

    /// Single-column update of the primary role.
    async fn set_agent_primary_role(
        &self,
        agent_id: i64,
        role_id: Option<i64>,
    ) -> Result<(), DeskError>;

    async fn upsert_agent_credentials(
        &self,
        agent_id: i64,
        username: &str,
        password_hash: &str,
    ) -> Result<AgentCredentialsRecord, DeskError>;

    async fn get_agent_credentials(
        &self,
        agent_id: i64,
    ) -> Result<Option<AgentCredentialsRecord>, DeskError>;

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    async fn create_user(&self, user: &NewUser) -> Result<UserRecord, DeskError>;

    async fn get_user(&self, user_id: i64) -> Result<Option<UserRecord>, DeskError>;

    async fn update_user(&self, user: &UserRecord) -> Result<UserRecord, DeskError>;

    async fn delete_user(&self, user_id: i64) -> Result<(), DeskError>;

    async fn list_users(&self) -> Result<Vec<UserRecord>, DeskError>;

    // ------------------------------------------------------------------
    // Catalogs
    // ------------------------------------------------------------------

    async fn create_catalog_entry(
        &self,
        catalog: Catalog,
        name: &str,
        description: Option<&str>,
    ) -> Result<CatalogEntry, DeskError>;

    async fn get_catalog_entry(
        &self,
        catalog: Catalog,
        id: i64,
    ) -> Result<Option<CatalogEntry>, DeskError>;

    async fn get_catalog_entry_by_name(
        &self,
        catalog: Catalog,
        name: &str,
    ) -> Result<Option<CatalogEntry>, DeskError>;

    async fn update_catalog_entry(
        &self,
        catalog: Catalog,
        entry: &CatalogEntry,
    ) -> Result<CatalogEntry, DeskError>;

    async fn delete_catalog_entry(&self, catalog: Catalog, id: i64) -> Result<(), DeskError>;

    async fn list_catalog_entries(&self, catalog: Catalog)
    -> Result<Vec<CatalogEntry>, DeskError>;

    // ------------------------------------------------------------------
    // Roles and permissions
    // ------------------------------------------------------------------

    async fn create_role(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<RoleRecord, DeskError>;

    async fn get_role(&self, role_id: i64) -> Result<Option<RoleRecord>, DeskError>;

    async fn get_role_by_name(&self, name: &str) -> Result<Option<RoleRecord>, DeskError>;

    async fn update_role(&self, role: &RoleRecord) -> Result<RoleRecord, DeskError>;

    async fn delete_role(&self, role_id: i64) -> Result<(), DeskError>;

    async fn list_roles(&self) -> Result<Vec<RoleRecord>, DeskError>;

    async fn create_permission(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<PermissionRecord, DeskError>;

    async fn get_permission(
        &self,
        permission_id: i64,
    ) -> Result<Option<PermissionRecord>, DeskError>;

    async fn get_permission_by_name(
        &self,
        name: &str,
    ) -> Result<Option<PermissionRecord>, DeskError>;

    async fn update_permission(
        &self,
        permission: &PermissionRecord,
    ) -> Result<PermissionRecord, DeskError>;

    async fn delete_permission(&self, permission_id: i64) -> Result<(), DeskError>;

    async fn list_permissions(&self) -> Result<Vec<PermissionRecord>, DeskError>;

    /// Insert the pair unless it exists. Returns true if a row was inserted.
    async fn add_role_permission(
        &self,
        role_id: i64,
        permission_id: i64,
    ) -> Result<bool, DeskError>;

    /// Returns true if a row was deleted.
    async fn remove_role_permission(
        &self,
        role_id: i64,
        permission_id: i64,
    ) -> Result<bool, DeskError>;

    async fn list_role_permissions(
        &self,
        role_id: i64,
    ) -> Result<Vec<PermissionRecord>, DeskError>;

    // ------------------------------------------------------------------
    // Agent roles
    // ------------------------------------------------------------------

    /// Replace the agent's whole effective role set in one transaction:
    /// the primary role is cleared and the additional roles become `role_ids`.
    async fn replace_agent_roles(&self, agent_id: i64, role_ids: &[i64]) -> Result<(), DeskError>;

    /// Insert an additional role unless present. Returns true if a row was inserted.
    async fn add_agent_role(&self, agent_id: i64, role_id: i64) -> Result<bool, DeskError>;

    /// Drop `role_id` from the agent, whether it is the primary role, an
    /// additional role or both. Returns true if anything changed.
    async fn remove_agent_role(&self, agent_id: i64, role_id: i64) -> Result<bool, DeskError>;

    /// Effective roles: primary plus additional, each once, ordered by name.
    async fn list_agent_roles(&self, agent_id: i64) -> Result<Vec<RoleRecord>, DeskError>;

    /// Existence check over agent → role → permission. Deactivated agents hold
    /// no permissions.
    async fn agent_has_permission(
        &self,
        agent_id: i64,
        permission_name: &str,
    ) -> Result<bool, DeskError>;

    /// Union of permissions over the agent's effective roles, ordered by name.
    async fn list_agent_permissions(
        &self,
        agent_id: i64,
    ) -> Result<Vec<PermissionRecord>, DeskError>;

    // ------------------------------------------------------------------
    // Tickets
    // ------------------------------------------------------------------

    /// Insert the ticket and its `created` history entry in one transaction.
    async fn create_ticket(&self, ticket: &NewTicketRecord) -> Result<TicketRecord, DeskError>;

    async fn get_ticket(&self, ticket_id: i64) -> Result<Option<TicketRecord>, DeskError>;

    /// Conditional update of every mutable ticket column.
    ///
    /// The write only applies when the stored version equals
    /// `expected_version`; the version is then bumped and `history`, if any,
    /// is appended in the same transaction. A stale version yields
    /// [`DeskError::Conflict`], a missing ticket [`DeskError::NotFound`].
    async fn update_ticket_with_history(
        &self,
        ticket: &TicketRecord,
        expected_version: i64,
        history: Option<&NewHistoryEntry>,
    ) -> Result<TicketRecord, DeskError>;

    /// Update guarded by the version carried in `ticket`.
    async fn update_ticket(&self, ticket: &TicketRecord) -> Result<TicketRecord, DeskError> {
        self.update_ticket_with_history(ticket, ticket.version, None)
            .await
    }

    async fn delete_ticket(&self, ticket_id: i64) -> Result<(), DeskError>;

    /// Newest first.
    async fn list_tickets(
        &self,
        filter: &TicketFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TicketRecord>, DeskError>;

    /// Oldest first.
    async fn list_ticket_history(
        &self,
        ticket_id: i64,
    ) -> Result<Vec<TicketHistoryRecord>, DeskError>;

    /// Insert the comment and a `comment_added` history entry in one
    /// transaction. The ticket row itself is not rewritten.
    async fn insert_comment(
        &self,
        ticket_id: i64,
        author_agent_id: Option<i64>,
        body: &str,
    ) -> Result<CommentRecord, DeskError>;

    /// Oldest first.
    async fn list_comments(&self, ticket_id: i64) -> Result<Vec<CommentRecord>, DeskError>;

    /// Returns the existing row when the tag is already present.
    async fn add_ticket_tag(
        &self,
        ticket_id: i64,
        name: &str,
    ) -> Result<TicketTagRecord, DeskError>;

    async fn remove_ticket_tag(&self, ticket_id: i64, name: &str) -> Result<bool, DeskError>;

    async fn list_ticket_tags(&self, ticket_id: i64) -> Result<Vec<TicketTagRecord>, DeskError>;

    async fn add_ticket_attachment(
        &self,
        attachment: &NewAttachment,
    ) -> Result<AttachmentRecord, DeskError>;

    async fn list_ticket_attachments(
        &self,
        ticket_id: i64,
    ) -> Result<Vec<AttachmentRecord>, DeskError>;

    /// Relations are symmetric. Returns true if a new relation was stored.
    async fn relate_tickets(&self, ticket_id: i64, related_id: i64) -> Result<bool, DeskError>;

    async fn unrelate_tickets(&self, ticket_id: i64, related_id: i64)
    -> Result<bool, DeskError>;

    async fn list_related_tickets(&self, ticket_id: i64) -> Result<Vec<TicketRecord>, DeskError>;
}

// ============================================================================
// Backend selection
// ============================================================================

/// Connect to the configured database and return the matching backend.
///
/// `sqlite:` URLs get [`SqlitePersistence`], `postgres://` and
/// `postgresql://` URLs get [`PostgresPersistence`]. Migrations run when
/// `config.run_migrations` is set.
pub async fn connect(config: &Config) -> Result<Arc<dyn Persistence>, DeskError> {
    let url = config.database_url.as_str();

    if url.starts_with("sqlite:") {
        let (pool_options, connect_options) = sqlite_options(config)?;
        let pool = pool_options.connect_with(connect_options).await?;

        if config.run_migrations {
            crate::migrations::run_sqlite(&pool).await?;
            info!("SQLite migrations applied");
        }

        Ok(Arc::new(SqlitePersistence::new(pool)))
    } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(url)
            .await?;

        if config.run_migrations {
            crate::migrations::run_postgres(&pool).await?;
            info!("PostgreSQL migrations applied");
        }

        Ok(Arc::new(PostgresPersistence::new(pool)))
    } else {
        Err(DeskError::invalid(
            "database_url",
            "expected a sqlite: or postgres:// URL",
        ))
    }
}

/// Pool and connection settings for a `sqlite:` URL.
///
/// File databases are created when missing. An in-memory database exists only
/// while a connection holds it open, so its pool keeps exactly one connection
/// and never retires it.
fn sqlite_options(
    config: &Config,
) -> Result<(SqlitePoolOptions, SqliteConnectOptions), DeskError> {
    let url = config.database_url.as_str();
    let connect_options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

    let pool_options = SqlitePoolOptions::new().acquire_timeout(config.acquire_timeout);
    let pool_options = if url.contains(":memory:") || url.contains("mode=memory") {
        pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        pool_options.max_connections(config.max_connections)
    };

    Ok((pool_options, connect_options))
}
