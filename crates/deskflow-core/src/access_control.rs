// Copyright (C) 2025 The deskflow-core contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent, role and permission graph.
//!
//! [`AccessControl`] resolves names to rows and writes the join rows through
//! the entity store. It keeps no state besides the store handle.
//!
//! Roles reach an agent two ways: the primary role on the agent row and any
//! number of additional roles. The union of both is the agent's effective role
//! set, and a permission check asks whether any role in that set carries the
//! named permission.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::{DeskError, Result};
use crate::persistence::{AgentRecord, Persistence, PermissionRecord, RoleRecord};

/// One name in a batch call that could not be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItemError {
    /// The role or permission name as supplied by the caller.
    pub name: String,
    /// Why it was skipped.
    pub error: DeskError,
}

/// Result of a batch operation that applies what it can.
///
/// Callers must look at both fields: `applied` alone does not tell whether
/// some names were skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Number of distinct entries that were applied. A name repeated in
    /// the request counts once.
    pub applied: usize,
    /// Names that were skipped, with the reason.
    pub errors: Vec<BatchItemError>,
}

impl BatchOutcome {
    /// True when every name was applied.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    fn skip(&mut self, name: &str, error: DeskError) {
        self.errors.push(BatchItemError {
            name: name.to_string(),
            error,
        });
    }
}

/// Access-control service over the entity store.
#[derive(Clone)]
pub struct AccessControl {
    persistence: Arc<dyn Persistence>,
}

impl AccessControl {
    /// Create the service with the given persistence backend.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    async fn require_agent(&self, agent_id: i64) -> Result<AgentRecord> {
        self.persistence
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| DeskError::not_found("agent", agent_id))
    }

    async fn require_role(&self, role_name: &str) -> Result<RoleRecord> {
        self.persistence
            .get_role_by_name(role_name)
            .await?
            .ok_or_else(|| DeskError::not_found("role", role_name))
    }

    /// Create a role. Names are unique; a duplicate is a conflict.
    #[instrument(skip(self, description))]
    pub async fn create_role(&self, name: &str, description: Option<&str>) -> Result<RoleRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DeskError::invalid("role", "name must not be empty"));
        }

        let role = self.persistence.create_role(name, description).await?;
        info!(role_id = role.id, "Role created");
        Ok(role)
    }

    /// Create a permission. Names are unique; a duplicate is a conflict.
    #[instrument(skip(self, description))]
    pub async fn create_permission(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<PermissionRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DeskError::invalid("permission", "name must not be empty"));
        }

        let permission = self.persistence.create_permission(name, description).await?;
        info!(permission_id = permission.id, "Permission created");
        Ok(permission)
    }

    /// Make `role_name` the agent's primary role.
    ///
    /// Replaces whatever primary role the agent had. Additional roles are
    /// left alone.
    ///
    /// # Errors
    ///
    /// [`DeskError::NotFound`] when the agent or the role does not exist.
    #[instrument(skip(self))]
    pub async fn assign_role_to_agent(&self, agent_id: i64, role_name: &str) -> Result<()> {
        let role = self.require_role(role_name).await?;
        let agent = self.require_agent(agent_id).await?;

        if agent.role_id == Some(role.id) {
            debug!("Role already primary, nothing to do");
            return Ok(());
        }

        self.persistence
            .set_agent_primary_role(agent_id, Some(role.id))
            .await?;

        info!(
            role_id = role.id,
            previous_role_id = ?agent.role_id,
            "Primary role assigned"
        );
        Ok(())
    }

    /// Replace the agent's effective role set with the named roles.
    ///
    /// Each name is resolved on its own; names that do not resolve are
    /// reported in [`BatchOutcome::errors`] and skipped. The resolved roles
    /// then replace the agent's roles in one transaction, the primary role
    /// included, so afterwards the effective set is exactly the resolved
    /// names.
    ///
    /// # Errors
    ///
    /// [`DeskError::NotFound`] when the agent does not exist. Nothing is
    /// written in that case.
    #[instrument(skip(self, role_names), fields(requested = role_names.len()))]
    pub async fn assign_roles_to_agent(
        &self,
        agent_id: i64,
        role_names: &[&str],
    ) -> Result<BatchOutcome> {
        self.require_agent(agent_id).await?;

        let mut outcome = BatchOutcome::default();
        let mut role_ids: Vec<i64> = Vec::with_capacity(role_names.len());

        for name in role_names {
            match self.require_role(name).await {
                Ok(role) => {
                    if role_ids.contains(&role.id) {
                        debug!(role = %name, "Duplicate role name ignored");
                    } else {
                        role_ids.push(role.id);
                        outcome.applied += 1;
                    }
                }
                Err(e) => {
                    warn!(role = %name, error = %e, "Skipping role");
                    outcome.skip(name, e);
                }
            }
        }

        self.persistence
            .replace_agent_roles(agent_id, &role_ids)
            .await?;

        info!(
            applied = outcome.applied,
            skipped = outcome.errors.len(),
            "Agent roles replaced"
        );
        Ok(outcome)
    }

    /// Associate a permission with a role.
    ///
    /// The permission is taken by id when `permission_id` is positive,
    /// otherwise by non-empty `permission_name`. Associating an existing pair
    /// again changes nothing. Returns true when a new association was stored.
    ///
    /// # Errors
    ///
    /// - [`DeskError::InvalidArgument`] when neither identifier is usable
    /// - [`DeskError::NotFound`] when the role or the permission does not exist
    #[instrument(skip(self))]
    pub async fn associate_permission_with_role(
        &self,
        role_id: i64,
        permission_name: Option<&str>,
        permission_id: Option<i64>,
    ) -> Result<bool> {
        let permission = match (permission_id.filter(|id| *id > 0), permission_name) {
            (Some(id), _) => self
                .persistence
                .get_permission(id)
                .await?
                .ok_or_else(|| DeskError::not_found("permission", id))?,
            (None, Some(name)) if !name.trim().is_empty() => {
                let name = name.trim();
                self.persistence
                    .get_permission_by_name(name)
                    .await?
                    .ok_or_else(|| DeskError::not_found("permission", name))?
            }
            _ => {
                return Err(DeskError::invalid(
                    "permission",
                    "either a positive id or a non-empty name is required",
                ));
            }
        };

        if self.persistence.get_role(role_id).await?.is_none() {
            return Err(DeskError::not_found("role", role_id));
        }

        let inserted = self
            .persistence
            .add_role_permission(role_id, permission.id)
            .await?;

        if inserted {
            info!(permission_id = permission.id, "Permission associated with role");
        } else {
            debug!(permission_id = permission.id, "Permission already associated");
        }
        Ok(inserted)
    }

    /// Grant the named permissions to a role, creating missing permissions.
    ///
    /// Per-name failures are collected in the outcome. Names already granted
    /// count as applied.
    ///
    /// # Errors
    ///
    /// [`DeskError::NotFound`] when the role does not exist.
    #[instrument(skip(self, permission_names), fields(requested = permission_names.len()))]
    pub async fn assign_permissions_to_role_base(
        &self,
        role_name: &str,
        permission_names: &[&str],
    ) -> Result<BatchOutcome> {
        let role = self.require_role(role_name).await?;
        let mut outcome = BatchOutcome::default();
        let mut seen: Vec<&str> = Vec::with_capacity(permission_names.len());

        for name in permission_names {
            if seen.contains(&name.trim()) {
                debug!(permission = %name, "Duplicate permission name ignored");
                continue;
            }
            seen.push(name.trim());

            match self.grant_permission(&role, name).await {
                Ok(()) => outcome.applied += 1,
                Err(e) => {
                    warn!(permission = %name, error = %e, "Skipping permission");
                    outcome.skip(name, e);
                }
            }
        }

        info!(
            role_id = role.id,
            applied = outcome.applied,
            skipped = outcome.errors.len(),
            "Permissions assigned to role"
        );
        Ok(outcome)
    }

    async fn grant_permission(&self, role: &RoleRecord, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DeskError::invalid("permission", "name must not be empty"));
        }

        let permission = match self.persistence.get_permission_by_name(name).await? {
            Some(existing) => existing,
            None => match self.persistence.create_permission(name, None).await {
                Ok(created) => {
                    debug!(permission_id = created.id, "Permission created");
                    created
                }
                // Someone else created it between our lookup and insert.
                Err(e) if e.is_conflict() => self
                    .persistence
                    .get_permission_by_name(name)
                    .await?
                    .ok_or(e)?,
                Err(e) => return Err(e),
            },
        };

        self.persistence
            .add_role_permission(role.id, permission.id)
            .await?;
        Ok(())
    }

    /// Give the agent `role_name` as an additional role.
    ///
    /// The primary role is left alone. Returns true when the agent did not
    /// already hold the role through either slot.
    ///
    /// # Errors
    ///
    /// [`DeskError::NotFound`] when the agent or the role does not exist.
    #[instrument(skip(self))]
    pub async fn add_role_to_agent(&self, agent_id: i64, role_name: &str) -> Result<bool> {
        let role = self.require_role(role_name).await?;
        let agent = self.require_agent(agent_id).await?;

        if agent.role_id == Some(role.id) {
            debug!(role_id = role.id, "Role already primary, nothing to do");
            return Ok(false);
        }

        let added = self.persistence.add_agent_role(agent_id, role.id).await?;
        if added {
            info!(role_id = role.id, "Additional role granted");
        } else {
            debug!(role_id = role.id, "Agent already held role");
        }
        Ok(added)
    }

    /// Take a role away from an agent, primary or additional.
    ///
    /// Revoking a role the agent does not hold, or a role name that does not
    /// exist, succeeds without changes.
    ///
    /// # Errors
    ///
    /// [`DeskError::NotFound`] when the agent does not exist.
    #[instrument(skip(self))]
    pub async fn revoke_role_from_agent(&self, agent_id: i64, role_name: &str) -> Result<()> {
        self.require_agent(agent_id).await?;

        let Some(role) = self.persistence.get_role_by_name(role_name).await? else {
            debug!("Unknown role, nothing to revoke");
            return Ok(());
        };

        if self.persistence.remove_agent_role(agent_id, role.id).await? {
            info!(role_id = role.id, "Role revoked from agent");
        } else {
            debug!(role_id = role.id, "Agent did not hold role");
        }
        Ok(())
    }

    /// Remove a permission from a role. Unknown names and missing pairs are
    /// not errors.
    #[instrument(skip(self))]
    pub async fn revoke_permission_from_role(
        &self,
        role_name: &str,
        permission_name: &str,
    ) -> Result<()> {
        let Some(role) = self.persistence.get_role_by_name(role_name).await? else {
            debug!("Unknown role, nothing to revoke");
            return Ok(());
        };
        let Some(permission) = self
            .persistence
            .get_permission_by_name(permission_name)
            .await?
        else {
            debug!("Unknown permission, nothing to revoke");
            return Ok(());
        };

        if self
            .persistence
            .remove_role_permission(role.id, permission.id)
            .await?
        {
            info!(
                role_id = role.id,
                permission_id = permission.id,
                "Permission revoked from role"
            );
        }
        Ok(())
    }

    /// Whether any of the agent's effective roles carries `permission_name`.
    ///
    /// False when the agent has no roles or is deactivated.
    ///
    /// # Errors
    ///
    /// [`DeskError::NotFound`] when the agent does not exist.
    #[instrument(skip(self))]
    pub async fn has_permission(&self, agent_id: i64, permission_name: &str) -> Result<bool> {
        self.require_agent(agent_id).await?;

        let allowed = self
            .persistence
            .agent_has_permission(agent_id, permission_name)
            .await?;

        debug!(allowed, "Permission checked");
        Ok(allowed)
    }

    /// Primary and additional roles, each once, ordered by name.
    #[instrument(skip(self))]
    pub async fn effective_roles(&self, agent_id: i64) -> Result<Vec<RoleRecord>> {
        self.require_agent(agent_id).await?;
        self.persistence.list_agent_roles(agent_id).await
    }

    /// Every permission the agent holds through its effective roles.
    #[instrument(skip(self))]
    pub async fn effective_permissions(&self, agent_id: i64) -> Result<Vec<PermissionRecord>> {
        self.require_agent(agent_id).await?;
        self.persistence.list_agent_permissions(agent_id).await
    }
}
