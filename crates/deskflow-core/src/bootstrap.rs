// Copyright (C) 2025 The deskflow-core contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Default role catalog seeded on startup.

use tracing::{info, warn};

use crate::access_control::{AccessControl, BatchOutcome};
use crate::error::Result;

/// Roles every deployment starts with, and the permissions they carry.
pub const DEFAULT_ROLES: &[(&str, &[&str])] = &[
    (
        "admin",
        &[
            "view_tickets",
            "create_tickets",
            "assign_tickets",
            "close_tickets",
            "comment_tickets",
            "manage_agents",
            "manage_roles",
            "manage_users",
        ],
    ),
    (
        "supervisor",
        &[
            "view_tickets",
            "create_tickets",
            "assign_tickets",
            "close_tickets",
            "comment_tickets",
            "manage_agents",
        ],
    ),
    (
        "agent",
        &["view_tickets", "create_tickets", "comment_tickets"],
    ),
];

/// Make sure every default role exists with its permissions.
///
/// Safe to run on every start: existing roles and grants are left as they
/// are. Per-permission failures are logged and returned, not raised.
pub async fn seed_default_roles(acl: &AccessControl) -> Result<Vec<(&'static str, BatchOutcome)>> {
    let mut outcomes = Vec::with_capacity(DEFAULT_ROLES.len());

    for (role, permissions) in DEFAULT_ROLES {
        match acl.create_role(role, None).await {
            Ok(_) => info!(role, "Default role created"),
            Err(e) if e.is_conflict() => {}
            Err(e) => return Err(e),
        }

        let outcome = acl
            .assign_permissions_to_role_base(role, permissions)
            .await?;
        for skipped in &outcome.errors {
            warn!(
                role,
                permission = %skipped.name,
                error = %skipped.error,
                "Default permission not granted"
            );
        }
        outcomes.push((*role, outcome));
    }

    Ok(outcomes)
}
