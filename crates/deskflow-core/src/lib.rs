// Copyright (C) 2025 The deskflow-core contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deskflow Core - Service Desk Data Access
//!
//! This crate is the data-access core of a service-desk system. It stores
//! agents, end users, roles, permissions and tickets, answers authorization
//! questions, and applies the operations that move a ticket through its life.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │        AccessControl         │   │       TicketLifecycle        │
//! │  agent ↔ role ↔ permission   │   │  assign, status, comments,   │
//! │                              │   │  tags, history               │
//! └──────────────────────────────┘   └──────────────────────────────┘
//!                │                                  │
//!                └────────────────┬─────────────────┘
//!                                 ▼
//!                 ┌──────────────────────────────┐
//!                 │   Arc<dyn Persistence>       │
//!                 │   (entity store)             │
//!                 └──────────────────────────────┘
//!                        │                │
//!                        ▼                ▼
//!                 ┌────────────┐   ┌────────────┐
//!                 │ PostgreSQL │   │   SQLite   │
//!                 └────────────┘   └────────────┘
//! ```
//!
//! Both services are stateless. The entity store is the only component that
//! talks to the database.
//!
//! # Access Control
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `assign_role_to_agent` | Replace the agent's primary role |
//! | `assign_roles_to_agent` | Replace the agent's whole role set, reporting unknown names |
//! | `add_role_to_agent` | Grant an additional role, leaving the primary one |
//! | `associate_permission_with_role` | Grant a permission by id or name, idempotently |
//! | `assign_permissions_to_role_base` | Grant permissions by name, creating missing ones |
//! | `revoke_role_from_agent` | Remove a role; no-op when not held |
//! | `revoke_permission_from_role` | Remove a grant; no-op when absent |
//! | `has_permission` | Existence check over the agent's effective roles |
//!
//! # Ticket Lifecycle
//!
//! | Operation | History entry |
//! |-----------|---------------|
//! | `create_ticket` | `created` |
//! | `assign_ticket_to_agent` | `assigned` |
//! | `unassign_ticket` | `unassigned` |
//! | `change_ticket_status` | `status_changed` |
//! | `add_comment_to_ticket` | `comment_added` |
//!
//! Ticket rows carry a version. Every write is conditional on the version
//! that was read and bumps it; a write that lost a race returns
//! [`DeskError::Conflict`](error::DeskError::Conflict). History entries are
//! written in the same transaction as the change they describe.
//!
//! # Configuration
//!
//! See [`config::Config::from_env`] for the environment variables.
//!
//! # Example
//!
//! ```ignore
//! use deskflow_core::{AccessControl, Config, TicketLifecycle, persistence};
//!
//! let config = Config::from_env()?;
//! let store = persistence::connect(&config).await?;
//! let acl = AccessControl::new(store.clone());
//! let tickets = TicketLifecycle::from_config(store, &config);
//!
//! if acl.has_permission(agent_id, "assign_tickets").await? {
//!     tickets.assign_ticket_to_agent(ticket_id, agent_id).await?;
//! }
//! ```

#![deny(missing_docs)]

/// Agent, role and permission management.
pub mod access_control;

/// Default role catalog.
pub mod bootstrap;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Entity store and its backends.
pub mod persistence;

/// Ticket lifecycle operations.
pub mod tickets;

pub use access_control::{AccessControl, BatchItemError, BatchOutcome};
pub use config::Config;
pub use error::DeskError;
pub use tickets::{NewTicket, TicketLifecycle};
