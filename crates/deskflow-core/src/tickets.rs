// Copyright (C) 2025 The deskflow-core contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ticket lifecycle operations.
//!
//! [`TicketLifecycle`] validates requests, resolves names to lookup rows and
//! hands the writes to the entity store. Status changes and assignments are
//! versioned writes that carry their history entry in the same transaction;
//! comments, tags and attachments are separate rows and never rewrite the
//! ticket.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::error::{DeskError, Result};
use crate::persistence::{
    AttachmentRecord, Catalog, CommentRecord, HistoryKind, NewAttachment, NewHistoryEntry,
    NewTicketRecord, Persistence, TicketFilter, TicketHistoryRecord, TicketRecord,
    TicketTagRecord,
};

/// Largest page [`TicketLifecycle::list_tickets`] will return.
pub const MAX_PAGE_SIZE: i64 = 500;

/// Request to open a ticket.
#[derive(Debug, Clone, Default)]
pub struct NewTicket {
    /// Short summary, required.
    pub subject: String,
    /// Full problem description.
    pub description: String,
    /// Reporting user.
    pub user_id: i64,
    /// Initial status name. `None` uses the configured default.
    pub status: Option<String>,
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

impl NewTicket {
    /// Ticket with a subject and reporter, everything else defaulted.
    pub fn new(subject: impl Into<String>, user_id: i64) -> Self {
        Self {
            subject: subject.into(),
            user_id,
            ..Default::default()
        }
    }
}

/// Trim and lower-case a tag. `None` when nothing is left.
pub fn normalize_tag(raw: &str) -> Option<String> {
    let tag = raw.trim().to_lowercase();
    (!tag.is_empty()).then_some(tag)
}

/// Ticket service over the entity store.
#[derive(Clone)]
pub struct TicketLifecycle {
    persistence: Arc<dyn Persistence>,
    default_status: String,
}

impl TicketLifecycle {
    /// Create the service. New tickets without a status get `default_status`.
    pub fn new(persistence: Arc<dyn Persistence>, default_status: impl Into<String>) -> Self {
        Self {
            persistence,
            default_status: default_status.into(),
        }
    }

    /// Create the service using the configured default status.
    pub fn from_config(persistence: Arc<dyn Persistence>, config: &Config) -> Self {
        Self::new(persistence, config.default_ticket_status.clone())
    }

    async fn require_ticket(&self, ticket_id: i64) -> Result<TicketRecord> {
        self.persistence
            .get_ticket(ticket_id)
            .await?
            .ok_or_else(|| DeskError::not_found("ticket", ticket_id))
    }

    async fn require_status(&self, name: &str) -> Result<i64> {
        self.persistence
            .get_catalog_entry_by_name(Catalog::TicketStatus, name)
            .await?
            .map(|s| s.id)
            .ok_or_else(|| DeskError::not_found(Catalog::TicketStatus.entity(), name))
    }

    async fn status_name(&self, status_id: i64) -> Result<String> {
        Ok(self
            .persistence
            .get_catalog_entry(Catalog::TicketStatus, status_id)
            .await?
            .map(|s| s.name)
            .unwrap_or_else(|| status_id.to_string()))
    }

    async fn require_catalog(&self, catalog: Catalog, id: Option<i64>) -> Result<()> {
        if let Some(id) = id
            && self.persistence.get_catalog_entry(catalog, id).await?.is_none()
        {
            return Err(DeskError::not_found(catalog.entity(), id));
        }
        Ok(())
    }

    /// Open a ticket.
    ///
    /// The ticket starts unassigned, at version 1, with a `created` history
    /// entry naming its initial status.
    ///
    /// # Errors
    ///
    /// - [`DeskError::InvalidArgument`] for a blank subject
    /// - [`DeskError::NotFound`] for an unknown reporter, status or lookup id
    #[instrument(skip(self, ticket), fields(user_id = ticket.user_id))]
    pub async fn create_ticket(&self, ticket: NewTicket) -> Result<TicketRecord> {
        let subject = ticket.subject.trim();
        if subject.is_empty() {
            return Err(DeskError::invalid("subject", "must not be empty"));
        }

        if self.persistence.get_user(ticket.user_id).await?.is_none() {
            return Err(DeskError::not_found("user", ticket.user_id));
        }

        let status_name = ticket
            .status
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(self.default_status.as_str());
        let status_id = self.require_status(status_name).await?;

        self.require_catalog(Catalog::Priority, ticket.priority_id)
            .await?;
        self.require_catalog(Catalog::Category, ticket.category_id)
            .await?;
        self.require_catalog(Catalog::SubCategory, ticket.sub_category_id)
            .await?;
        self.require_catalog(Catalog::Sla, ticket.sla_id).await?;

        let record = self
            .persistence
            .create_ticket(&NewTicketRecord {
                subject: subject.to_string(),
                description: ticket.description,
                user_id: ticket.user_id,
                status_id,
                priority_id: ticket.priority_id,
                category_id: ticket.category_id,
                sub_category_id: ticket.sub_category_id,
                sla_id: ticket.sla_id,
                due_at: ticket.due_at,
            })
            .await?;

        info!(ticket_id = record.id, status = %status_name, "Ticket created");
        Ok(record)
    }

    /// Load a ticket.
    ///
    /// # Errors
    ///
    /// [`DeskError::NotFound`] when the ticket does not exist.
    #[instrument(skip(self))]
    pub async fn get_ticket(&self, ticket_id: i64) -> Result<TicketRecord> {
        self.require_ticket(ticket_id).await
    }

    /// Assign the ticket to an agent.
    ///
    /// Calls in sequence are last-write-wins. The write is conditional on the
    /// version that was read, so a reassignment that lands in between yields
    /// [`DeskError::Conflict`] instead of being overwritten silently.
    #[instrument(skip(self))]
    pub async fn assign_ticket_to_agent(
        &self,
        ticket_id: i64,
        agent_id: i64,
    ) -> Result<TicketRecord> {
        let ticket = self.require_ticket(ticket_id).await?;
        self.assign(ticket, agent_id, None).await
    }

    /// Assign the ticket only if it is still at `expected_version`.
    ///
    /// # Errors
    ///
    /// - [`DeskError::Conflict`] when the ticket moved past `expected_version`
    /// - [`DeskError::NotFound`] for an unknown ticket or agent
    /// - [`DeskError::InvalidArgument`] for a deactivated agent
    #[instrument(skip(self))]
    pub async fn assign_ticket_to_agent_at_version(
        &self,
        ticket_id: i64,
        agent_id: i64,
        expected_version: i64,
    ) -> Result<TicketRecord> {
        let ticket = self.require_ticket(ticket_id).await?;
        self.assign(ticket, agent_id, Some(expected_version)).await
    }

    async fn assign(
        &self,
        mut ticket: TicketRecord,
        agent_id: i64,
        expected_version: Option<i64>,
    ) -> Result<TicketRecord> {
        let expected_version = expected_version.unwrap_or(ticket.version);
        if ticket.version != expected_version {
            return Err(stale(&ticket, expected_version));
        }

        let agent = self
            .persistence
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| DeskError::not_found("agent", agent_id))?;
        if agent.is_deactivated() {
            return Err(DeskError::invalid("agent_id", "agent is deactivated"));
        }

        if ticket.agent_id == Some(agent_id) {
            debug!("Ticket already assigned to agent");
            return Ok(ticket);
        }

        let entry = NewHistoryEntry::transition(
            HistoryKind::Assigned,
            ticket.agent_id.map(|id| id.to_string()),
            Some(agent_id.to_string()),
        );
        let previous = ticket.agent_id.replace(agent_id);

        let updated = self
            .persistence
            .update_ticket_with_history(&ticket, expected_version, Some(&entry))
            .await?;

        info!(
            ticket_id = updated.id,
            agent_id,
            previous_agent_id = ?previous,
            version = updated.version,
            "Ticket assigned"
        );
        Ok(updated)
    }

    /// Remove the assignee. A ticket without one is returned unchanged.
    #[instrument(skip(self))]
    pub async fn unassign_ticket(&self, ticket_id: i64) -> Result<TicketRecord> {
        let mut ticket = self.require_ticket(ticket_id).await?;

        let Some(previous) = ticket.agent_id.take() else {
            debug!("Ticket has no assignee");
            return Ok(ticket);
        };

        let entry = NewHistoryEntry::transition(
            HistoryKind::Unassigned,
            Some(previous.to_string()),
            None,
        );
        let updated = self
            .persistence
            .update_ticket_with_history(&ticket, ticket.version, Some(&entry))
            .await?;

        info!(ticket_id, previous_agent_id = previous, "Ticket unassigned");
        Ok(updated)
    }

    /// Move the ticket to the named status and record the transition.
    ///
    /// The status write and its history entry commit together. Moving to the
    /// current status changes nothing and records nothing.
    ///
    /// # Errors
    ///
    /// - [`DeskError::NotFound`] for an unknown ticket or status
    /// - [`DeskError::Conflict`] when the ticket changed concurrently
    #[instrument(skip(self))]
    pub async fn change_ticket_status(
        &self,
        ticket_id: i64,
        status_name: &str,
    ) -> Result<TicketRecord> {
        let status_name = status_name.trim();
        let status_id = self.require_status(status_name).await?;
        let mut ticket = self.require_ticket(ticket_id).await?;

        if ticket.status_id == status_id {
            debug!("Ticket already in requested status");
            return Ok(ticket);
        }

        let previous = self.status_name(ticket.status_id).await?;
        let entry = NewHistoryEntry::transition(
            HistoryKind::StatusChanged,
            Some(previous.clone()),
            Some(status_name.to_string()),
        );
        ticket.status_id = status_id;

        let updated = self
            .persistence
            .update_ticket_with_history(&ticket, ticket.version, Some(&entry))
            .await?;

        info!(
            ticket_id,
            from = %previous,
            to = %status_name,
            version = updated.version,
            "Ticket status changed"
        );
        Ok(updated)
    }

    /// Add a comment. The ticket row is not rewritten.
    ///
    /// # Errors
    ///
    /// - [`DeskError::InvalidArgument`] for a blank body
    /// - [`DeskError::NotFound`] for an unknown ticket or author
    #[instrument(skip(self, body))]
    pub async fn add_comment_to_ticket(
        &self,
        ticket_id: i64,
        author_agent_id: Option<i64>,
        body: &str,
    ) -> Result<CommentRecord> {
        let body = body.trim();
        if body.is_empty() {
            return Err(DeskError::invalid("body", "must not be empty"));
        }

        self.require_ticket(ticket_id).await?;
        if let Some(author) = author_agent_id
            && self.persistence.get_agent(author).await?.is_none()
        {
            return Err(DeskError::not_found("agent", author));
        }

        let comment = self
            .persistence
            .insert_comment(ticket_id, author_agent_id, body)
            .await?;

        info!(ticket_id, comment_id = comment.id, "Comment added");
        Ok(comment)
    }

    /// Comments on the ticket, oldest first.
    #[instrument(skip(self))]
    pub async fn list_comments(&self, ticket_id: i64) -> Result<Vec<CommentRecord>> {
        self.require_ticket(ticket_id).await?;
        self.persistence.list_comments(ticket_id).await
    }

    /// Tag the ticket. Tags are trimmed and lower-cased; adding a tag twice
    /// returns the existing one.
    #[instrument(skip(self))]
    pub async fn add_tag_to_ticket(&self, ticket_id: i64, tag: &str) -> Result<TicketTagRecord> {
        let tag = normalize_tag(tag).ok_or_else(|| DeskError::invalid("tag", "must not be empty"))?;
        self.require_ticket(ticket_id).await?;

        let record = self.persistence.add_ticket_tag(ticket_id, &tag).await?;
        debug!(tag = %record.name, "Tag added");
        Ok(record)
    }

    /// Remove a tag. Returns false when the ticket did not carry it.
    #[instrument(skip(self))]
    pub async fn remove_tag_from_ticket(&self, ticket_id: i64, tag: &str) -> Result<bool> {
        let tag = normalize_tag(tag).ok_or_else(|| DeskError::invalid("tag", "must not be empty"))?;
        self.require_ticket(ticket_id).await?;

        let removed = self.persistence.remove_ticket_tag(ticket_id, &tag).await?;
        debug!(removed, "Tag removal processed");
        Ok(removed)
    }

    /// Tags on the ticket, by name.
    #[instrument(skip(self))]
    pub async fn list_tags(&self, ticket_id: i64) -> Result<Vec<TicketTagRecord>> {
        self.require_ticket(ticket_id).await?;
        self.persistence.list_ticket_tags(ticket_id).await
    }

    /// Record a media attachment stored elsewhere.
    #[instrument(skip(self, url, content_type))]
    pub async fn attach_media(
        &self,
        ticket_id: i64,
        file_name: &str,
        url: &str,
        content_type: Option<&str>,
    ) -> Result<AttachmentRecord> {
        let file_name = file_name.trim();
        if file_name.is_empty() {
            return Err(DeskError::invalid("file_name", "must not be empty"));
        }
        let url = url.trim();
        if url.is_empty() {
            return Err(DeskError::invalid("url", "must not be empty"));
        }
        self.require_ticket(ticket_id).await?;

        let attachment = self
            .persistence
            .add_ticket_attachment(&NewAttachment {
                ticket_id,
                file_name: file_name.to_string(),
                url: url.to_string(),
                content_type: content_type.map(str::to_string),
            })
            .await?;

        info!(ticket_id, attachment_id = attachment.id, "Media attached");
        Ok(attachment)
    }

    /// Attachments on the ticket in the order they were added.
    #[instrument(skip(self))]
    pub async fn list_attachments(&self, ticket_id: i64) -> Result<Vec<AttachmentRecord>> {
        self.require_ticket(ticket_id).await?;
        self.persistence.list_ticket_attachments(ticket_id).await
    }

    /// Link two tickets. Relations are symmetric; returns false when the
    /// link already existed.
    #[instrument(skip(self))]
    pub async fn relate_tickets(&self, ticket_id: i64, related_id: i64) -> Result<bool> {
        if ticket_id == related_id {
            return Err(DeskError::invalid(
                "related_ticket_id",
                "a ticket cannot be related to itself",
            ));
        }
        self.require_ticket(ticket_id).await?;
        self.require_ticket(related_id).await?;

        self.persistence.relate_tickets(ticket_id, related_id).await
    }

    /// Remove the link between two tickets in either direction. Returns
    /// false when they were not linked.
    #[instrument(skip(self))]
    pub async fn unrelate_tickets(&self, ticket_id: i64, related_id: i64) -> Result<bool> {
        self.require_ticket(ticket_id).await?;
        self.require_ticket(related_id).await?;

        let removed = self
            .persistence
            .unrelate_tickets(ticket_id, related_id)
            .await?;
        if removed {
            info!("Ticket relation removed");
        }
        Ok(removed)
    }

    /// Tickets linked to this one.
    #[instrument(skip(self))]
    pub async fn list_related_tickets(&self, ticket_id: i64) -> Result<Vec<TicketRecord>> {
        self.require_ticket(ticket_id).await?;
        self.persistence.list_related_tickets(ticket_id).await
    }

    /// Page through tickets, newest first.
    #[instrument(skip(self, filter))]
    pub async fn list_tickets(
        &self,
        filter: &TicketFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TicketRecord>> {
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(DeskError::invalid(
                "limit",
                format!("must be between 1 and {}", MAX_PAGE_SIZE),
            ));
        }
        if offset < 0 {
            return Err(DeskError::invalid("offset", "must not be negative"));
        }

        self.persistence.list_tickets(filter, limit, offset).await
    }

    /// Every history entry of the ticket, oldest first.
    #[instrument(skip(self))]
    pub async fn get_ticket_history(&self, ticket_id: i64) -> Result<Vec<TicketHistoryRecord>> {
        self.require_ticket(ticket_id).await?;
        self.persistence.list_ticket_history(ticket_id).await
    }
}

fn stale(ticket: &TicketRecord, expected_version: i64) -> DeskError {
    DeskError::Conflict {
        entity: "ticket",
        details: format!(
            "ticket {} is at version {}, expected {}",
            ticket.id, ticket.version, expected_version
        ),
    }
}
