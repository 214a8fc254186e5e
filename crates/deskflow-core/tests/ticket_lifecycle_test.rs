// Copyright (C) 2025 The deskflow-core contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the ticket lifecycle.

mod common;

use common::*;
use deskflow_core::persistence::{Catalog, HistoryKind, TicketFilter};
use deskflow_core::{DeskError, NewTicket};

#[tokio::test]
async fn test_new_ticket_is_open_and_unassigned() {
    let ctx = TestContext::sqlite().await;
    let reporter = ctx.user("Reporter").await;

    let ticket = ctx
        .tickets
        .create_ticket(NewTicket::new("Laptop will not boot", reporter.id))
        .await
        .unwrap();

    let open = ctx
        .store
        .get_catalog_entry_by_name(Catalog::TicketStatus, "open")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ticket.status_id, open.id);
    assert_eq!(ticket.agent_id, None);
    assert_eq!(ticket.user_id, reporter.id);

    let fetched = ctx.tickets.get_ticket(ticket.id).await.unwrap();
    assert_eq!(fetched, ticket);
}

#[tokio::test]
async fn test_get_missing_ticket() {
    let ctx = TestContext::sqlite().await;

    let err = ctx.tickets.get_ticket(42).await.unwrap_err();
    assert_eq!(err, DeskError::not_found("ticket", 42));
}

#[tokio::test]
async fn test_reassignment_is_last_write_wins() {
    let ctx = TestContext::sqlite().await;
    let reporter = ctx.user("Reporter").await;
    let ada = ctx.agent("Ada").await;
    let bob = ctx.agent("Bob").await;
    let ticket = ctx
        .tickets
        .create_ticket(NewTicket {
            status: Some("open".to_string()),
            ..NewTicket::new("Laptop will not boot", reporter.id)
        })
        .await
        .unwrap();

    ctx.tickets
        .assign_ticket_to_agent(ticket.id, ada.id)
        .await
        .unwrap();
    assert_eq!(
        ctx.tickets.get_ticket(ticket.id).await.unwrap().agent_id,
        Some(ada.id)
    );

    ctx.tickets
        .assign_ticket_to_agent(ticket.id, bob.id)
        .await
        .unwrap();
    assert_eq!(
        ctx.tickets.get_ticket(ticket.id).await.unwrap().agent_id,
        Some(bob.id)
    );

    let assignments: Vec<(Option<String>, Option<String>)> = ctx
        .tickets
        .get_ticket_history(ticket.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|h| h.kind() == Some(HistoryKind::Assigned))
        .map(|h| (h.from_value, h.to_value))
        .collect();
    assert_eq!(
        assignments,
        vec![
            (None, Some(ada.id.to_string())),
            (Some(ada.id.to_string()), Some(bob.id.to_string())),
        ]
    );
}

#[tokio::test]
async fn test_concurrent_reassignment_is_not_lost() {
    let ctx = TestContext::sqlite().await;
    let reporter = ctx.user("Reporter").await;
    let ada = ctx.agent("Ada").await;
    let bob = ctx.agent("Bob").await;
    let ticket = ctx
        .tickets
        .create_ticket(NewTicket::new("Laptop will not boot", reporter.id))
        .await
        .unwrap();

    // Both callers read version 1.
    let seen = ticket.version;

    ctx.tickets
        .assign_ticket_to_agent_at_version(ticket.id, ada.id, seen)
        .await
        .unwrap();
    let err = ctx
        .tickets
        .assign_ticket_to_agent_at_version(ticket.id, bob.id, seen)
        .await
        .unwrap_err();

    assert!(err.is_conflict());
    assert_eq!(
        ctx.tickets.get_ticket(ticket.id).await.unwrap().agent_id,
        Some(ada.id)
    );
}

#[tokio::test]
async fn test_assign_unknown_agent_or_ticket() {
    let ctx = TestContext::sqlite().await;
    let reporter = ctx.user("Reporter").await;
    let ada = ctx.agent("Ada").await;
    let ticket = ctx
        .tickets
        .create_ticket(NewTicket::new("Laptop will not boot", reporter.id))
        .await
        .unwrap();

    let err = ctx
        .tickets
        .assign_ticket_to_agent(ticket.id, 999)
        .await
        .unwrap_err();
    assert_eq!(err, DeskError::not_found("agent", 999));

    let err = ctx
        .tickets
        .assign_ticket_to_agent(999, ada.id)
        .await
        .unwrap_err();
    assert_eq!(err, DeskError::not_found("ticket", 999));
}

#[tokio::test]
async fn test_closing_ticket_is_recorded() {
    let ctx = TestContext::sqlite().await;
    let reporter = ctx.user("Reporter").await;
    let ticket = ctx
        .tickets
        .create_ticket(NewTicket::new("Laptop will not boot", reporter.id))
        .await
        .unwrap();

    let closed = ctx
        .tickets
        .change_ticket_status(ticket.id, "closed")
        .await
        .unwrap();
    assert_eq!(closed.version, ticket.version + 1);

    let history = ctx.tickets.get_ticket_history(ticket.id).await.unwrap();
    let transition = history
        .iter()
        .find(|h| h.kind() == Some(HistoryKind::StatusChanged))
        .expect("status change must be recorded");
    assert_eq!(transition.from_value.as_deref(), Some("open"));
    assert_eq!(transition.to_value.as_deref(), Some("closed"));
}

#[tokio::test]
async fn test_history_is_oldest_first() {
    let ctx = TestContext::sqlite().await;
    let reporter = ctx.user("Reporter").await;
    let ada = ctx.agent("Ada").await;
    let ticket = ctx
        .tickets
        .create_ticket(NewTicket::new("Laptop will not boot", reporter.id))
        .await
        .unwrap();

    ctx.tickets
        .assign_ticket_to_agent(ticket.id, ada.id)
        .await
        .unwrap();
    ctx.tickets
        .change_ticket_status(ticket.id, "in_progress")
        .await
        .unwrap();
    ctx.tickets
        .add_comment_to_ticket(ticket.id, Some(ada.id), "Reseated the RAM")
        .await
        .unwrap();
    ctx.tickets
        .change_ticket_status(ticket.id, "resolved")
        .await
        .unwrap();

    let kinds: Vec<Option<HistoryKind>> = ctx
        .tickets
        .get_ticket_history(ticket.id)
        .await
        .unwrap()
        .iter()
        .map(|h| h.kind())
        .collect();
    assert_eq!(
        kinds,
        vec![
            Some(HistoryKind::Created),
            Some(HistoryKind::Assigned),
            Some(HistoryKind::StatusChanged),
            Some(HistoryKind::CommentAdded),
            Some(HistoryKind::StatusChanged),
        ]
    );
}

#[tokio::test]
async fn test_comments_are_independent_rows() {
    let ctx = TestContext::sqlite().await;
    let reporter = ctx.user("Reporter").await;
    let ada = ctx.agent("Ada").await;
    let ticket = ctx
        .tickets
        .create_ticket(NewTicket::new("Laptop will not boot", reporter.id))
        .await
        .unwrap();

    ctx.tickets
        .add_comment_to_ticket(ticket.id, Some(ada.id), "  Looking into it  ")
        .await
        .unwrap();
    ctx.tickets
        .add_comment_to_ticket(ticket.id, None, "Reporter says it beeps")
        .await
        .unwrap();

    let comments = ctx.tickets.list_comments(ticket.id).await.unwrap();
    assert_eq!(comments.len(), 2);
    assert_eq!(comments[0].body, "Looking into it");
    assert_eq!(comments[0].author_agent_id, Some(ada.id));
    assert_eq!(comments[1].author_agent_id, None);

    // A stale copy of the ticket can still be written: comments never
    // bumped its version.
    assert_eq!(
        ctx.tickets.get_ticket(ticket.id).await.unwrap().version,
        ticket.version
    );
    ctx.store.update_ticket(&ticket).await.unwrap();
}

#[tokio::test]
async fn test_related_tickets_and_listing() {
    let ctx = TestContext::sqlite().await;
    let reporter = ctx.user("Reporter").await;
    let ada = ctx.agent("Ada").await;

    let printer = ctx
        .tickets
        .create_ticket(NewTicket::new("Printer jammed", reporter.id))
        .await
        .unwrap();
    let toner = ctx
        .tickets
        .create_ticket(NewTicket::new("Toner empty", reporter.id))
        .await
        .unwrap();
    ctx.tickets
        .assign_ticket_to_agent(toner.id, ada.id)
        .await
        .unwrap();

    assert!(ctx.tickets.relate_tickets(printer.id, toner.id).await.unwrap());
    assert!(!ctx.tickets.relate_tickets(toner.id, printer.id).await.unwrap());
    let related = ctx.tickets.list_related_tickets(toner.id).await.unwrap();
    assert_eq!(related.len(), 1);
    assert_eq!(related[0].id, printer.id);

    let mine = ctx
        .tickets
        .list_tickets(
            &TicketFilter {
                agent_id: Some(ada.id),
                ..Default::default()
            },
            50,
            0,
        )
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, toner.id);

    let queue = ctx
        .tickets
        .list_tickets(
            &TicketFilter {
                unassigned_only: true,
                ..Default::default()
            },
            50,
            0,
        )
        .await
        .unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].id, printer.id);
}

#[tokio::test]
async fn test_postgres_lifecycle() {
    skip_if_no_db!();

    let Some(ctx) = TestContext::postgres().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    let reporter = ctx.user("Reporter").await;
    let ada = ctx.agent("Ada").await;
    let bob = ctx.agent("Bob").await;
    let ticket = ctx
        .tickets
        .create_ticket(NewTicket::new("VPN drops every hour", reporter.id))
        .await
        .unwrap();

    ctx.tickets
        .assign_ticket_to_agent(ticket.id, ada.id)
        .await
        .unwrap();
    ctx.tickets
        .assign_ticket_to_agent(ticket.id, bob.id)
        .await
        .unwrap();
    ctx.tickets
        .change_ticket_status(ticket.id, "closed")
        .await
        .unwrap();
    ctx.tickets.add_tag_to_ticket(ticket.id, "VPN").await.unwrap();

    let fetched = ctx.tickets.get_ticket(ticket.id).await.unwrap();
    assert_eq!(fetched.agent_id, Some(bob.id));

    let history = ctx.tickets.get_ticket_history(ticket.id).await.unwrap();
    assert!(
        history
            .iter()
            .any(|h| h.kind() == Some(HistoryKind::StatusChanged)
                && h.to_value.as_deref() == Some("closed"))
    );

    let tags = ctx.tickets.list_tags(ticket.id).await.unwrap();
    assert_eq!(tags[0].name, "vpn");

    ctx.store.delete_ticket(ticket.id).await.unwrap();
}
