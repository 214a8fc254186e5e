// Copyright (C) 2025 The deskflow-core contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for deskflow-core integration tests.
//!
//! Provides TestContext wiring both services to one store.

#![allow(dead_code)]

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use deskflow_core::persistence::{
    AgentRecord, NewAgent, NewUser, Persistence, PostgresPersistence, SqlitePersistence,
    UserRecord,
};
use deskflow_core::{AccessControl, TicketLifecycle};

/// Services plus the store underneath them.
pub struct TestContext {
    pub store: Arc<dyn Persistence>,
    pub acl: AccessControl,
    pub tickets: TicketLifecycle,
}

impl TestContext {
    /// Context over a fresh in-memory SQLite database.
    pub async fn sqlite() -> Self {
        let store = SqlitePersistence::in_memory()
            .await
            .expect("Failed to create in-memory SQLite store");
        Self::with_store(Arc::new(store))
    }

    /// Context over TEST_DATABASE_URL, or `None` when it is unset or unreachable.
    pub async fn postgres() -> Option<Self> {
        let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&database_url).await.ok()?;
        deskflow_core::migrations::run_postgres(&pool).await.ok()?;
        Some(Self::with_store(Arc::new(PostgresPersistence::new(pool))))
    }

    fn with_store(store: Arc<dyn Persistence>) -> Self {
        Self {
            acl: AccessControl::new(store.clone()),
            tickets: TicketLifecycle::new(store.clone(), "open"),
            store,
        }
    }

    /// Create an agent with a unique email.
    pub async fn agent(&self, name: &str) -> AgentRecord {
        self.store
            .create_agent(&NewAgent::new(name, unique_email(name)))
            .await
            .expect("Failed to create agent")
    }

    /// Create a reporting user with a unique email.
    pub async fn user(&self, name: &str) -> UserRecord {
        self.store
            .create_user(&NewUser::new(name, unique_email(name)))
            .await
            .expect("Failed to create user")
    }
}

/// Email that will not collide with rows left by other test runs.
pub fn unique_email(name: &str) -> String {
    format!("{}-{}@example.com", name.to_lowercase(), Uuid::new_v4())
}

/// Name that will not collide with rows left by other test runs.
pub fn unique_name(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

/// Helper macro to skip tests if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
