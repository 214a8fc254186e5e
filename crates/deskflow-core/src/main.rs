// Copyright (C) 2025 The deskflow-core contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deskflow Core - Service Desk Data Access
//!
//! Prepares a database for the service desk:
//! - Applies migrations
//! - Checks the connection
//! - Seeds the default role catalog

use anyhow::{Result, bail};
use tracing::{error, info, warn};

use deskflow_core::bootstrap;
use deskflow_core::config::Config;
use deskflow_core::persistence;
use deskflow_core::AccessControl;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("deskflow_core=info")),
        )
        .init();

    info!("Starting Deskflow Core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        max_connections = config.max_connections,
        acquire_timeout_secs = config.acquire_timeout.as_secs(),
        default_ticket_status = %config.default_ticket_status,
        run_migrations = config.run_migrations,
        "Configuration loaded"
    );

    // Connect to database
    info!("Connecting to database...");
    let store = persistence::connect(&config).await?;
    info!("Database connection established");

    // Verify connection
    if !store.health_check_db().await? {
        bail!("database health check failed");
    }
    info!("Database health check passed");

    // Seed default roles
    let acl = AccessControl::new(store);
    let outcomes = bootstrap::seed_default_roles(&acl).await?;
    let skipped: usize = outcomes.iter().map(|(_, o)| o.errors.len()).sum();
    if skipped > 0 {
        warn!(skipped, "Some default permissions were not granted");
    }

    info!(roles = outcomes.len(), "Deskflow Core initialized successfully");
    Ok(())
}
