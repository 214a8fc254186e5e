// Copyright (C) 2025 The deskflow-core contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Deskflow configuration.
///
/// Built once at startup and passed by reference to whatever needs it.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Maximum pooled database connections
    pub max_connections: u32,
    /// How long to wait for a pooled connection before failing
    pub acquire_timeout: Duration,
    /// Status name given to new tickets that do not specify one
    pub default_ticket_status: String,
    /// Apply embedded migrations on connect
    pub run_migrations: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `DESKFLOW_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `DESKFLOW_MAX_CONNECTIONS`: Pool size (default: 10)
    /// - `DESKFLOW_ACQUIRE_TIMEOUT_SECS`: Pool acquire timeout (default: 30)
    /// - `DESKFLOW_DEFAULT_TICKET_STATUS`: Initial ticket status (default: open)
    /// - `DESKFLOW_RUN_MIGRATIONS`: Run migrations on connect (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DESKFLOW_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("DESKFLOW_DATABASE_URL"))?;

        let max_connections: u32 = std::env::var("DESKFLOW_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("DESKFLOW_MAX_CONNECTIONS", "must be a positive integer")
            })?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid(
                "DESKFLOW_MAX_CONNECTIONS",
                "must be a positive integer",
            ));
        }

        let acquire_timeout_secs: u64 = std::env::var("DESKFLOW_ACQUIRE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "DESKFLOW_ACQUIRE_TIMEOUT_SECS",
                    "must be a number of seconds",
                )
            })?;

        let default_ticket_status = std::env::var("DESKFLOW_DEFAULT_TICKET_STATUS")
            .unwrap_or_else(|_| "open".to_string());
        if default_ticket_status.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "DESKFLOW_DEFAULT_TICKET_STATUS",
                "must not be empty",
            ));
        }

        let run_migrations = std::env::var("DESKFLOW_RUN_MIGRATIONS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        Ok(Self {
            database_url,
            max_connections,
            acquire_timeout: Duration::from_secs(acquire_timeout_secs),
            default_ticket_status: default_ticket_status.trim().to_string(),
            run_migrations,
        })
    }

    /// Configuration for the given URL with every optional setting defaulted.
    pub fn with_database_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            default_ticket_status: "open".to_string(),
            run_migrations: true,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
