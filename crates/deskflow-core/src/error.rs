// Copyright (C) 2025 The deskflow-core contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for deskflow-core.
//!
//! Every store and service operation returns [`DeskError`]. Nothing in this
//! crate retries; the error is handed back to the immediate caller, which
//! decides whether the operation is worth repeating.

use thiserror::Error;

/// Result type using DeskError
pub type Result<T> = std::result::Result<T, DeskError>;

/// Errors surfaced by the entity store and the service façades.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DeskError {
    /// Lookup by id or name found nothing.
    #[error("{entity} '{key}' not found")]
    NotFound {
        /// Kind of entity that was looked up (e.g. "role").
        entity: &'static str,
        /// The id or name that was not found.
        key: String,
    },

    /// A unique constraint was violated or a versioned write lost a race.
    #[error("{entity} conflict: {details}")]
    Conflict {
        /// Kind of entity the conflict concerns.
        entity: &'static str,
        /// Details from the storage engine or the version check.
        details: String,
    },

    /// The caller supplied missing or contradictory arguments.
    #[error("Invalid argument '{field}': {message}")]
    InvalidArgument {
        /// The offending argument.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// The storage engine failed.
    #[error("Storage error during '{operation}': {details}")]
    Storage {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl DeskError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::Storage { .. } => "STORAGE_ERROR",
        }
    }

    /// Shorthand for a [`DeskError::NotFound`].
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Shorthand for a [`DeskError::InvalidArgument`].
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field,
            message: message.into(),
        }
    }

    /// Attribute a storage-level conflict to a concrete entity.
    pub(crate) fn with_entity(self, entity: &'static str) -> Self {
        match self {
            Self::Conflict { details, .. } => Self::Conflict { entity, details },
            other => other,
        }
    }

    /// Returns true for [`DeskError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for [`DeskError::Conflict`].
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<sqlx::Error> for DeskError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            if db_err.is_unique_violation() {
                return DeskError::Conflict {
                    entity: "record",
                    details: db_err.message().to_string(),
                };
            }
            if db_err.is_foreign_key_violation() {
                return DeskError::InvalidArgument {
                    field: "reference",
                    message: db_err.message().to_string(),
                };
            }
        }

        DeskError::Storage {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DeskError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DeskError::Storage {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}
