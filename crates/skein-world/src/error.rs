// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the workflow world.
//!
//! One unified error enum with stable error codes. Callers that front the
//! world over HTTP map errors through [`WorldError::http_status`].

use thiserror::Error;

/// Result type using WorldError.
pub type Result<T> = std::result::Result<T, WorldError>;

/// Errors surfaced by the storage, queue and streaming layers.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum WorldError {
    /// The requested entity does not exist.
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Entity kind, e.g. "run" or "paused run".
        entity: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// An entity with the same primary key already exists.
    #[error("{entity} '{id}' already exists")]
    Conflict {
        /// Entity kind, e.g. "run" or "hook".
        entity: &'static str,
        /// The conflicting identifier.
        id: String,
    },

    /// A queue name did not match the known grammar.
    #[error("invalid queue name '{name}': expected a __wkf_workflow_ or __wkf_step_ prefix")]
    InvalidQueueName {
        /// The rejected queue name.
        name: String,
    },

    /// A configuration value is missing or malformed.
    #[error("invalid configuration for {field}: {message}")]
    Configuration {
        /// The configuration field.
        field: &'static str,
        /// What was wrong with it.
        message: String,
    },

    /// JSON encoding or decoding failed.
    #[error("serialization failed during '{operation}': {details}")]
    Serialization {
        /// The operation that was serializing.
        operation: &'static str,
        /// Error details from the codec.
        details: String,
    },

    /// A driver, network or IO error; passed through unchanged.
    #[error("database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details from the driver.
        details: String,
    },
}

impl WorldError {
    /// Shorthand for a [`WorldError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Shorthand for a [`WorldError::Conflict`].
    pub fn conflict(entity: &'static str, id: impl Into<String>) -> Self {
        Self::Conflict {
            entity,
            id: id.into(),
        }
    }

    /// Shorthand for a [`WorldError::Database`] with a named operation.
    pub fn database(operation: impl Into<String>, details: impl ToString) -> Self {
        Self::Database {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// Stable error code string for this error kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::InvalidQueueName { .. } => "INVALID_QUEUE_NAME",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
        }
    }

    /// HTTP status this error maps to at the service boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } => 409,
            Self::InvalidQueueName { .. } | Self::Configuration { .. } => 400,
            Self::Serialization { .. } | Self::Database { .. } => 500,
        }
    }

    /// Whether this error is a [`WorldError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this error is a [`WorldError::Conflict`].
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<sqlx::Error> for WorldError {
    fn from(err: sqlx::Error) -> Self {
        WorldError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for WorldError {
    fn from(err: serde_json::Error) -> Self {
        WorldError::Serialization {
            operation: "json",
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            WorldError::not_found("run", "wrun_x").error_code(),
            "NOT_FOUND"
        );
        assert_eq!(
            WorldError::conflict("hook", "whook_x").error_code(),
            "CONFLICT"
        );
        assert_eq!(
            WorldError::InvalidQueueName {
                name: "bad".to_string()
            }
            .error_code(),
            "INVALID_QUEUE_NAME"
        );
        assert_eq!(
            WorldError::database("query", "connection refused").error_code(),
            "DATABASE_ERROR"
        );
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(WorldError::not_found("run", "wrun_x").http_status(), 404);
        assert_eq!(WorldError::conflict("run", "wrun_x").http_status(), 409);
        assert_eq!(
            WorldError::InvalidQueueName {
                name: "bad".to_string()
            }
            .http_status(),
            400
        );
        assert_eq!(WorldError::database("query", "boom").http_status(), 500);
    }

    #[test]
    fn test_display() {
        let err = WorldError::not_found("paused run", "wrun_abc");
        assert_eq!(err.to_string(), "paused run 'wrun_abc' not found");

        let err = WorldError::conflict("run", "wrun_abc");
        assert_eq!(err.to_string(), "run 'wrun_abc' already exists");
    }

    #[test]
    fn test_predicates() {
        assert!(WorldError::not_found("run", "x").is_not_found());
        assert!(!WorldError::not_found("run", "x").is_conflict());
        assert!(WorldError::conflict("run", "x").is_conflict());
    }
}
