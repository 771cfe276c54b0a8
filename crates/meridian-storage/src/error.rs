//! Error types for the store gateway.
//!
//! Every `StoreGateway` method funnels its failure modes into this single
//! taxonomy so callers never need to match on backend-specific errors.

/// Errors from store gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store (primary, and replica if configured) could not be reached
    /// within the call's deadline.
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },

    /// A uniqueness or foreign-key constraint was violated.
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    /// The requested row does not exist.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// The caller supplied a value that fails a check constraint or
    /// application-level invariant.
    #[error("invalid: {reason}")]
    Invalid { reason: String },
}

impl StoreError {
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    #[must_use]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }
}

#[cfg(feature = "postgres-backend")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound {
                what: "row".to_owned(),
            },
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => Self::Conflict {
                reason: db_err.to_string(),
            },
            sqlx::Error::Database(ref db_err) if db_err.is_check_violation() => Self::Invalid {
                reason: db_err.to_string(),
            },
            other => Self::Unavailable {
                reason: other.to_string(),
            },
        }
    }
}
