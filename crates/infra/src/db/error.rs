//! Database boundary errors.

/// Errors reported by the database boundary.
///
/// Constraint violations are a distinct kind so composite writes can surface
/// "already exists" separately from generic internal failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DbError {
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    #[error("record not found")]
    NotFound,

    #[error("database unavailable: {0}")]
    Unavailable(String),

    #[error("query failed: {0}")]
    Query(String),
}

impl DbError {
    pub fn unique(constraint: impl Into<String>) -> Self {
        Self::UniqueViolation {
            constraint: constraint.into(),
        }
    }

    /// Connectivity problems worth retrying; everything else will fail again.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Unavailable(_))
    }
}

/// Error from [`TransactionRunner::run_in_transaction`](super::TransactionRunner::run_in_transaction).
#[derive(Debug, thiserror::Error)]
pub enum TxError<E> {
    #[error("failed to begin transaction: {0}")]
    Begin(DbError),

    #[error("{0}")]
    Work(E),

    #[error("failed to commit transaction: {0}")]
    Commit(DbError),

    /// The unit of work failed and the rollback failed too; both are kept.
    #[error("{work} (rollback also failed: {rollback})")]
    Rollback { work: E, rollback: DbError },
}

impl<E> TxError<E> {
    /// The error returned by the unit of work, if it got that far.
    pub fn work_error(&self) -> Option<&E> {
        match self {
            TxError::Work(e) | TxError::Rollback { work: e, .. } => Some(e),
            TxError::Begin(_) | TxError::Commit(_) => None,
        }
    }

    pub fn map_work<F, E2>(self, f: F) -> TxError<E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            TxError::Begin(e) => TxError::Begin(e),
            TxError::Work(e) => TxError::Work(f(e)),
            TxError::Commit(e) => TxError::Commit(e),
            TxError::Rollback { work, rollback } => TxError::Rollback {
                work: f(work),
                rollback,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_error_keeps_both_diagnostics() {
        let err: TxError<DbError> = TxError::Rollback {
            work: DbError::Query("insert failed".into()),
            rollback: DbError::Unavailable("connection reset".into()),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("insert failed"));
        assert!(rendered.contains("connection reset"));
        assert_eq!(err.work_error(), Some(&DbError::Query("insert failed".into())));
    }

    #[test]
    fn only_unavailable_is_transient() {
        assert!(DbError::Unavailable("down".into()).is_transient());
        assert!(!DbError::NotFound.is_transient());
        assert!(!DbError::unique("users_phone_number_key").is_transient());
    }
}
