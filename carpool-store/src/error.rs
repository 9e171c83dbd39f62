use carpool_core::CoreError;

/// Classify a database failure into the domain taxonomy.
///
/// Serialization failures, deadlocks, lock timeouts and pool exhaustion are transient
/// contention. Constraint violations mean a guard was bypassed.
pub fn map_db_error(err: sqlx::Error) -> CoreError {
    match &err {
        sqlx::Error::PoolTimedOut => CoreError::Contention(err.to_string()),
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().unwrap_or_default();
            match code.as_ref() {
                // serialization_failure, deadlock_detected, lock_not_available
                "40001" | "40P01" | "55P03" => CoreError::Contention(db_err.message().to_string()),
                // unique_violation, check_violation
                "23505" | "23514" => CoreError::Integrity(db_err.message().to_string()),
                _ => CoreError::Internal(err.to_string()),
            }
        }
        _ => CoreError::Internal(err.to_string()),
    }
}

pub(crate) trait DbResultExt<T> {
    fn db(self) -> Result<T, CoreError>;
}

impl<T> DbResultExt<T> for Result<T, sqlx::Error> {
    fn db(self) -> Result<T, CoreError> {
        self.map_err(map_db_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_is_contention() {
        assert!(map_db_error(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(matches!(map_db_error(sqlx::Error::RowNotFound), CoreError::Internal(_)));
    }
}
