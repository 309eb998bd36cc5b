//! Store error taxonomy and SQLSTATE classification.
//!
//! sqlx errors are folded into [`StoreError`] and classified for the
//! worker's event loop as follows:
//!
//! | Source | SQLSTATE | Class | Loop action |
//! |--------|----------|-------|-------------|
//! | `sqlx::Error::Database` | `08001`, `08003`, `08004`, `08006` | `ConnectionLost` | log, back off one poll interval |
//! | `sqlx::Error::Io` | n/a | `ConnectionLost` | log, back off one poll interval |
//! | `sqlx::Error::Database` | `40001` | `Serialization` | debug log, back off one poll interval |
//! | `sqlx::Error::PoolClosed` | n/a | `PoolClosed` | close the shutdown signal, exit |
//! | anything else | any | `Other` | log with a correlation id, back off |

use thiserror::Error;

/// SQLSTATE codes reported when the server connection is gone.
const CONNECTION_SQLSTATES: [&str; 4] = ["08001", "08003", "08004", "08006"];

/// SQLSTATE reported for a serialization failure under concurrent
/// transactions.
const SERIALIZATION_SQLSTATE: &str = "40001";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The request was malformed before it reached the database.
    #[error("validation error: {0}")]
    Validation(String),

    /// The connection pool has been closed.
    #[error("connection pool is closed")]
    PoolClosed,

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed => StoreError::PoolClosed,
            other => StoreError::Database(other),
        }
    }
}

/// Recovery class consumed by the worker's event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The database connection was lost; worth retrying after a backoff.
    ConnectionLost,
    /// Two transactions collided; the loser simply polls again.
    Serialization,
    /// The pool is gone for good; the worker should shut down.
    PoolClosed,
    /// Everything else.
    Other,
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::PoolClosed => ErrorClass::PoolClosed,
            StoreError::Database(sqlx::Error::Io(_)) => ErrorClass::ConnectionLost,
            StoreError::Database(sqlx::Error::Database(db)) => match db.code().as_deref() {
                Some(code) if CONNECTION_SQLSTATES.contains(&code) => ErrorClass::ConnectionLost,
                Some(SERIALIZATION_SQLSTATE) => ErrorClass::Serialization,
                _ => ErrorClass::Other,
            },
            _ => ErrorClass::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_closed_maps_to_its_own_class() {
        let err: StoreError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, StoreError::PoolClosed));
        assert_eq!(err.class(), ErrorClass::PoolClosed);
    }

    #[test]
    fn io_errors_are_connection_lost() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: StoreError = sqlx::Error::Io(io).into();
        assert_eq!(err.class(), ErrorClass::ConnectionLost);
    }

    #[test]
    fn row_not_found_is_unclassified() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.class(), ErrorClass::Other);
    }

    #[test]
    fn validation_is_unclassified() {
        let err = StoreError::Validation("task name is required".to_string());
        assert_eq!(err.class(), ErrorClass::Other);
    }
}
