//! Translation of mapper errors into the persistence taxonomy.

use sea_orm::{DbErr, RuntimeErr, SqlErr};
use sqlx::error::{DatabaseError, ErrorKind};
use unitwork_shared::PersistError;

/// SQLSTATE raised when a serializable transaction loses a conflict.
const SERIALIZATION_FAILURE: &str = "40001";

/// Classifies a mapper error.
///
/// Optimistic-concurrency conflicts become `StaleState`, integrity
/// violations become `ConstraintViolation`, and everything else is a generic
/// `Database` error.
#[must_use]
pub fn classify(err: &DbErr) -> PersistError {
    let message = err.to_string();

    if is_stale_state(err) {
        PersistError::StaleState(message)
    } else if is_constraint_violation(err) {
        PersistError::ConstraintViolation(message)
    } else {
        PersistError::Database(message)
    }
}

fn is_stale_state(err: &DbErr) -> bool {
    if matches!(err, DbErr::RecordNotUpdated) {
        return true;
    }

    database_error(err)
        .and_then(|db| db.code())
        .is_some_and(|code| code == SERIALIZATION_FAILURE)
}

fn is_constraint_violation(err: &DbErr) -> bool {
    if matches!(
        err.sql_err(),
        Some(SqlErr::UniqueConstraintViolation(_) | SqlErr::ForeignKeyConstraintViolation(_))
    ) {
        return true;
    }

    database_error(err).is_some_and(|db| {
        matches!(
            db.kind(),
            ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation
        )
    })
}

fn database_error(err: &DbErr) -> Option<&dyn DatabaseError> {
    match err {
        DbErr::Conn(RuntimeErr::SqlxError(e))
        | DbErr::Exec(RuntimeErr::SqlxError(e))
        | DbErr::Query(RuntimeErr::SqlxError(e)) => e.as_database_error(),
        _ => None,
    }
}
