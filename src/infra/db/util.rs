use crate::application::repos::RepoError;

/// Translate driver errors into the repository taxonomy. SQLSTATE codes are preferred over
/// message matching where Postgres provides them.
pub fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::PoolTimedOut => RepoError::Timeout,
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") => RepoError::Duplicate {
                constraint: db.constraint().unwrap_or("unknown").to_string(),
            },
            Some("22P02") | Some("22P05") | Some("23503") => RepoError::InvalidInput {
                message: db.message().to_string(),
            },
            Some(code) if code.starts_with("23") => RepoError::Integrity {
                message: db.message().to_string(),
            },
            Some("57014") => RepoError::Timeout,
            _ => RepoError::from_persistence(db.message()),
        },
        other => RepoError::from_persistence(other),
    }
}
