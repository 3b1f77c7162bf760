use diesel::result::{ConnectionError, Error as PgError};
use r2d2::Error as PoolError;
use std::fmt;

#[derive(Debug)]
pub enum Error {
    Database(PgError),
    /// A stored value cannot be represented by the in-memory type, e.g. a malformed address.
    DatabaseCorrupted(String),
    PostgresConnection(ConnectionError),
    Pool(PoolError),
    Migration(String),
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl From<ConnectionError> for Error {
    fn from(e: ConnectionError) -> Self {
        Error::PostgresConnection(e)
    }
}

impl From<PgError> for Error {
    fn from(e: PgError) -> Self {
        Error::Database(e)
    }
}

impl From<PoolError> for Error {
    fn from(e: PoolError) -> Self {
        Error::Pool(e)
    }
}
