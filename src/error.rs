use crate::udbc::error::DriverError;
use std::time::Duration;
use thiserror::Error;

/// Errors returned to callers of the client and transaction APIs.
///
/// Backend-specific failures never leak through as-is: they are classified by
/// [`crate::translate`] into one of the variants below, and only failures the
/// translator does not recognise surface as [`DbError::Driver`].
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Timed out after {0:?} waiting for a pooled connection")]
    PoolTimeout(Duration),
    #[error("Connection pool already created")]
    PoolAlreadyCreated,
    #[error("Operational error: {0}")]
    Operational(#[source] DriverError),
    #[error("Integrity error: {0}")]
    Integrity(#[source] DriverError),
    #[error("Transaction management error: {0}")]
    TransactionManagement(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Value error: {0}")]
    Value(String),
    #[error("Driver error: {0}")]
    Driver(#[source] DriverError),
}

/// The closed set of error categories callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Operational,
    Integrity,
    TransactionManagement,
    Other,
}

impl DbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::Connection(_) | DbError::PoolTimeout(_) => ErrorKind::Connection,
            DbError::Operational(_) => ErrorKind::Operational,
            DbError::Integrity(_) => ErrorKind::Integrity,
            DbError::TransactionManagement(_) => ErrorKind::TransactionManagement,
            DbError::PoolAlreadyCreated
            | DbError::Config(_)
            | DbError::Value(_)
            | DbError::Driver(_) => ErrorKind::Other,
        }
    }

    pub fn is_integrity(&self) -> bool {
        self.kind() == ErrorKind::Integrity
    }

    pub fn is_connection(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }

    pub(crate) fn invalid_state() -> Self {
        DbError::TransactionManagement("Transaction is in invalid state".into())
    }

    pub(crate) fn already_finalised() -> Self {
        DbError::TransactionManagement("Transaction already finalised".into())
    }
}

impl serde::de::Error for DbError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        DbError::Value(msg.to_string())
    }
}
