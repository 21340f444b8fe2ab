//! Maps driver failures onto the stable [`DbError`] taxonomy.
//!
//! Classification is by SQLSTATE class, which every backend reports (MySQL
//! included, after the backend normalises the few vendor codes that matter).

use crate::error::DbError;
use crate::pool::PoolError;
use crate::udbc::error::DriverError;

pub fn translate(err: DriverError) -> DbError {
    match &err {
        DriverError::Io(msg) => DbError::Connection(msg.clone()),
        DriverError::Server { sqlstate, .. } => match sqlstate.get(..2) {
            // syntax error or access rule violation, undefined table/column
            Some("42") => DbError::Operational(err),
            // data exception
            Some("22") => DbError::Operational(err),
            Some("23") => DbError::Integrity(err),
            // invalid transaction state, in failed sql transaction
            Some("25") => DbError::TransactionManagement(err.to_string()),
            // connection exception, invalid authorization, invalid catalog
            Some("08") | Some("28") | Some("3D") => DbError::Connection(err.to_string()),
            _ => DbError::Driver(err),
        },
        DriverError::Protocol(_) | DriverError::Unsupported(_) => DbError::Driver(err),
    }
}

pub(crate) fn translate_pool(err: PoolError) -> DbError {
    match err {
        PoolError::Timeout(after) => DbError::PoolTimeout(after),
        PoolError::Closed => DbError::Connection("connection pool is closed".into()),
        PoolError::Connect(e) => translate(e),
    }
}

/// Applies [`translate`] at a driver call site.
pub(crate) trait Translate<T> {
    fn translated(self) -> Result<T, DbError>;
}

impl<T> Translate<T> for Result<T, DriverError> {
    fn translated(self) -> Result<T, DbError> {
        self.map_err(translate)
    }
}

impl<T> Translate<T> for Result<T, PoolError> {
    fn translated(self) -> Result<T, DbError> {
        self.map_err(translate_pool)
    }
}
