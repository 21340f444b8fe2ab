//! MySQL backend over `mysql_async`.
//!
//! MySQL has no driver-managed nested transactions, so nested transactions
//! use the SAVEPOINT statements emitted by the transaction layer.

pub mod connection;
pub mod driver;
pub mod value_codec;

/// Vendor codes that mean "the catalog does not exist": ER_BAD_DB_ERROR on
/// connect and ER_DB_DROP_EXISTS on DROP DATABASE.
const UNKNOWN_DATABASE_CODES: [u16; 2] = [1049, 1008];

pub(crate) fn driver_error(e: mysql_async::Error) -> crate::udbc::error::DriverError {
    use crate::udbc::error::{DriverError, INVALID_CATALOG_NAME};
    match e {
        mysql_async::Error::Server(server) => {
            let sqlstate = if UNKNOWN_DATABASE_CODES.contains(&server.code) {
                INVALID_CATALOG_NAME.to_string()
            } else {
                server.state
            };
            DriverError::Server {
                sqlstate,
                code: server.code as u32,
                message: server.message,
            }
        }
        mysql_async::Error::Io(io) => DriverError::Io(io.to_string()),
        other => DriverError::Protocol(other.to_string()),
    }
}
