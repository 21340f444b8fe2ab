pub mod client;
pub mod config;
pub mod error;
pub mod pool;
pub mod registry;
pub mod transaction;
pub mod translate;
pub mod udbc;
#[cfg(feature = "mysql")]
pub mod udbc_mysql;
pub mod wrapper;

pub use client::{Client, Executor};
pub use config::{ConnectionConfig, PoolOptions, SslMode};
pub use error::{DbError, ErrorKind};
pub use registry::{DB, connections};
pub use transaction::{Transaction, TransactionState, run_in_transaction};
pub use udbc::row::Row;
pub use udbc::value::{Value, to_values};
