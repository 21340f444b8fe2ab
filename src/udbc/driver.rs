use crate::config::ConnectParams;
use crate::udbc::connection::Connection;
use crate::udbc::error::DriverError;
use async_trait::async_trait;

/// Opens backend sessions. A driver is stateless apart from its own
/// settings; pooling lives above it.
#[async_trait]
pub trait Driver: Send + Sync {
    fn r#type(&self) -> &str;

    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Connection>, DriverError>;

    fn create_database_sql(&self, database: &str) -> String {
        format!("CREATE DATABASE \"{}\"", database.replace('"', "\"\""))
    }

    fn drop_database_sql(&self, database: &str) -> String {
        format!("DROP DATABASE \"{}\"", database.replace('"', "\"\""))
    }
}
