use crate::config::{ConnectParams, SslMode};
use crate::udbc::connection::Connection;
use crate::udbc::driver::Driver;
use crate::udbc::error::DriverError;
use crate::udbc_mysql::connection::MysqlConnection;
use crate::udbc_mysql::driver_error;
use async_trait::async_trait;
use mysql_async::{Conn, Opts, OptsBuilder, SslOpts};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::debug;

const MYSQL_TYPE: &str = "mysql";
const DEFAULT_PORT: u16 = 3306;
/// Extra keys applied as session statements rather than driver options.
const SESSION_KEYS: [&str; 3] = ["charset", "time_zone", "sql_mode"];

/// Opens single `mysql_async` sessions; pooling is done by [`crate::pool::Pool`].
#[derive(Debug, Clone, Default)]
pub struct MysqlDriver {
    /// Default port when the configuration names none.
    port: Option<u16>,
}

impl MysqlDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    fn opts(&self, params: &ConnectParams) -> Result<OptsBuilder, DriverError> {
        let base = match driver_options(params)? {
            Some(opts) => OptsBuilder::from_opts(opts),
            None => OptsBuilder::default(),
        };
        let mut builder = base
            .ip_or_hostname(params.host.clone())
            .tcp_port(params.port.or(self.port).unwrap_or(DEFAULT_PORT))
            .user(params.user.clone())
            .pass(params.password.clone())
            .db_name(params.database.clone());

        match params.ssl_mode {
            SslMode::Disable => {}
            // 只加密，不校验证书
            SslMode::Require => {
                builder = builder.ssl_opts(
                    SslOpts::default()
                        .with_danger_accept_invalid_certs(true)
                        .with_danger_skip_domain_validation(true),
                );
            }
            SslMode::VerifyFull => builder = builder.ssl_opts(SslOpts::default()),
        }
        if params.root_cert.is_some() {
            debug!("mysql backend verifies against the system roots; root_cert ignored");
        }

        let init = init_statements(params)?;
        if !init.is_empty() {
            builder = builder.init(init);
        }
        Ok(builder)
    }
}

/// Session statements derived from backend-specific extra keys.
fn init_statements(params: &ConnectParams) -> Result<Vec<String>, DriverError> {
    let mut init = Vec::new();
    for (key, value) in &params.extra {
        match key.as_str() {
            "charset" => {
                // SET NAMES takes an identifier, not a string literal
                if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(DriverError::Unsupported(format!("invalid charset {:?}", value)));
                }
                init.push(format!("SET NAMES {}", value));
            }
            "time_zone" => init.push(format!("SET time_zone = '{}'", value.replace('\'', "''"))),
            "sql_mode" => init.push(format!("SET sql_mode = '{}'", value.replace('\'', "''"))),
            _ => {}
        }
    }
    Ok(init)
}

/// The remaining extra keys, parsed as `mysql_async` URL options
/// (`tcp_nodelay`, `stmt_cache_size`, `compression`, ...). Unknown keys fail.
fn driver_options(params: &ConnectParams) -> Result<Option<Opts>, DriverError> {
    let query: Vec<String> = params
        .extra
        .iter()
        .filter(|(key, _)| !SESSION_KEYS.contains(&key.as_str()))
        .map(|(key, value)| {
            format!(
                "{}={}",
                utf8_percent_encode(key, NON_ALPHANUMERIC),
                utf8_percent_encode(value, NON_ALPHANUMERIC)
            )
        })
        .collect();
    if query.is_empty() {
        return Ok(None);
    }
    debug!(options = ?query, "Passing extra options to mysql_async");
    Opts::from_url(&format!("mysql://localhost/?{}", query.join("&")))
        .map(Some)
        .map_err(|e| DriverError::Unsupported(format!("mysql option: {}", e)))
}

#[async_trait]
impl Driver for MysqlDriver {
    fn r#type(&self) -> &str {
        MYSQL_TYPE
    }

    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Connection>, DriverError> {
        let conn = Conn::new(self.opts(params)?).await.map_err(driver_error)?;
        Ok(Box::new(MysqlConnection::new(conn)))
    }

    fn create_database_sql(&self, database: &str) -> String {
        format!("CREATE DATABASE `{}`", database.replace('`', "``"))
    }

    fn drop_database_sql(&self, database: &str) -> String {
        format!("DROP DATABASE `{}`", database.replace('`', "``"))
    }
}
