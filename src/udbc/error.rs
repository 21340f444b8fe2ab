use thiserror::Error;

/// SQLSTATE reported when the target catalog (database) does not exist.
pub const INVALID_CATALOG_NAME: &str = "3D000";

/// Errors surfaced by a backend driver before translation.
///
/// Backends normalise their vendor codes into a SQLSTATE so the translator
/// only has to reason about the standard classes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("[{sqlstate}] {message}")]
    Server {
        sqlstate: String,
        code: u32,
        message: String,
    },
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl DriverError {
    pub fn server(sqlstate: impl Into<String>, message: impl Into<String>) -> Self {
        DriverError::Server {
            sqlstate: sqlstate.into(),
            code: 0,
            message: message.into(),
        }
    }

    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            DriverError::Server { sqlstate, .. } => Some(sqlstate),
            _ => None,
        }
    }

    /// Two-character SQLSTATE class, e.g. `"23"` for integrity violations.
    pub fn class(&self) -> Option<&str> {
        self.sqlstate().and_then(|s| s.get(..2))
    }

    pub fn is_invalid_catalog(&self) -> bool {
        self.sqlstate() == Some(INVALID_CATALOG_NAME)
    }

    /// Whether the session this error came from can no longer be used.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, DriverError::Io(_)) || self.class() == Some("08")
    }
}
