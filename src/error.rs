use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScanError>;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("DNS resolution error: {0}")]
    DnsResolution(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Database connection error: {0}")]
    Database(String),

    #[error("Timeout occurred during {operation}")]
    Timeout { operation: String },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    #[error("Invalid target format: {0}")]
    InvalidTarget(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dictionary {path} unavailable: {reason}")]
    Dictionary { path: String, reason: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Web scanning error: {0}")]
    WebScan(String),

    #[error("Brute force error: {0}")]
    BruteForce(String),

    #[error("Discovery error: {0}")]
    Discovery(String),
}

impl ScanError {
    /// Errors that abort the stage that raised them instead of being
    /// recorded as a failed probe.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            ScanError::InvalidTarget(_) | ScanError::InvalidInput(_) | ScanError::Dictionary { .. }
        )
    }
}

impl From<rusqlite::Error> for ScanError {
    fn from(err: rusqlite::Error) -> Self {
        ScanError::Persistence(format!("SQLite error: {}", err))
    }
}

impl From<ssh2::Error> for ScanError {
    fn from(err: ssh2::Error) -> Self {
        ScanError::Ssh(err.to_string())
    }
}

impl From<mysql_async::Error> for ScanError {
    fn from(err: mysql_async::Error) -> Self {
        ScanError::Database(format!("MySQL error: {}", err))
    }
}

impl From<tokio_postgres::Error> for ScanError {
    fn from(err: tokio_postgres::Error) -> Self {
        ScanError::Database(format!("PostgreSQL error: {}", err))
    }
}

impl From<redis::RedisError> for ScanError {
    fn from(err: redis::RedisError) -> Self {
        ScanError::Database(format!("Redis error: {}", err))
    }
}

impl From<tiberius::error::Error> for ScanError {
    fn from(err: tiberius::error::Error) -> Self {
        ScanError::Database(format!("SQL Server error: {}", err))
    }
}

impl From<mongodb::error::Error> for ScanError {
    fn from(err: mongodb::error::Error) -> Self {
        ScanError::Database(format!("MongoDB error: {}", err))
    }
}

impl From<ldap3::LdapError> for ScanError {
    fn from(err: ldap3::LdapError) -> Self {
        ScanError::BruteForce(format!("LDAP error: {}", err))
    }
}
