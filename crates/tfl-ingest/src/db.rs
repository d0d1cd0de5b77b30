use std::fmt;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use crate::error::{IngestError, Result};

/// Default maximum connections in the pool. The loader holds one connection
/// for the whole run; the second serves schema checks and counts.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 2;

/// Default connection timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Connection settings for the destination database
#[derive(Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user)
            .password(&self.password)
    }
}

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect_with(config.connect_options())
        .await
        .map_err(IngestError::Connect)?;

    tracing::info!(
        host = %config.host,
        port = config.port,
        database = %config.name,
        max_connections = config.max_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

pub async fn health_check(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(IngestError::Connect)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DatabaseConfig {
        DatabaseConfig {
            host: "db.internal".to_string(),
            port: 5433,
            name: "tfl".to_string(),
            user: "loader".to_string(),
            password: "hunter2".to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", sample());
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[REDACTED]"));
        assert!(rendered.contains("db.internal"));
    }

    #[test]
    fn test_connect_options() {
        let options = sample().connect_options();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_database(), Some("tfl"));
        assert_eq!(options.get_username(), "loader");
    }
}
