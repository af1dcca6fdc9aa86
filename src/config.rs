use std::env;

use crate::error::Error;
use crate::util::{get_env, get_env_bool};

/// Configuration for a single logical database, as declared by one `DATABASE_*` (or
/// `DATABASE_<N>_*`) family of environment variables.
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub name: String,
    pub connection_string: String,
    pub prepared_statement_cache_size: usize,
    pub test_migration: bool,
    pub queues_cache_start: usize,
    pub queues_fast_start: usize,
    pub queues_medium_start: usize,
    pub queues_slow_start: usize,
}

#[derive(Clone, Debug)]
pub struct DatabasesConfig {
    pub connections: Vec<DatabaseConfig>,
}

/// Immutable, fully-resolved application configuration, loaded once at startup.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub databases: DatabasesConfig,
    pub log_level: String,
    pub shutdown_grace_period_ms: u64,
}

fn env_usize(name: &str, default: usize) -> Result<usize, Error> {
    match get_env::<String>(name) {
        Some(v) => v.trim().parse::<usize>().map_err(|_| Error::new(format!("`{name}` must be an integer"), name)),
        None => Ok(default),
    }
}

fn database_config_from_prefix(prefix: &str, default_name: &str) -> Result<Option<DatabaseConfig>, Error> {
    let connection_string = match get_env::<String>(&format!("{prefix}_CONNECTION_STRING")) {
        Some(v) => v,
        None => return Ok(None),
    };

    let name = get_env(&format!("{prefix}_NAME")).unwrap_or_else(|| default_name.to_string());
    let prepared_statement_cache_size = env_usize(&format!("{prefix}_PREPARED_STATEMENT_CACHE_SIZE"), 16)?;
    let test_migration = get_env_bool(&format!("{prefix}_TEST_MIGRATION")).unwrap_or(false);
    let queues_cache_start = env_usize(&format!("{prefix}_QUEUES_CACHE_START"), 0)?;
    let queues_fast_start = env_usize(&format!("{prefix}_QUEUES_FAST_START"), 1)?;
    let queues_medium_start = env_usize(&format!("{prefix}_QUEUES_MEDIUM_START"), 1)?;
    let queues_slow_start = env_usize(&format!("{prefix}_QUEUES_SLOW_START"), 0)?;

    Ok(Some(DatabaseConfig {
        name,
        connection_string,
        prepared_statement_cache_size,
        test_migration,
        queues_cache_start,
        queues_fast_start,
        queues_medium_start,
        queues_slow_start,
    }))
}

impl DatabasesConfig {
    fn from_env() -> Result<Self, Error> {
        let mut connections = Vec::new();

        if let Some(conn) = database_config_from_prefix("DATABASE", "default")? {
            connections.push(conn);
        }

        let mut idx: u32 = 1;
        loop {
            let prefix = format!("DATABASE_{idx}");
            match database_config_from_prefix(&prefix, &format!("db{idx}"))? {
                Some(conn) => connections.push(conn),
                None => break,
            }
            idx += 1;
        }

        if connections.is_empty() {
            err!("No database configured. Set `DATABASE_CONNECTION_STRING` or `DATABASE_1_CONNECTION_STRING`.");
        }

        Ok(Self { connections })
    }
}

impl AppConfig {
    /// Loads configuration from an optional `.env`-style file (path controlled by `ENV_FILE`,
    /// defaulting to `.env`) merged with the process environment, then validates it.
    pub fn load() -> Result<Self, Error> {
        let env_file = get_env("ENV_FILE").unwrap_or_else(|| String::from(".env"));
        match dotenvy::from_path(&env_file) {
            Ok(()) => {
                println!("[INFO] Using environment file `{env_file}` for configuration.");
            }
            Err(dotenvy::Error::Io(ref ioerr)) if ioerr.kind() == std::io::ErrorKind::NotFound => {
                if env::var("ENV_FILE").is_ok() {
                    return Err(Error::from(dotenvy::Error::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("configured ENV_FILE `{env_file}` was not found"),
                    ))));
                }
            }
            Err(e) => return Err(e.into()),
        }

        let databases = DatabasesConfig::from_env()?;
        let log_level = get_env("LOG_LEVEL").unwrap_or_else(|| String::from("info"));
        let shutdown_grace_period_ms = env_usize("SHUTDOWN_GRACE_PERIOD_MS", 5_000)? as u64;

        let config = Self { databases, log_level, shutdown_grace_period_ms };
        validate_config(&config)?;
        Ok(config)
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), Error> {
    let mut seen = std::collections::HashSet::new();
    for db in &cfg.databases.connections {
        if !seen.insert(db.name.clone()) {
            err!(format!("Duplicate database name `{}` in configuration", db.name));
        }
        if db.prepared_statement_cache_size == 0 {
            err!(format!("`{}`: PREPARED_STATEMENT_CACHE_SIZE must be at least 1", db.name));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_config_requires_connection_string() {
        assert!(database_config_from_prefix("DBFLEET_TEST_MISSING", "x").unwrap().is_none());
    }
}
