//! Fleet root: one Lead per configured database, plus shared stats.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{AppConfig, DatabaseConfig};
use crate::executor::ErrorKind;
use crate::migration::MigrationSource;
use crate::parser::{parse_connection_string, ConnectionConfig};
use crate::queue::{DatabaseQueue, QueueType};
use crate::registry::registry;
use crate::stats::{DqmStats, DqmStatsSnapshot};
use crate::util::retry;

/// Lead startup retries `establish_connection` this many times before
/// surfacing `ConnectFailed` to the caller, per the `ConnectFailed` recovery
/// rule: "Lead retries with backoff; worker surfaces".
const LEAD_CONNECT_MAX_TRIES: u32 = 5;

/// Holds the fleet: one Lead `DatabaseQueue` per configured database.
pub struct DatabaseQueueManager {
    leads: HashMap<String, Arc<DatabaseQueue>>,
    stats: Arc<DqmStats>,
}

impl DatabaseQueueManager {
    /// Creates an empty manager sized for `max_databases` (a hint only;
    /// `HashMap` grows past it without failing).
    pub fn create(max_databases: usize) -> Self {
        Self {
            leads: HashMap::with_capacity(max_databases),
            stats: Arc::new(DqmStats::new()),
        }
    }

    /// Builds a Lead queue for every entry in `config.databases.connections`
    /// and establishes its persistent connection. Does not run migrations or
    /// launch worker tiers on its own — callers drive that per database via
    /// [`Self::bootstrap_database`] once a `MigrationSource` is available.
    pub fn bootstrap(config: &AppConfig) -> Result<Self, (ErrorKind, String)> {
        let mut manager = Self::create(config.databases.connections.len());
        for entry in &config.databases.connections {
            manager.add_database(entry)?;
        }
        Ok(manager)
    }

    fn add_database(&mut self, entry: &DatabaseConfig) -> Result<(), (ErrorKind, String)> {
        let connection_config = resolve_connection_config(entry);
        let engine = registry()
            .lookup(connection_config.engine_tag)
            .ok_or_else(|| (ErrorKind::NoDriver, format!("no engine registered for `{:?}`", connection_config.engine_tag)))?;

        let lead = DatabaseQueue::new_lead(
            entry.name.clone(),
            Arc::new(connection_config),
            Arc::clone(&engine),
            Arc::clone(&self.stats),
            entry.test_migration,
        );

        let designator = format!("{}-lead", entry.name);
        retry(|| lead.establish_connection(&designator), LEAD_CONNECT_MAX_TRIES)?;
        self.leads.insert(entry.name.clone(), lead);
        Ok(())
    }

    /// Runs migration validation/execution for `database_name` and, on
    /// success, launches its configured worker tiers.
    pub fn bootstrap_database(
        &self,
        database_name: &str,
        source: &dyn MigrationSource,
        start_counts: [usize; 4],
    ) -> Result<(), (ErrorKind, String)> {
        let lead = self
            .leads
            .get(database_name)
            .ok_or_else(|| (ErrorKind::InvalidArgument, format!("unknown database `{database_name}`")))?;

        lead.validate_migrations(source)?;
        lead.execute_migration_process(source)?;
        lead.run_migration_test()?;
        lead.launch_additional_queues(start_counts);
        Ok(())
    }

    pub fn dispatch(&self, database_name: &str, tier: QueueType, request: crate::executor::QueryRequest) -> crate::executor::QueryResult {
        let Some(lead) = self.leads.get(database_name) else {
            return crate::executor::QueryResult::failure(ErrorKind::InvalidArgument, format!("unknown database `{database_name}`"));
        };
        lead.dispatch(tier, request)
    }

    pub fn record_timeout(&self) {
        self.stats.record_timeout();
    }

    pub fn record_query(&self) {
        self.stats.record_query();
    }

    pub fn snapshot(&self) -> DqmStatsSnapshot {
        self.stats.snapshot()
    }

    /// Shuts down every Lead (which cascades to its children) cleanly.
    pub fn destroy(&mut self) {
        for (name, lead) in self.leads.drain() {
            log::info!("shutting down database fleet for `{name}`");
            lead.shutdown();
        }
    }
}

impl Drop for DatabaseQueueManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn resolve_connection_config(entry: &DatabaseConfig) -> ConnectionConfig {
    let mut config = parse_connection_string(&entry.connection_string);
    config.prepared_statement_cache_size = entry.prepared_statement_cache_size;
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabasesConfig;
    use crate::registry::register_default_engines;

    fn single_sqlite_config() -> AppConfig {
        AppConfig {
            databases: DatabasesConfig {
                connections: vec![DatabaseConfig {
                    name: "primary".to_string(),
                    connection_string: ":memory:".to_string(),
                    prepared_statement_cache_size: 16,
                    test_migration: false,
                    queues_cache_start: 0,
                    queues_fast_start: 1,
                    queues_medium_start: 1,
                    queues_slow_start: 0,
                }],
            },
            log_level: "info".to_string(),
            shutdown_grace_period_ms: 5000,
        }
    }

    #[test]
    fn bootstrap_opens_a_lead_per_configured_database() {
        register_default_engines();
        let manager = DatabaseQueueManager::bootstrap(&single_sqlite_config()).expect("bootstrap");
        assert!(manager.leads.contains_key("primary"));
    }

    #[test]
    fn dispatch_against_unknown_database_surfaces_invalid_argument() {
        register_default_engines();
        let manager = DatabaseQueueManager::bootstrap(&single_sqlite_config()).expect("bootstrap");
        let result = manager.dispatch("nope", QueueType::Fast, crate::executor::QueryRequest::new("SELECT 1"));
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::InvalidArgument));
    }
}
