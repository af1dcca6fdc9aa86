//! Engine tags and the process-wide engine registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::executor::{ErrorKind, QueryRequest, QueryResult};
use crate::handle::DatabaseHandle;
use crate::parser::ConnectionConfig;
use crate::transaction::{IsolationLevel, Transaction};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Default)]
pub enum EngineTag {
    #[default]
    Sqlite,
    Mysql,
    Postgresql,
    Db2,
}

impl EngineTag {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineTag::Sqlite => "sqlite",
            EngineTag::Mysql => "mysql",
            EngineTag::Postgresql => "postgresql",
            EngineTag::Db2 => "db2",
        }
    }
}

/// The per-engine function table. Every method takes the `DatabaseHandle` it
/// operates on explicitly, so multiple handles for the same engine may call
/// concurrently from different worker threads without shared mutable state
/// in the `Engine` implementor itself.
pub trait Engine: Send + Sync {
    fn tag(&self) -> EngineTag;

    fn connect(&self, config: &ConnectionConfig, designator: &str) -> Result<DatabaseHandle, (ErrorKind, String)>;
    fn disconnect(&self, handle: &mut DatabaseHandle);
    fn health_check(&self, handle: &mut DatabaseHandle) -> bool;
    fn reset_connection(&self, handle: &mut DatabaseHandle) -> Result<(), (ErrorKind, String)>;

    /// Probes whether the connected database has no application tables at
    /// all — the "empty-database marker" `validate_migrations` consults to
    /// decide whether a failed watermark read is expected (fresh database)
    /// or an alert-worthy condition.
    fn database_is_empty(&self, handle: &mut DatabaseHandle) -> bool;

    fn execute_query(&self, handle: &mut DatabaseHandle, request: &QueryRequest) -> QueryResult;
    fn execute_prepared(&self, handle: &mut DatabaseHandle, request: &QueryRequest) -> QueryResult;

    fn begin_transaction(
        &self,
        handle: &mut DatabaseHandle,
        isolation_level: IsolationLevel,
    ) -> Result<Transaction, (ErrorKind, String)>;
    fn commit_transaction(&self, handle: &mut DatabaseHandle, txn: &mut Transaction) -> Result<(), (ErrorKind, String)>;
    fn rollback_transaction(
        &self,
        handle: &mut DatabaseHandle,
        txn: &mut Transaction,
    ) -> Result<(), (ErrorKind, String)>;

    fn prepare_statement(
        &self,
        handle: &mut DatabaseHandle,
        name: &str,
        sql_template: &str,
    ) -> Result<(), (ErrorKind, String)>;
    fn unprepare_statement(&self, handle: &mut DatabaseHandle, name: &str);

    /// Renders a `ConnectionConfig` back into the engine's native connection
    /// string form (the inverse of `parser::parse_connection_string` for
    /// structured configs; DB2 configs already carry their original string
    /// verbatim and this simply returns it).
    fn get_connection_string(&self, config: &ConnectionConfig) -> String;
    fn validate_connection_string(&self, s: &str) -> bool;
    fn escape_string(&self, s: &str) -> String;
}

#[derive(Default)]
pub struct EngineRegistry {
    engines: Mutex<HashMap<EngineTag, Arc<dyn Engine>>>,
}

impl EngineRegistry {
    pub fn register(&self, engine: Arc<dyn Engine>) {
        let tag = engine.tag();
        self.engines.lock().expect("engine registry mutex poisoned").insert(tag, engine);
    }

    pub fn lookup(&self, tag: EngineTag) -> Option<Arc<dyn Engine>> {
        self.engines.lock().expect("engine registry mutex poisoned").get(&tag).cloned()
    }
}

static REGISTRY: OnceLock<EngineRegistry> = OnceLock::new();

/// The process-wide engine registry, initialized lazily on first access.
pub fn registry() -> &'static EngineRegistry {
    REGISTRY.get_or_init(EngineRegistry::default)
}

/// Registers every engine whose crate feature is enabled. Safe to call more
/// than once; later registrations simply replace earlier ones for the same
/// tag.
pub fn register_default_engines() {
    #[cfg(feature = "sqlite")]
    registry().register(Arc::new(crate::engines::sqlite::SqliteEngine));
    #[cfg(feature = "mysql")]
    registry().register(Arc::new(crate::engines::mysql::MysqlEngine));
    #[cfg(feature = "postgresql")]
    registry().register(Arc::new(crate::engines::postgres::PostgresqlEngine));
    #[cfg(feature = "db2")]
    registry().register(Arc::new(crate::engines::db2::Db2Engine));
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopEngine(EngineTag);
    impl Engine for NoopEngine {
        fn tag(&self) -> EngineTag {
            self.0
        }
        fn connect(&self, _: &ConnectionConfig, designator: &str) -> Result<DatabaseHandle, (ErrorKind, String)> {
            Ok(DatabaseHandle::new(self.0, designator, Arc::new(ConnectionConfig::default())))
        }
        fn disconnect(&self, _: &mut DatabaseHandle) {}
        fn health_check(&self, _: &mut DatabaseHandle) -> bool {
            true
        }
        fn reset_connection(&self, _: &mut DatabaseHandle) -> Result<(), (ErrorKind, String)> {
            Ok(())
        }
        fn database_is_empty(&self, _: &mut DatabaseHandle) -> bool {
            false
        }
        fn execute_query(&self, _: &mut DatabaseHandle, _: &QueryRequest) -> QueryResult {
            QueryResult::empty_success()
        }
        fn execute_prepared(&self, _: &mut DatabaseHandle, _: &QueryRequest) -> QueryResult {
            QueryResult::empty_success()
        }
        fn begin_transaction(
            &self,
            handle: &mut DatabaseHandle,
            isolation_level: IsolationLevel,
        ) -> Result<Transaction, (ErrorKind, String)> {
            handle.begin_transaction_guard()?;
            Ok(Transaction::new(self.0, isolation_level))
        }
        fn commit_transaction(&self, handle: &mut DatabaseHandle, txn: &mut Transaction) -> Result<(), (ErrorKind, String)> {
            txn.finish();
            handle.end_transaction();
            Ok(())
        }
        fn rollback_transaction(
            &self,
            handle: &mut DatabaseHandle,
            txn: &mut Transaction,
        ) -> Result<(), (ErrorKind, String)> {
            txn.finish();
            handle.end_transaction();
            Ok(())
        }
        fn prepare_statement(&self, _: &mut DatabaseHandle, _: &str, _: &str) -> Result<(), (ErrorKind, String)> {
            Ok(())
        }
        fn unprepare_statement(&self, _: &mut DatabaseHandle, _: &str) {}
        fn get_connection_string(&self, config: &ConnectionConfig) -> String {
            config.connection_string.clone().unwrap_or_default()
        }
        fn validate_connection_string(&self, _: &str) -> bool {
            true
        }
        fn escape_string(&self, s: &str) -> String {
            s.replace('\'', "''")
        }
    }

    #[test]
    fn lookup_of_unregistered_tag_returns_none() {
        let reg = EngineRegistry::default();
        assert!(reg.lookup(EngineTag::Db2).is_none());
    }

    #[test]
    fn register_then_lookup_roundtrips() {
        let reg = EngineRegistry::default();
        reg.register(Arc::new(NoopEngine(EngineTag::Sqlite)));
        assert!(reg.lookup(EngineTag::Sqlite).is_some());
    }
}
