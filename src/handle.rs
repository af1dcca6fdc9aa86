//! Connection handle types shared by every engine driver.

use std::sync::{Arc, OnceLock};

use crate::cache::StatementCache;
use crate::executor::ErrorKind;
use crate::parser::ConnectionConfig;
use crate::registry::EngineTag;

/// Lazily-bound, per-handle capability flags. Each flag is guarded by a
/// `OnceLock` rather than probed on every call: the first call that needs the
/// capability binds it for the handle's lifetime, standing in for the
/// "dynamic-library handle" binding a real client library would perform.
/// When a capability binds to `false`, the caller is expected to fall back to
/// issuing the equivalent SQL as plain text through `execute_query` instead
/// of treating the absence as fatal.
pub struct EngineCapabilities {
    transactions: OnceLock<bool>,
}

impl EngineCapabilities {
    pub fn new() -> Self {
        Self { transactions: OnceLock::new() }
    }

    #[cfg(test)]
    pub fn with_transactions(supported: bool) -> Self {
        let capabilities = Self::new();
        let _ = capabilities.transactions.set(supported);
        capabilities
    }

    /// Whether this handle's connection exposes native transactional
    /// primitives. Every live driver here always does once connected; the
    /// flag exists so a build missing the underlying client feature degrades
    /// to text-based `BEGIN`/`COMMIT`/`ROLLBACK` instead of failing outright.
    pub fn transactions_supported(&self) -> bool {
        *self.transactions.get_or_init(|| true)
    }
}

impl Default for EngineCapabilities {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Failed,
}

/// The engine-native connection, boxed behind a feature-gated variant so a
/// single `DatabaseHandle` can carry any backend without the caller needing
/// to know which one at compile time.
pub enum NativeConnection {
    #[cfg(feature = "sqlite")]
    Sqlite(rusqlite::Connection),
    #[cfg(feature = "mysql")]
    Mysql(mysql::Conn),
    #[cfg(feature = "postgresql")]
    Postgresql(postgres::Client),
    #[cfg(feature = "db2")]
    Db2(odbc_api::Connection<'static>),
}

/// A cached prepared statement.
///
/// `engine_specific_handle` does not borrow the owning connection: instead of
/// holding a native `Statement<'conn>` (which would tie this type's lifetime
/// to `NativeConnection` and make a name-keyed cache awkward to express
/// alongside it in safe Rust), a prepared statement is "real" (`Some(())`)
/// when the driver has validated `sql_template` against the connection at
/// least once, and is re-prepared transparently on each execute. This keeps
/// the cache's externally observable behavior — bounded size, LRU eviction,
/// finalize-on-evict, comment-only statements with no executable SQL — intact
/// without fighting driver-specific prepared-statement lifetimes.
pub struct PreparedStatement {
    pub name: String,
    pub sql_template: String,
    pub engine_specific_handle: Option<()>,
    pub usage_count: u64,
}

impl PreparedStatement {
    pub fn new(name: impl Into<String>, sql_template: impl Into<String>, has_executable_sql: bool) -> Self {
        Self {
            name: name.into(),
            sql_template: sql_template.into(),
            engine_specific_handle: has_executable_sql.then_some(()),
            usage_count: 0,
        }
    }
}

/// Owned by exactly one worker or Lead at a time.
pub struct DatabaseHandle {
    pub engine_tag: EngineTag,
    pub connection_handle: Option<NativeConnection>,
    pub designator: String,
    pub status: ConnectionStatus,
    pub consecutive_failures: u32,
    pub statements: StatementCache,
    pub config: Arc<ConnectionConfig>,
    pub capabilities: EngineCapabilities,
    transaction_active: bool,
}

impl DatabaseHandle {
    pub fn new(engine_tag: EngineTag, designator: impl Into<String>, config: Arc<ConnectionConfig>) -> Self {
        let capacity = config.prepared_statement_cache_size.max(1);
        Self {
            engine_tag,
            connection_handle: None,
            designator: designator.into(),
            status: ConnectionStatus::Disconnected,
            consecutive_failures: 0,
            statements: StatementCache::new(capacity),
            config,
            capabilities: EngineCapabilities::new(),
            transaction_active: false,
        }
    }

    pub fn note_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    pub fn note_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Marks a transaction active on this handle, refusing a second
    /// concurrent `begin` with `InvalidArgument` — a second `begin` while one
    /// is already active is a protocol error.
    pub fn begin_transaction_guard(&mut self) -> Result<(), (ErrorKind, String)> {
        if self.transaction_active {
            return Err((ErrorKind::InvalidArgument, format!("transaction already active on handle `{}`", self.designator)));
        }
        self.transaction_active = true;
        Ok(())
    }

    /// Clears the active-transaction flag. Called unconditionally from
    /// commit and rollback so a failed commit/rollback never leaves the
    /// handle permanently refusing new transactions.
    pub fn end_transaction(&mut self) {
        self.transaction_active = false;
    }

    pub fn transaction_active(&self) -> bool {
        self.transaction_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> DatabaseHandle {
        DatabaseHandle::new(EngineTag::Sqlite, "t", Arc::new(ConnectionConfig::default()))
    }

    #[test]
    fn a_second_begin_while_active_is_refused() {
        let mut h = handle();
        assert!(h.begin_transaction_guard().is_ok());
        let err = h.begin_transaction_guard().unwrap_err();
        assert_eq!(err.0, ErrorKind::InvalidArgument);
    }

    #[test]
    fn end_transaction_allows_a_fresh_begin() {
        let mut h = handle();
        h.begin_transaction_guard().unwrap();
        h.end_transaction();
        assert!(h.begin_transaction_guard().is_ok());
    }

    #[test]
    fn capability_flag_memoizes_across_calls() {
        let caps = EngineCapabilities::with_transactions(false);
        assert!(!caps.transactions_supported());
        assert!(!caps.transactions_supported());
    }
}
