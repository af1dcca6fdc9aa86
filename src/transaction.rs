//! Transaction handle and isolation-level mapping.

use std::time::Instant;

use crate::registry::EngineTag;
use crate::util::get_uuid;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// The SQL preamble to run before `BEGIN` for engines that model
    /// isolation level as a session/transaction setting (MySQL, PostgreSQL).
    /// SQLite has no such statement; its isolation is expressed entirely
    /// through the `BEGIN` variant (see [`Self::sqlite_begin`]).
    pub fn set_session_sql(self) -> Option<&'static str> {
        match self {
            IsolationLevel::ReadUncommitted => Some("SET SESSION TRANSACTION ISOLATION LEVEL READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => Some("SET SESSION TRANSACTION ISOLATION LEVEL READ COMMITTED"),
            IsolationLevel::RepeatableRead => Some("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ"),
            IsolationLevel::Serializable => Some("SET SESSION TRANSACTION ISOLATION LEVEL SERIALIZABLE"),
        }
    }

    pub fn sqlite_begin(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "PRAGMA read_uncommitted=1; BEGIN",
            IsolationLevel::Serializable => "BEGIN EXCLUSIVE",
            IsolationLevel::ReadCommitted | IsolationLevel::RepeatableRead => "BEGIN",
        }
    }
}

/// Opaque handle tied to a single `DatabaseHandle`. A second `begin` on the
/// same connection while one is already active is a protocol error, enforced
/// by `DatabaseHandle::begin_transaction_guard` rather than by this type.
#[derive(Clone, Debug)]
pub struct Transaction {
    pub transaction_id: String,
    pub engine_tag: EngineTag,
    pub isolation_level: IsolationLevel,
    pub started_at: Instant,
    pub active: bool,
}

impl Transaction {
    pub fn new(engine_tag: EngineTag, isolation_level: IsolationLevel) -> Self {
        Self {
            transaction_id: get_uuid(),
            engine_tag,
            isolation_level,
            started_at: Instant::now(),
            active: true,
        }
    }

    /// Marks the transaction inactive regardless of the driver's commit/
    /// rollback outcome, so a handle is never left stuck waiting on a
    /// transaction that will never be retried.
    pub fn finish(&mut self) {
        self.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_clears_active_unconditionally() {
        let mut txn = Transaction::new(EngineTag::Sqlite, IsolationLevel::Serializable);
        assert!(txn.active);
        txn.finish();
        assert!(!txn.active);
    }

    #[test]
    fn isolation_levels_map_to_distinct_sqlite_begin_statements() {
        assert_eq!(IsolationLevel::Serializable.sqlite_begin(), "BEGIN EXCLUSIVE");
        assert_eq!(IsolationLevel::ReadCommitted.sqlite_begin(), "BEGIN");
    }
}
