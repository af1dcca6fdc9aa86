//! SQLite driver, backed by `rusqlite` (bundled).

use std::time::Duration;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;

use crate::executor::{
    order_bound_values, parse_parameters_json, rewrite_placeholders, BoundValue, ErrorKind, JsonCell, JsonRowBuilder,
    PlaceholderStyle, QueryRequest, QueryResult,
};
use crate::handle::{ConnectionStatus, DatabaseHandle, NativeConnection, PreparedStatement};
use crate::parser::ConnectionConfig;
use crate::registry::{Engine, EngineTag};
use crate::transaction::{IsolationLevel, Transaction};

pub struct SqliteEngine;

impl SqliteEngine {
    fn conn<'a>(handle: &'a mut DatabaseHandle) -> Result<&'a Connection, (ErrorKind, String)> {
        match handle.connection_handle.as_ref() {
            Some(NativeConnection::Sqlite(conn)) => Ok(conn),
            _ => Err((ErrorKind::NoDriver, "sqlite handle has no open connection".to_string())),
        }
    }
}

impl Engine for SqliteEngine {
    fn tag(&self) -> EngineTag {
        EngineTag::Sqlite
    }

    fn connect(&self, config: &ConnectionConfig, designator: &str) -> Result<DatabaseHandle, (ErrorKind, String)> {
        let path = config.database.as_deref().unwrap_or(":memory:");
        let conn = Connection::open(path).map_err(|e| (ErrorKind::ConnectFailed, e.to_string()))?;
        if let Some(secs) = config.timeout_seconds {
            let _ = conn.busy_timeout(Duration::from_secs(secs));
        }

        let mut handle = DatabaseHandle::new(EngineTag::Sqlite, designator, std::sync::Arc::new(config.clone()));
        handle.connection_handle = Some(NativeConnection::Sqlite(conn));
        handle.status = ConnectionStatus::Connected;
        Ok(handle)
    }

    fn disconnect(&self, handle: &mut DatabaseHandle) {
        handle.statements.invalidate_all();
        handle.connection_handle = None;
        handle.status = ConnectionStatus::Disconnected;
    }

    fn health_check(&self, handle: &mut DatabaseHandle) -> bool {
        let Ok(conn) = Self::conn(handle) else { return false };
        conn.query_row("SELECT 1", [], |_| Ok(())).is_ok()
    }

    fn reset_connection(&self, handle: &mut DatabaseHandle) -> Result<(), (ErrorKind, String)> {
        let config = handle.config.clone();
        self.disconnect(handle);
        let reconnected = self.connect(&config, &handle.designator)?;
        *handle = reconnected;
        Ok(())
    }

    fn database_is_empty(&self, handle: &mut DatabaseHandle) -> bool {
        let Ok(conn) = Self::conn(handle) else { return false };
        conn.query_row("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'", [], |row| row.get::<_, i64>(0))
            .map(|count| count == 0)
            .unwrap_or(false)
    }

    fn execute_query(&self, handle: &mut DatabaseHandle, request: &QueryRequest) -> QueryResult {
        let conn = match Self::conn(handle) {
            Ok(c) => c,
            Err((kind, msg)) => return QueryResult::failure(kind, msg),
        };
        run_statement(conn, &request.sql_template, &request.parameters_json)
    }

    fn execute_prepared(&self, handle: &mut DatabaseHandle, request: &QueryRequest) -> QueryResult {
        let Some(name) = request.prepared_name.as_deref() else {
            return QueryResult::failure(ErrorKind::InvalidArgument, "execute_prepared requires prepared_name");
        };

        if handle.statements.lookup(name).is_none() {
            let stmt = PreparedStatement::new(name, request.sql_template.clone(), true);
            if let Some(evicted) = handle.statements.insert(stmt) {
                log::debug!("evicted prepared statement `{}` from sqlite handle {}", evicted.name, handle.designator);
            }
        }

        let conn = match Self::conn(handle) {
            Ok(c) => c,
            Err((kind, msg)) => return QueryResult::failure(kind, msg),
        };
        run_statement(conn, &request.sql_template, &request.parameters_json)
    }

    fn begin_transaction(
        &self,
        handle: &mut DatabaseHandle,
        isolation_level: IsolationLevel,
    ) -> Result<Transaction, (ErrorKind, String)> {
        handle.begin_transaction_guard()?;
        let sql = isolation_level.sqlite_begin();
        if handle.capabilities.transactions_supported() {
            let conn = Self::conn(handle)?;
            conn.execute_batch(sql).map_err(|e| (ErrorKind::ExecuteFailed, e.to_string()))?;
        } else {
            let request = QueryRequest::new(sql);
            let result = self.execute_query(handle, &request);
            if !result.success {
                handle.end_transaction();
                return Err((result.error_kind.unwrap_or(ErrorKind::ExecuteFailed), result.error_message.unwrap_or_default()));
            }
        }
        Ok(Transaction::new(EngineTag::Sqlite, isolation_level))
    }

    fn commit_transaction(&self, handle: &mut DatabaseHandle, txn: &mut Transaction) -> Result<(), (ErrorKind, String)> {
        if handle.capabilities.transactions_supported() {
            let conn = Self::conn(handle)?;
            conn.execute_batch("COMMIT").map_err(|e| (ErrorKind::ExecuteFailed, e.to_string()))?;
        } else {
            let result = self.execute_query(handle, &QueryRequest::new("COMMIT"));
            if !result.success {
                return Err((result.error_kind.unwrap_or(ErrorKind::ExecuteFailed), result.error_message.unwrap_or_default()));
            }
        }
        txn.finish();
        handle.end_transaction();
        Ok(())
    }

    fn rollback_transaction(
        &self,
        handle: &mut DatabaseHandle,
        txn: &mut Transaction,
    ) -> Result<(), (ErrorKind, String)> {
        if handle.capabilities.transactions_supported() {
            let conn = Self::conn(handle)?;
            conn.execute_batch("ROLLBACK").map_err(|e| (ErrorKind::ExecuteFailed, e.to_string()))?;
        } else {
            let result = self.execute_query(handle, &QueryRequest::new("ROLLBACK"));
            if !result.success {
                return Err((result.error_kind.unwrap_or(ErrorKind::ExecuteFailed), result.error_message.unwrap_or_default()));
            }
        }
        txn.finish();
        handle.end_transaction();
        Ok(())
    }

    fn prepare_statement(
        &self,
        handle: &mut DatabaseHandle,
        name: &str,
        sql_template: &str,
    ) -> Result<(), (ErrorKind, String)> {
        let conn = Self::conn(handle)?;
        conn.prepare(sql_template).map_err(|e| (ErrorKind::PrepareFailed, e.to_string()))?;
        let stmt = PreparedStatement::new(name, sql_template, true);
        handle.statements.insert(stmt);
        Ok(())
    }

    fn unprepare_statement(&self, handle: &mut DatabaseHandle, name: &str) {
        handle.statements.remove(name);
    }

    fn get_connection_string(&self, config: &ConnectionConfig) -> String {
        config.database.clone().unwrap_or_else(|| ":memory:".to_string())
    }

    fn validate_connection_string(&self, s: &str) -> bool {
        !s.is_empty()
    }

    fn escape_string(&self, s: &str) -> String {
        s.replace('\'', "''")
    }
}

fn bind_value(value: &BoundValue) -> SqlValue {
    match value {
        BoundValue::Integer(n) => SqlValue::Integer(*n),
        BoundValue::Text(s) => SqlValue::Text(s.clone()),
        BoundValue::Boolean(b) => SqlValue::Integer(i64::from(*b)),
        BoundValue::Float(f) => SqlValue::Real(*f),
    }
}

fn cell_from_ref(value: ValueRef<'_>) -> JsonCell {
    match value {
        ValueRef::Null => JsonCell::Null,
        ValueRef::Integer(n) => JsonCell::Integer(n),
        ValueRef::Real(f) => JsonCell::Float(f),
        ValueRef::Text(t) => JsonCell::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => JsonCell::Text(String::from_utf8_lossy(b).into_owned()),
    }
}

fn run_statement(conn: &Connection, sql_template: &str, parameters_json: &serde_json::Value) -> QueryResult {
    let params_by_name = match parse_parameters_json(parameters_json) {
        Ok(p) => p,
        Err((kind, msg)) => return QueryResult::failure(kind, msg),
    };
    let (sql, names) = rewrite_placeholders(sql_template, PlaceholderStyle::Question);
    let ordered = match order_bound_values(&names, &params_by_name) {
        Ok(v) => v,
        Err((kind, msg)) => return QueryResult::failure(kind, msg),
    };
    let bound: Vec<SqlValue> = ordered.iter().map(bind_value).collect();
    let params: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|v| v as &dyn rusqlite::ToSql).collect();

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return QueryResult::failure(ErrorKind::PrepareFailed, e.to_string()),
    };

    if stmt.column_count() == 0 {
        return match stmt.execute(params.as_slice()) {
            Ok(affected) => QueryResult {
                affected_rows: affected as u64,
                ..QueryResult::empty_success()
            },
            Err(e) => QueryResult::failure(ErrorKind::ExecuteFailed, e.to_string()),
        };
    }

    let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let mut builder = match JsonRowBuilder::with_row_count_hint(16) {
        Ok(b) => b,
        Err(()) => return QueryResult::failure(ErrorKind::AllocationFailure, "failed to allocate result buffer"),
    };

    let mut rows = match stmt.query(params.as_slice()) {
        Ok(r) => r,
        Err(e) => return QueryResult::failure(ErrorKind::ExecuteFailed, e.to_string()),
    };

    loop {
        let row = match rows.next() {
            Ok(Some(r)) => r,
            Ok(None) => break,
            Err(e) => return QueryResult::failure(ErrorKind::ExecuteFailed, e.to_string()),
        };
        let cells: Vec<JsonCell> = (0..column_names.len())
            .map(|i| row.get_ref(i).map(cell_from_ref).unwrap_or(JsonCell::Null))
            .collect();
        if !builder.push_row(&column_names, &cells) {
            break;
        }
    }

    let column_count = column_names.len();
    let (data_json, row_count) = builder.finish();
    QueryResult {
        success: true,
        row_count,
        column_count,
        affected_rows: 0,
        column_names,
        data_json,
        error_kind: None,
        error_message: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> ConnectionConfig {
        ConnectionConfig {
            engine_tag: EngineTag::Sqlite,
            database: Some(":memory:".to_string()),
            prepared_statement_cache_size: 8,
            ..Default::default()
        }
    }

    #[test]
    fn connect_and_health_check_roundtrip() {
        let engine = SqliteEngine;
        let mut handle = engine.connect(&memory_config(), "t1").expect("connect");
        assert!(engine.health_check(&mut handle));
    }

    #[test]
    fn create_table_insert_and_select_roundtrip() {
        let engine = SqliteEngine;
        let mut handle = engine.connect(&memory_config(), "t2").expect("connect");

        let ddl = QueryRequest::new("CREATE TABLE people (id INTEGER, name TEXT)");
        let result = engine.execute_query(&mut handle, &ddl);
        assert!(result.success);

        let mut insert = QueryRequest::new("INSERT INTO people (id, name) VALUES (:id, :name)");
        insert.parameters_json = serde_json::json!({"INTEGER": {"id": 1}, "TEXT": {"name": "ada"}});
        let result = engine.execute_query(&mut handle, &insert);
        assert!(result.success);
        assert_eq!(result.affected_rows, 1);

        let select = QueryRequest::new("SELECT id, name FROM people");
        let result = engine.execute_query(&mut handle, &select);
        assert!(result.success);
        assert_eq!(result.row_count, 1);
        assert_eq!(result.column_names, vec!["id".to_string(), "name".to_string()]);
        assert!(result.data_json.contains("\"ada\""));
    }

    #[test]
    fn escape_string_doubles_single_quotes() {
        let engine = SqliteEngine;
        assert_eq!(engine.escape_string("o'brien"), "o''brien");
    }

    #[test]
    fn database_is_empty_reports_false_once_a_table_exists() {
        let engine = SqliteEngine;
        let mut handle = engine.connect(&memory_config(), "t3").expect("connect");
        assert!(engine.database_is_empty(&mut handle));

        let ddl = QueryRequest::new("CREATE TABLE widgets (id INTEGER)");
        assert!(engine.execute_query(&mut handle, &ddl).success);
        assert!(!engine.database_is_empty(&mut handle));
    }

    #[test]
    fn a_second_begin_without_committing_is_refused() {
        let engine = SqliteEngine;
        let mut handle = engine.connect(&memory_config(), "t4").expect("connect");
        assert!(engine.begin_transaction(&mut handle, IsolationLevel::ReadCommitted).is_ok());
        assert!(engine.begin_transaction(&mut handle, IsolationLevel::ReadCommitted).is_err());
    }

    #[test]
    fn missing_transaction_capability_falls_back_to_text_statements() {
        use crate::handle::EngineCapabilities;

        let engine = SqliteEngine;
        let mut handle = engine.connect(&memory_config(), "t5").expect("connect");
        handle.capabilities = EngineCapabilities::with_transactions(false);

        let mut txn = engine.begin_transaction(&mut handle, IsolationLevel::ReadCommitted).expect("begin");
        assert!(engine.commit_transaction(&mut handle, &mut txn).is_ok());
        assert!(!handle.transaction_active());
    }
}
