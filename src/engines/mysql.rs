//! MySQL/MariaDB driver, backed by the `mysql` crate (blackbeam).

use mysql::prelude::Queryable;
use mysql::{Conn, OptsBuilder, Params, Value as MyValue};

use crate::executor::{
    order_bound_values, parse_parameters_json, rewrite_placeholders, BoundValue, ErrorKind, JsonCell, JsonRowBuilder,
    PlaceholderStyle, QueryRequest, QueryResult,
};
use crate::handle::{ConnectionStatus, DatabaseHandle, NativeConnection, PreparedStatement};
use crate::parser::ConnectionConfig;
use crate::registry::{Engine, EngineTag};
use crate::transaction::{IsolationLevel, Transaction};

pub struct MysqlEngine;

impl MysqlEngine {
    fn conn<'a>(handle: &'a mut DatabaseHandle) -> Result<&'a mut Conn, (ErrorKind, String)> {
        match handle.connection_handle.as_mut() {
            Some(NativeConnection::Mysql(conn)) => Ok(conn),
            _ => Err((ErrorKind::NoDriver, "mysql handle has no open connection".to_string())),
        }
    }
}

impl Engine for MysqlEngine {
    fn tag(&self) -> EngineTag {
        EngineTag::Mysql
    }

    fn connect(&self, config: &ConnectionConfig, designator: &str) -> Result<DatabaseHandle, (ErrorKind, String)> {
        let mut builder = OptsBuilder::new()
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port.unwrap_or(3306))
            .user(config.username.clone())
            .pass(config.password.clone());
        if let Some(db) = config.database.as_deref() {
            builder = builder.db_name(Some(db));
        }
        if let Some(secs) = config.timeout_seconds {
            builder = builder.read_timeout(Some(std::time::Duration::from_secs(secs)));
        }

        let conn = Conn::new(builder).map_err(|e| (ErrorKind::ConnectFailed, e.to_string()))?;

        let mut handle = DatabaseHandle::new(EngineTag::Mysql, designator, std::sync::Arc::new(config.clone()));
        handle.connection_handle = Some(NativeConnection::Mysql(conn));
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
        conn.query_drop("SELECT 1").is_ok()
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
        conn.query_first::<i64, _>("SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = DATABASE()")
            .map(|count| count.unwrap_or(0) == 0)
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
                log::debug!("evicted prepared statement `{}` from mysql handle {}", evicted.name, handle.designator);
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
        if handle.capabilities.transactions_supported() {
            let conn = Self::conn(handle)?;
            if let Some(preamble) = isolation_level.set_session_sql() {
                conn.query_drop(preamble).map_err(|e| (ErrorKind::ExecuteFailed, e.to_string()))?;
            }
            conn.query_drop("START TRANSACTION").map_err(|e| (ErrorKind::ExecuteFailed, e.to_string()))?;
        } else {
            if let Some(preamble) = isolation_level.set_session_sql() {
                let result = self.execute_query(handle, &QueryRequest::new(preamble));
                if !result.success {
                    handle.end_transaction();
                    return Err((result.error_kind.unwrap_or(ErrorKind::ExecuteFailed), result.error_message.unwrap_or_default()));
                }
            }
            let result = self.execute_query(handle, &QueryRequest::new("START TRANSACTION"));
            if !result.success {
                handle.end_transaction();
                return Err((result.error_kind.unwrap_or(ErrorKind::ExecuteFailed), result.error_message.unwrap_or_default()));
            }
        }
        Ok(Transaction::new(EngineTag::Mysql, isolation_level))
    }

    fn commit_transaction(&self, handle: &mut DatabaseHandle, txn: &mut Transaction) -> Result<(), (ErrorKind, String)> {
        if handle.capabilities.transactions_supported() {
            let conn = Self::conn(handle)?;
            conn.query_drop("COMMIT").map_err(|e| (ErrorKind::ExecuteFailed, e.to_string()))?;
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
            conn.query_drop("ROLLBACK").map_err(|e| (ErrorKind::ExecuteFailed, e.to_string()))?;
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
        conn.prep(sql_template).map_err(|e| (ErrorKind::PrepareFailed, e.to_string()))?;
        let stmt = PreparedStatement::new(name, sql_template, true);
        handle.statements.insert(stmt);
        Ok(())
    }

    fn unprepare_statement(&self, handle: &mut DatabaseHandle, name: &str) {
        handle.statements.remove(name);
    }

    fn get_connection_string(&self, config: &ConnectionConfig) -> String {
        format!(
            "mysql://{}@{}:{}/{}",
            config.username.as_deref().unwrap_or(""),
            config.host.as_deref().unwrap_or("localhost"),
            config.port.unwrap_or(3306),
            config.database.as_deref().unwrap_or(""),
        )
    }

    fn validate_connection_string(&self, s: &str) -> bool {
        s.starts_with("mysql://")
    }

    fn escape_string(&self, s: &str) -> String {
        s.replace('\\', "\\\\").replace('\'', "\\'")
    }
}

fn bind_value(value: &BoundValue) -> MyValue {
    match value {
        BoundValue::Integer(n) => MyValue::Int(*n),
        BoundValue::Text(s) => MyValue::Bytes(s.as_bytes().to_vec()),
        BoundValue::Boolean(b) => MyValue::Int(i64::from(*b)),
        BoundValue::Float(f) => MyValue::Double(*f),
    }
}

fn cell_from_value(value: &MyValue) -> JsonCell {
    match value {
        MyValue::NULL => JsonCell::Null,
        MyValue::Int(n) => JsonCell::Integer(*n),
        MyValue::UInt(n) => JsonCell::Integer(*n as i64),
        MyValue::Float(f) => JsonCell::Float(f64::from(*f)),
        MyValue::Double(f) => JsonCell::Float(*f),
        MyValue::Bytes(bytes) => JsonCell::Text(String::from_utf8_lossy(bytes).into_owned()),
        other => JsonCell::Text(format!("{other:?}")),
    }
}

fn run_statement(conn: &mut Conn, sql_template: &str, parameters_json: &serde_json::Value) -> QueryResult {
    let params_by_name = match parse_parameters_json(parameters_json) {
        Ok(p) => p,
        Err((kind, msg)) => return QueryResult::failure(kind, msg),
    };
    let (sql, names) = rewrite_placeholders(sql_template, PlaceholderStyle::Question);
    let ordered = match order_bound_values(&names, &params_by_name) {
        Ok(v) => v,
        Err((kind, msg)) => return QueryResult::failure(kind, msg),
    };
    let bound: Vec<MyValue> = ordered.iter().map(bind_value).collect();
    let params = if bound.is_empty() { Params::Empty } else { Params::Positional(bound) };

    let mut result = match conn.exec_iter(sql, params) {
        Ok(r) => r,
        Err(e) => return QueryResult::failure(ErrorKind::ExecuteFailed, e.to_string()),
    };

    let column_names: Vec<String> = result.columns().iter().map(|c| c.name_str().into_owned()).collect();
    let affected_rows = result.affected_rows();

    if column_names.is_empty() {
        return QueryResult {
            affected_rows,
            ..QueryResult::empty_success()
        };
    }

    let mut builder = match JsonRowBuilder::with_row_count_hint(16) {
        Ok(b) => b,
        Err(()) => return QueryResult::failure(ErrorKind::AllocationFailure, "failed to allocate result buffer"),
    };

    for row_result in result.by_ref() {
        let row = match row_result {
            Ok(r) => r,
            Err(e) => return QueryResult::failure(ErrorKind::ExecuteFailed, e.to_string()),
        };
        let cells: Vec<JsonCell> = (0..column_names.len())
            .map(|i| row.as_ref(i).map(cell_from_value).unwrap_or(JsonCell::Null))
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
        affected_rows,
        column_names,
        data_json,
        error_kind: None,
        error_message: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_connection_string_requires_mysql_scheme() {
        let engine = MysqlEngine;
        assert!(engine.validate_connection_string("mysql://root@localhost/app"));
        assert!(!engine.validate_connection_string("postgresql://localhost/app"));
    }

    #[test]
    fn escape_string_escapes_backslash_and_quote() {
        let engine = MysqlEngine;
        assert_eq!(engine.escape_string(r"a\b'c"), r"a\\b\'c");
    }

    #[test]
    fn get_connection_string_renders_canonical_uri() {
        let engine = MysqlEngine;
        let config = ConnectionConfig {
            engine_tag: EngineTag::Mysql,
            host: Some("db.internal".to_string()),
            port: Some(3306),
            database: Some("app".to_string()),
            username: Some("svc".to_string()),
            ..Default::default()
        };
        assert_eq!(engine.get_connection_string(&config), "mysql://svc@db.internal:3306/app");
    }
}
