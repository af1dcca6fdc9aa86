//! PostgreSQL driver, backed by the `postgres` crate (sfackler), no TLS.

use postgres::types::{ToSql, Type};
use postgres::{Client, NoTls, Row};

use crate::executor::{
    order_bound_values, parse_parameters_json, rewrite_placeholders, BoundValue, ErrorKind, JsonCell, JsonRowBuilder,
    PlaceholderStyle, QueryRequest, QueryResult,
};
use crate::handle::{ConnectionStatus, DatabaseHandle, NativeConnection, PreparedStatement};
use crate::parser::ConnectionConfig;
use crate::registry::{Engine, EngineTag};
use crate::transaction::{IsolationLevel, Transaction};

pub struct PostgresqlEngine;

impl PostgresqlEngine {
    fn conn<'a>(handle: &'a mut DatabaseHandle) -> Result<&'a mut Client, (ErrorKind, String)> {
        match handle.connection_handle.as_mut() {
            Some(NativeConnection::Postgresql(client)) => Ok(client),
            _ => Err((ErrorKind::NoDriver, "postgresql handle has no open connection".to_string())),
        }
    }
}

fn build_conninfo(config: &ConnectionConfig) -> String {
    let mut parts = Vec::new();
    if let Some(host) = &config.host {
        parts.push(format!("host={host}"));
    }
    if let Some(port) = config.port {
        parts.push(format!("port={port}"));
    }
    if let Some(user) = &config.username {
        parts.push(format!("user={user}"));
    }
    if let Some(pass) = &config.password {
        parts.push(format!("password={pass}"));
    }
    if let Some(db) = &config.database {
        parts.push(format!("dbname={db}"));
    }
    if let Some(secs) = config.timeout_seconds {
        parts.push(format!("connect_timeout={secs}"));
    }
    parts.join(" ")
}

impl Engine for PostgresqlEngine {
    fn tag(&self) -> EngineTag {
        EngineTag::Postgresql
    }

    fn connect(&self, config: &ConnectionConfig, designator: &str) -> Result<DatabaseHandle, (ErrorKind, String)> {
        let conninfo = build_conninfo(config);
        let client = Client::connect(&conninfo, NoTls).map_err(|e| (ErrorKind::ConnectFailed, e.to_string()))?;

        let mut handle = DatabaseHandle::new(EngineTag::Postgresql, designator, std::sync::Arc::new(config.clone()));
        handle.connection_handle = Some(NativeConnection::Postgresql(client));
        handle.status = ConnectionStatus::Connected;
        Ok(handle)
    }

    fn disconnect(&self, handle: &mut DatabaseHandle) {
        handle.statements.invalidate_all();
        handle.connection_handle = None;
        handle.status = ConnectionStatus::Disconnected;
    }

    fn health_check(&self, handle: &mut DatabaseHandle) -> bool {
        let Ok(client) = Self::conn(handle) else { return false };
        client.simple_query("SELECT 1").is_ok()
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
        conn.query_one("SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'public'", &[])
            .map(|row| row.get::<_, i64>(0) == 0)
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
                log::debug!(
                    "evicted prepared statement `{}` from postgresql handle {}",
                    evicted.name,
                    handle.designator
                );
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
            conn.simple_query("BEGIN").map_err(|e| (ErrorKind::ExecuteFailed, e.to_string()))?;
            if let Some(preamble) = isolation_level.set_session_sql() {
                conn.simple_query(preamble).map_err(|e| (ErrorKind::ExecuteFailed, e.to_string()))?;
            }
        } else {
            let result = self.execute_query(handle, &QueryRequest::new("BEGIN"));
            if !result.success {
                handle.end_transaction();
                return Err((result.error_kind.unwrap_or(ErrorKind::ExecuteFailed), result.error_message.unwrap_or_default()));
            }
            if let Some(preamble) = isolation_level.set_session_sql() {
                let result = self.execute_query(handle, &QueryRequest::new(preamble));
                if !result.success {
                    handle.end_transaction();
                    return Err((result.error_kind.unwrap_or(ErrorKind::ExecuteFailed), result.error_message.unwrap_or_default()));
                }
            }
        }
        Ok(Transaction::new(EngineTag::Postgresql, isolation_level))
    }

    fn commit_transaction(&self, handle: &mut DatabaseHandle, txn: &mut Transaction) -> Result<(), (ErrorKind, String)> {
        if handle.capabilities.transactions_supported() {
            let conn = Self::conn(handle)?;
            conn.simple_query("COMMIT").map_err(|e| (ErrorKind::ExecuteFailed, e.to_string()))?;
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
            conn.simple_query("ROLLBACK").map_err(|e| (ErrorKind::ExecuteFailed, e.to_string()))?;
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
        let (sql, _) = rewrite_placeholders(sql_template, PlaceholderStyle::Numbered);
        let conn = Self::conn(handle)?;
        conn.prepare(&sql).map_err(|e| (ErrorKind::PrepareFailed, e.to_string()))?;
        let stmt = PreparedStatement::new(name, sql_template, true);
        handle.statements.insert(stmt);
        Ok(())
    }

    fn unprepare_statement(&self, handle: &mut DatabaseHandle, name: &str) {
        handle.statements.remove(name);
    }

    fn get_connection_string(&self, config: &ConnectionConfig) -> String {
        format!(
            "postgresql://{}@{}:{}/{}",
            config.username.as_deref().unwrap_or(""),
            config.host.as_deref().unwrap_or("localhost"),
            config.port.unwrap_or(5432),
            config.database.as_deref().unwrap_or("postgres"),
        )
    }

    fn validate_connection_string(&self, s: &str) -> bool {
        s.starts_with("postgresql://") || s.starts_with("postgres://")
    }

    fn escape_string(&self, s: &str) -> String {
        s.replace('\'', "''")
    }
}

fn boxed_param(value: &BoundValue) -> Box<dyn ToSql + Sync> {
    match value {
        BoundValue::Integer(n) => Box::new(*n),
        BoundValue::Text(s) => Box::new(s.clone()),
        BoundValue::Boolean(b) => Box::new(*b),
        BoundValue::Float(f) => Box::new(*f),
    }
}

fn cell_from_row(row: &Row, idx: usize) -> JsonCell {
    let column_type = row.columns()[idx].type_();
    match *column_type {
        Type::INT2 | Type::INT4 => row.get::<_, Option<i32>>(idx).map(|n| JsonCell::Integer(i64::from(n))).unwrap_or(JsonCell::Null),
        Type::INT8 => row.get::<_, Option<i64>>(idx).map(JsonCell::Integer).unwrap_or(JsonCell::Null),
        Type::FLOAT4 => row.get::<_, Option<f32>>(idx).map(|f| JsonCell::Float(f64::from(f))).unwrap_or(JsonCell::Null),
        Type::FLOAT8 => row.get::<_, Option<f64>>(idx).map(JsonCell::Float).unwrap_or(JsonCell::Null),
        Type::BOOL => row.get::<_, Option<bool>>(idx).map(JsonCell::Bool).unwrap_or(JsonCell::Null),
        _ => row.get::<_, Option<String>>(idx).map(JsonCell::Text).unwrap_or(JsonCell::Null),
    }
}

fn run_statement(conn: &mut Client, sql_template: &str, parameters_json: &serde_json::Value) -> QueryResult {
    let params_by_name = match parse_parameters_json(parameters_json) {
        Ok(p) => p,
        Err((kind, msg)) => return QueryResult::failure(kind, msg),
    };
    let (sql, names) = rewrite_placeholders(sql_template, PlaceholderStyle::Numbered);
    let ordered = match order_bound_values(&names, &params_by_name) {
        Ok(v) => v,
        Err((kind, msg)) => return QueryResult::failure(kind, msg),
    };
    let boxed: Vec<Box<dyn ToSql + Sync>> = ordered.iter().map(boxed_param).collect();
    let params: Vec<&(dyn ToSql + Sync)> = boxed.iter().map(|b| b.as_ref()).collect();

    let stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return QueryResult::failure(ErrorKind::PrepareFailed, e.to_string()),
    };

    if stmt.columns().is_empty() {
        return match conn.execute(&stmt, params.as_slice()) {
            Ok(affected) => QueryResult {
                affected_rows: affected,
                ..QueryResult::empty_success()
            },
            Err(e) => QueryResult::failure(ErrorKind::ExecuteFailed, e.to_string()),
        };
    }

    let column_names: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();
    let rows = match conn.query(&stmt, params.as_slice()) {
        Ok(r) => r,
        Err(e) => return QueryResult::failure(ErrorKind::ExecuteFailed, e.to_string()),
    };

    let mut builder = match JsonRowBuilder::with_row_count_hint(rows.len()) {
        Ok(b) => b,
        Err(()) => return QueryResult::failure(ErrorKind::AllocationFailure, "failed to allocate result buffer"),
    };

    for row in &rows {
        let cells: Vec<JsonCell> = (0..column_names.len()).map(|i| cell_from_row(row, i)).collect();
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

    #[test]
    fn validate_connection_string_accepts_both_schemes() {
        let engine = PostgresqlEngine;
        assert!(engine.validate_connection_string("postgresql://localhost/app"));
        assert!(engine.validate_connection_string("postgres://localhost/app"));
        assert!(!engine.validate_connection_string("mysql://localhost/app"));
    }

    #[test]
    fn build_conninfo_includes_only_present_fields() {
        let config = ConnectionConfig {
            engine_tag: EngineTag::Postgresql,
            host: Some("db.internal".to_string()),
            port: Some(5432),
            database: Some("orders".to_string()),
            ..Default::default()
        };
        let conninfo = build_conninfo(&config);
        assert!(conninfo.contains("host=db.internal"));
        assert!(conninfo.contains("dbname=orders"));
        assert!(!conninfo.contains("user="));
    }
}
