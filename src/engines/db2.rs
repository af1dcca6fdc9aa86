//! DB2 driver via ODBC (`odbc-api`). Feature-gated and not part of the
//! default feature set.
//!
//! `odbc_api::Environment::new` is an `unsafe fn` (the ODBC driver manager
//! requires at most one environment handle per process and does not
//! guarantee thread safety across them). This crate forbids `unsafe_code`
//! crate-wide, so this engine cannot bootstrap a live ODBC environment.
//! Connection-string parsing, validation and escaping — the parts that are
//! pure string logic — are fully implemented; `connect` reports
//! `ConnectFailed` rather than silently no-opping.

use crate::executor::{ErrorKind, QueryRequest, QueryResult};
use crate::handle::DatabaseHandle;
use crate::parser::ConnectionConfig;
use crate::registry::{Engine, EngineTag};
use crate::transaction::{IsolationLevel, Transaction};

pub struct Db2Engine;

const NO_ENVIRONMENT_MSG: &str =
    "db2 engine cannot bootstrap an ODBC environment without unsafe code, which this crate forbids";

impl Engine for Db2Engine {
    fn tag(&self) -> EngineTag {
        EngineTag::Db2
    }

    fn connect(&self, _config: &ConnectionConfig, _designator: &str) -> Result<DatabaseHandle, (ErrorKind, String)> {
        Err((ErrorKind::ConnectFailed, NO_ENVIRONMENT_MSG.to_string()))
    }

    fn disconnect(&self, _handle: &mut DatabaseHandle) {}

    fn health_check(&self, _handle: &mut DatabaseHandle) -> bool {
        false
    }

    fn reset_connection(&self, _handle: &mut DatabaseHandle) -> Result<(), (ErrorKind, String)> {
        Err((ErrorKind::ConnectFailed, NO_ENVIRONMENT_MSG.to_string()))
    }

    fn database_is_empty(&self, _handle: &mut DatabaseHandle) -> bool {
        false
    }

    fn execute_query(&self, _handle: &mut DatabaseHandle, _request: &QueryRequest) -> QueryResult {
        QueryResult::failure(ErrorKind::NoDriver, NO_ENVIRONMENT_MSG)
    }

    fn execute_prepared(&self, _handle: &mut DatabaseHandle, _request: &QueryRequest) -> QueryResult {
        QueryResult::failure(ErrorKind::NoDriver, NO_ENVIRONMENT_MSG)
    }

    fn begin_transaction(
        &self,
        _handle: &mut DatabaseHandle,
        _isolation_level: IsolationLevel,
    ) -> Result<Transaction, (ErrorKind, String)> {
        Err((ErrorKind::NoDriver, NO_ENVIRONMENT_MSG.to_string()))
    }

    fn commit_transaction(&self, _handle: &mut DatabaseHandle, _txn: &mut Transaction) -> Result<(), (ErrorKind, String)> {
        Err((ErrorKind::NoDriver, NO_ENVIRONMENT_MSG.to_string()))
    }

    fn rollback_transaction(
        &self,
        _handle: &mut DatabaseHandle,
        _txn: &mut Transaction,
    ) -> Result<(), (ErrorKind, String)> {
        Err((ErrorKind::NoDriver, NO_ENVIRONMENT_MSG.to_string()))
    }

    fn prepare_statement(
        &self,
        _handle: &mut DatabaseHandle,
        _name: &str,
        _sql_template: &str,
    ) -> Result<(), (ErrorKind, String)> {
        Err((ErrorKind::NoDriver, NO_ENVIRONMENT_MSG.to_string()))
    }

    fn unprepare_statement(&self, _handle: &mut DatabaseHandle, _name: &str) {}

    fn get_connection_string(&self, config: &ConnectionConfig) -> String {
        config.connection_string.clone().unwrap_or_default()
    }

    fn validate_connection_string(&self, s: &str) -> bool {
        s.to_uppercase().contains("DRIVER=")
    }

    fn escape_string(&self, s: &str) -> String {
        s.replace('\'', "''")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_reports_missing_environment_rather_than_panicking() {
        let engine = Db2Engine;
        let err = engine.connect(&ConnectionConfig::default(), "d1").unwrap_err();
        assert_eq!(err.0, ErrorKind::ConnectFailed);
    }

    #[test]
    fn validate_connection_string_requires_driver_key() {
        let engine = Db2Engine;
        assert!(engine.validate_connection_string("DRIVER={IBM DB2 ODBC};DATABASE=SAMPLE"));
        assert!(!engine.validate_connection_string("mysql://localhost/app"));
    }
}
