//! Per-database queue fleet: one Lead plus up to four worker tiers, each
//! backed by its own OS thread and a bounded mpsc channel.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::executor::{ErrorKind, QueryRequest, QueryResult};
use crate::handle::DatabaseHandle;
use crate::migration::{self, MigrationSource, Watermarks};
use crate::parser::ConnectionConfig;
use crate::registry::Engine;
use crate::stats::DqmStats;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum QueueType {
    Lead,
    Cache,
    Fast,
    Medium,
    Slow,
}

const TIERS: [QueueType; 4] = [QueueType::Cache, QueueType::Fast, QueueType::Medium, QueueType::Slow];

fn tier_index(tier: QueueType) -> usize {
    match tier {
        QueueType::Cache => 0,
        QueueType::Fast => 1,
        QueueType::Medium => 2,
        QueueType::Slow => 3,
        QueueType::Lead => panic!("Lead is not a worker tier"),
    }
}

struct WorkItem {
    request: QueryRequest,
    reply: mpsc::Sender<QueryResult>,
}

/// A single worker or Lead queue. Workers keep no persistent connection —
/// they open one transiently per request; only a Lead's `connection` is
/// long-lived.
pub struct DatabaseQueue {
    pub database_name: String,
    pub queue_type: QueueType,
    pub is_lead_queue: bool,
    pub queue_number: usize,
    pub can_spawn_queues: bool,
    pub max_child_queues: usize,

    children: Mutex<[Vec<Arc<DatabaseQueue>>; 4]>,
    dispatch_cursor: [AtomicUsize; 4],
    child_queue_count: AtomicUsize,

    connection: Mutex<Option<DatabaseHandle>>,
    pub last_heartbeat: Mutex<Instant>,
    watermarks: Mutex<Watermarks>,
    pub empty_database: AtomicBool,
    pub test_migration: bool,

    shutdown: Arc<AtomicBool>,
    sender: mpsc::Sender<WorkItem>,

    config: Arc<ConnectionConfig>,
    engine: Arc<dyn Engine>,
    stats: Arc<DqmStats>,
}

/// Generous default cap on how many worker queues a Lead may spawn across
/// its lifetime; ambient configuration does not expose a per-database
/// override for this bound today.
const DEFAULT_MAX_CHILD_QUEUES: usize = 64;

impl DatabaseQueue {
    /// Builds the Lead queue for a database. The Lead's own channel is
    /// unused — it dispatches directly to its children rather than
    /// servicing a queue of its own — so the receiver half is dropped
    /// immediately.
    pub fn new_lead(
        database_name: impl Into<String>,
        config: Arc<ConnectionConfig>,
        engine: Arc<dyn Engine>,
        stats: Arc<DqmStats>,
        test_migration: bool,
    ) -> Arc<Self> {
        let (queue, receiver) =
            Self::new(database_name, QueueType::Lead, 0, DEFAULT_MAX_CHILD_QUEUES, config, engine, stats, test_migration);
        drop(receiver);
        queue
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        database_name: impl Into<String>,
        queue_type: QueueType,
        queue_number: usize,
        max_child_queues: usize,
        config: Arc<ConnectionConfig>,
        engine: Arc<dyn Engine>,
        stats: Arc<DqmStats>,
        test_migration: bool,
    ) -> (Arc<Self>, mpsc::Receiver<WorkItem>) {
        let (sender, receiver) = mpsc::channel();
        let queue = Arc::new(Self {
            database_name: database_name.into(),
            queue_type,
            is_lead_queue: matches!(queue_type, QueueType::Lead),
            queue_number,
            can_spawn_queues: matches!(queue_type, QueueType::Lead),
            max_child_queues,
            children: Mutex::new([Vec::new(), Vec::new(), Vec::new(), Vec::new()]),
            dispatch_cursor: [AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)],
            child_queue_count: AtomicUsize::new(0),
            connection: Mutex::new(None),
            last_heartbeat: Mutex::new(Instant::now()),
            watermarks: Mutex::new(Watermarks::default()),
            empty_database: AtomicBool::new(false),
            test_migration,
            shutdown: Arc::new(AtomicBool::new(false)),
            sender,
            config,
            engine,
            stats,
        });
        (queue, receiver)
    }

    pub fn child_queue_count(&self) -> usize {
        self.child_queue_count.load(Ordering::Relaxed)
    }

    /// Spawns a worker queue of `tier` and starts its thread. Refuses when
    /// `child_queue_count == max_child_queues`, leaving the counter
    /// unchanged.
    pub fn spawn_child_queue(self: &Arc<Self>, tier: QueueType) -> bool {
        if !self.can_spawn_queues {
            return false;
        }
        if self.child_queue_count.load(Ordering::Relaxed) >= self.max_child_queues {
            return false;
        }

        let idx = tier_index(tier);
        let queue_number = {
            let children = self.children.lock().expect("children mutex poisoned");
            children[idx].len()
        };

        let (child, receiver) = DatabaseQueue::new(
            self.database_name.clone(),
            tier,
            queue_number,
            0,
            Arc::clone(&self.config),
            Arc::clone(&self.engine),
            Arc::clone(&self.stats),
            false,
        );
        child.shutdown.store(false, Ordering::Relaxed);

        let worker_child = Arc::clone(&child);
        std::thread::spawn(move || worker_loop(worker_child, receiver));

        self.children.lock().expect("children mutex poisoned")[idx].push(Arc::clone(&child));
        self.child_queue_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Spawns `count` workers for every tier named in `start_counts`, in
    /// (cache, fast, medium, slow) order.
    pub fn launch_additional_queues(self: &Arc<Self>, start_counts: [usize; 4]) {
        for (tier, count) in TIERS.into_iter().zip(start_counts) {
            for _ in 0..count {
                if !self.spawn_child_queue(tier) {
                    log::warn!(
                        "database `{}` hit max_child_queues ({}) while launching {:?} workers",
                        self.database_name,
                        self.max_child_queues,
                        tier
                    );
                    break;
                }
            }
        }
    }

    /// Round-robin dispatch of a request to one worker of `tier`. FIFO
    /// ordering within that worker's own channel is preserved; this call
    /// only distributes across siblings of the same tier.
    pub fn dispatch(&self, tier: QueueType, request: QueryRequest) -> QueryResult {
        let idx = tier_index(tier);
        let target = {
            let children = self.children.lock().expect("children mutex poisoned");
            if children[idx].is_empty() {
                None
            } else {
                let cursor = self.dispatch_cursor[idx].fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&children[idx][cursor % children[idx].len()]))
            }
        };

        let Some(worker) = target else {
            return QueryResult::failure(ErrorKind::NoDriver, format!("no {tier:?} workers available for `{}`", self.database_name));
        };

        let (reply_tx, reply_rx) = mpsc::channel();
        if worker.sender.send(WorkItem { request, reply: reply_tx }).is_err() {
            return QueryResult::failure(ErrorKind::ShutdownInProgress, "worker channel closed");
        }
        reply_rx
            .recv()
            .unwrap_or_else(|_| QueryResult::failure(ErrorKind::ShutdownInProgress, "worker dropped without replying"))
    }

    /// Step 1 of Lead startup: opens the persistent connection. Refuses on
    /// non-lead queues.
    pub fn establish_connection(&self, designator: &str) -> Result<(), (ErrorKind, String)> {
        if !self.is_lead_queue {
            return Err((ErrorKind::InvalidArgument, "establish_connection is a Lead-only operation".to_string()));
        }
        let handle = self.engine.connect(&self.config, designator)?;
        *self.connection.lock().expect("connection mutex poisoned") = Some(handle);
        Ok(())
    }

    /// Step 2: reads watermarks through `source` and the Lead's connection.
    pub fn validate_migrations(&self, source: &dyn MigrationSource) -> Result<(), (ErrorKind, String)> {
        let mut conn_guard = self.connection.lock().expect("connection mutex poisoned");
        let Some(handle) = conn_guard.as_mut() else {
            return Err((ErrorKind::NoDriver, "validate_migrations called before establish_connection".to_string()));
        };
        let empty_database = self.engine.database_is_empty(handle);
        self.empty_database.store(empty_database, Ordering::Relaxed);
        let watermarks = migration::validate_migrations(self.engine.as_ref(), handle, source, empty_database)?;
        *self.watermarks.lock().expect("watermarks mutex poisoned") = watermarks;
        Ok(())
    }

    /// Step 3: drives LOAD/APPLY to convergence.
    pub fn execute_migration_process(&self, source: &dyn MigrationSource) -> Result<(), (ErrorKind, String)> {
        let mut conn_guard = self.connection.lock().expect("connection mutex poisoned");
        let Some(handle) = conn_guard.as_mut() else {
            return Err((ErrorKind::NoDriver, "execute_migration_process called before establish_connection".to_string()));
        };
        let mut watermarks = *self.watermarks.lock().expect("watermarks mutex poisoned");
        let result = migration::execute_migration_process(self.engine.as_ref(), handle, source, &mut watermarks);
        *self.watermarks.lock().expect("watermarks mutex poisoned") = watermarks;
        result
    }

    /// Step 4: optional migration smoke test, gated on `connection.test_migration`.
    /// No-op success when the flag is unset.
    pub fn run_migration_test(&self) -> Result<(), (ErrorKind, String)> {
        if !self.test_migration {
            return Ok(());
        }
        let mut conn_guard = self.connection.lock().expect("connection mutex poisoned");
        let Some(handle) = conn_guard.as_mut() else {
            return Err((ErrorKind::NoDriver, "run_migration_test called before establish_connection".to_string()));
        };
        migration::run_migration_test(self.engine.as_ref(), handle, true)
    }

    /// Step 6: cooperative heartbeat tick.
    pub fn manage_heartbeats(&self) -> Result<(), (ErrorKind, String)> {
        if !self.is_lead_queue {
            return Err((ErrorKind::InvalidArgument, "manage_heartbeats is a Lead-only operation".to_string()));
        }
        *self.last_heartbeat.lock().expect("heartbeat mutex poisoned") = Instant::now();
        Ok(())
    }

    /// Signals shutdown to this queue and every descendant, then returns
    /// once each worker channel has been closed. Per the concurrency model,
    /// a worker finishes its in-flight request before observing shutdown; a
    /// worker thread that never returns (a stuck native call) is not waited
    /// on beyond the caller's own join timeout.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let children = self.children.lock().expect("children mutex poisoned");
        for tier in children.iter() {
            for child in tier {
                child.shutdown();
            }
        }
    }
}

fn worker_loop(queue: Arc<DatabaseQueue>, receiver: mpsc::Receiver<WorkItem>) {
    loop {
        if queue.shutdown.load(Ordering::Relaxed) {
            return;
        }

        let item = match receiver.recv_timeout(Duration::from_millis(200)) {
            Ok(item) => item,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };

        let result = service_request(&queue, item.request);
        let _ = item.reply.send(result);
    }
}

/// Runs the engine call on a dedicated thread and waits for it only up to
/// `request.timeout_ms`. On timeout the background thread — and the
/// `DatabaseHandle` it owns — is abandoned rather than interrupted, per the
/// concurrency model's cancellation note: a stuck native call is never
/// preempted, only waited past.
fn service_request(queue: &DatabaseQueue, request: QueryRequest) -> QueryResult {
    queue.stats.record_query();

    let designator = format!("{}-{:?}-{}", queue.database_name, queue.queue_type, queue.queue_number);
    let handle = match queue.engine.connect(&queue.config, &designator) {
        Ok(h) => h,
        Err((kind, msg)) => return QueryResult::failure(kind, msg),
    };

    let timeout_ms = request.timeout_ms;
    let (tx, rx) = mpsc::channel();
    let engine = Arc::clone(&queue.engine);
    std::thread::spawn(move || {
        let mut handle = handle;
        let result = if request.prepared_name.is_some() {
            engine.execute_prepared(&mut handle, &request)
        } else {
            engine.execute_query(&mut handle, &request)
        };
        let _ = tx.send(result);
    });

    match rx.recv_timeout(Duration::from_millis(timeout_ms)) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
            queue.stats.record_timeout();
            QueryResult::failure(ErrorKind::Timeout, format!("query exceeded {timeout_ms}ms"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::ConnectionStatus;
    use crate::registry::EngineTag;
    use crate::transaction::{IsolationLevel, Transaction};

    struct AlwaysOkEngine;
    impl Engine for AlwaysOkEngine {
        fn tag(&self) -> EngineTag {
            EngineTag::Sqlite
        }
        fn connect(&self, config: &ConnectionConfig, designator: &str) -> Result<DatabaseHandle, (ErrorKind, String)> {
            let mut h = DatabaseHandle::new(EngineTag::Sqlite, designator, Arc::new(config.clone()));
            h.status = ConnectionStatus::Connected;
            Ok(h)
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
        fn begin_transaction(&self, handle: &mut DatabaseHandle, isolation_level: IsolationLevel) -> Result<Transaction, (ErrorKind, String)> {
            handle.begin_transaction_guard()?;
            Ok(Transaction::new(EngineTag::Sqlite, isolation_level))
        }
        fn commit_transaction(&self, handle: &mut DatabaseHandle, txn: &mut Transaction) -> Result<(), (ErrorKind, String)> {
            txn.finish();
            handle.end_transaction();
            Ok(())
        }
        fn rollback_transaction(&self, handle: &mut DatabaseHandle, txn: &mut Transaction) -> Result<(), (ErrorKind, String)> {
            txn.finish();
            handle.end_transaction();
            Ok(())
        }
        fn prepare_statement(&self, _: &mut DatabaseHandle, _: &str, _: &str) -> Result<(), (ErrorKind, String)> {
            Ok(())
        }
        fn unprepare_statement(&self, _: &mut DatabaseHandle, _: &str) {}
        fn get_connection_string(&self, _: &ConnectionConfig) -> String {
            String::new()
        }
        fn validate_connection_string(&self, _: &str) -> bool {
            true
        }
        fn escape_string(&self, s: &str) -> String {
            s.to_string()
        }
    }

    fn lead() -> Arc<DatabaseQueue> {
        let (queue, receiver) = DatabaseQueue::new(
            "db1",
            QueueType::Lead,
            0,
            2,
            Arc::new(ConnectionConfig::default()),
            Arc::new(AlwaysOkEngine),
            Arc::new(DqmStats::new()),
            false,
        );
        drop(receiver);
        queue
    }

    #[test]
    fn spawn_respects_max_child_queues() {
        let lead = lead();
        assert!(lead.spawn_child_queue(QueueType::Fast));
        assert!(lead.spawn_child_queue(QueueType::Fast));
        assert!(!lead.spawn_child_queue(QueueType::Fast));
        assert_eq!(lead.child_queue_count(), 2);
    }

    #[test]
    fn only_lead_queues_can_spawn() {
        let (worker, receiver) = DatabaseQueue::new(
            "db1",
            QueueType::Fast,
            0,
            5,
            Arc::new(ConnectionConfig::default()),
            Arc::new(AlwaysOkEngine),
            Arc::new(DqmStats::new()),
            false,
        );
        drop(receiver);
        assert!(!worker.spawn_child_queue(QueueType::Fast));
    }

    #[test]
    fn establish_connection_refuses_on_non_lead_queue() {
        let (worker, receiver) = DatabaseQueue::new(
            "db1",
            QueueType::Cache,
            0,
            0,
            Arc::new(ConnectionConfig::default()),
            Arc::new(AlwaysOkEngine),
            Arc::new(DqmStats::new()),
            false,
        );
        drop(receiver);
        assert!(worker.establish_connection("d").is_err());
    }

    #[test]
    fn run_migration_test_is_a_noop_when_flag_unset() {
        let lead = lead();
        lead.establish_connection("d").expect("connect");
        assert!(lead.run_migration_test().is_ok());
    }

    #[test]
    fn run_migration_test_runs_the_smoke_query_when_flag_set() {
        let (lead, receiver) = DatabaseQueue::new(
            "db1",
            QueueType::Lead,
            0,
            2,
            Arc::new(ConnectionConfig::default()),
            Arc::new(AlwaysOkEngine),
            Arc::new(DqmStats::new()),
            true,
        );
        drop(receiver);
        lead.establish_connection("d").expect("connect");
        assert!(lead.run_migration_test().is_ok());
    }

    #[test]
    fn dispatch_round_robins_across_tier_siblings() {
        let lead = lead();
        lead.spawn_child_queue(QueueType::Fast);
        lead.spawn_child_queue(QueueType::Fast);

        for _ in 0..4 {
            let result = lead.dispatch(QueueType::Fast, QueryRequest::new("SELECT 1"));
            assert!(result.success);
        }
    }
}
