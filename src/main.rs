use dbfleet::config::AppConfig;
use dbfleet::log_setup;
use dbfleet::manager::DatabaseQueueManager;
use dbfleet::registry::register_default_engines;

fn main() {
    let config = match AppConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[ERROR] {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = log_setup::init(&config.log_level) {
        eprintln!("[ERROR] {e}");
        std::process::exit(1);
    }

    register_default_engines();

    let mut manager = match DatabaseQueueManager::bootstrap(&config) {
        Ok(m) => m,
        Err((kind, msg)) => {
            log::error!("failed to bootstrap database fleet: {kind} ({msg})");
            std::process::exit(1);
        }
    };

    log::info!("dbfleet started with {} configured database(s)", config.databases.connections.len());

    // Migration execution and worker-tier launch per database are driven by
    // whatever embeds this crate, since they need a `MigrationSource` this
    // binary has no opinion on. This bootstrap only owns process lifetime.
    std::thread::park();

    log::info!("shutting down, grace period {}ms", config.shutdown_grace_period_ms);
    manager.destroy();
}
