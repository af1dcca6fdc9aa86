//! Logging bootstrap: one `fern::Dispatch` to stdout, matching the
//! `log(level, subsystem, fmt, …)` sink from the external-interfaces spec.
//! Routed through the `log` facade, whose calls can never fail the caller —
//! sink errors are swallowed by design.

use crate::error::Error;

/// Initializes the global logger at `level` (`trace`, `debug`, `info`,
/// `warn`, or `error`; anything else falls back to `info`).
pub fn init(level: &str) -> Result<(), Error> {
    let level_filter = parse_level(level);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level_filter)
        .chain(std::io::stdout())
        .apply()
        .map_err(|e| Error::new("failed to install logger", e.to_string()))?;

    Ok(())
}

fn parse_level(level: &str) -> log::LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" | "alert" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognized_level_falls_back_to_info() {
        assert_eq!(parse_level("nonsense"), log::LevelFilter::Info);
    }

    #[test]
    fn alert_maps_to_warn_since_log_has_no_alert_variant() {
        assert_eq!(parse_level("alert"), log::LevelFilter::Warn);
    }
}
