use std::io::Write;

use env_logger::DEFAULT_FILTER_ENV;
use env_logger::fmt::style::Style;
use log::LevelFilter;

/// Tag of the log lines of a process: the service for a parent, the group or entry for a worker.
///
/// Workers inherit the output of their parent, so the tag tells their lines apart.
pub fn log_component(service: &str, worker: Option<&str>) -> String {
    match worker {
        Some(name) => format!("{service}/{name}"),
        None => service.to_string(),
    }
}

/// Configures the logger from `verbose` and `RUST_LOG`, prefixing every line with `component`.
pub fn setup_logging(verbose: bool, component: &str) {
    let mut builder = env_logger::Builder::default();
    builder.filter_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    let debug_from_env = std::env::var(DEFAULT_FILTER_ENV).is_ok_and(|v| v.contains("debug"));
    let precise = verbose || debug_from_env;
    let component = component.to_string();
    builder.format(move |buf, record| {
        let level_style = buf.default_level_style(record.level()).bold();
        let dim = Style::new().dimmed();
        if precise {
            writeln!(
                buf,
                "{dim}{}{dim:#} {level_style}{:<5}{level_style:#} [{component}] {}: {}",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        } else {
            writeln!(
                buf,
                "{dim}{}{dim:#} {level_style}{}{level_style:#} [{component}] {}",
                buf.timestamp_seconds(),
                record.level(),
                record.args()
            )
        }
    });

    builder.parse_default_env();
    builder.init();
}
