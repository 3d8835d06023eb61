//! Colored stderr logger for the simulator and the VM core

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Targets whose records are printed; dependencies stay quiet
const TARGETS: [&str; 2] = ["demand_vm", "vm_sim"];

struct Logger;

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        TARGETS
            .iter()
            .any(|target| metadata.target().starts_with(target))
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let color = match record.level() {
            Level::Error => 31, // Red
            Level::Warn => 93,  // Yellow
            Level::Info => 34,  // Blue
            Level::Debug => 32, // Green
            Level::Trace => 90, // Grey
        };
        let module = record
            .module_path()
            .and_then(|path| path.rsplit("::").next())
            .unwrap_or("?");
        eprintln!(
            "\u{1B}[{color}m[{:>5}] {module}: {}\u{1B}[0m",
            record.level(),
            record.args(),
        );
    }

    fn flush(&self) {}
}

/// Install the logger, at the level named by `LOG` (`error` through `trace`, any case)
///
/// An unset or unknown `LOG` turns logging off.
pub fn init() {
    static LOGGER: Logger = Logger;
    if log::set_logger(&LOGGER).is_err() {
        return;
    }
    let level = std::env::var("LOG")
        .ok()
        .and_then(|level| level.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Off);
    log::set_max_level(level);
}
