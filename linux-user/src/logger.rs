//! Stream-tagged logging: `--logs qir:qcg:aot` enables verbose
//! output for the named streams (log targets); warnings and errors
//! always pass.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct StreamLogger {
    streams: Vec<String>,
}

impl Log for StreamLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Warn
            || self.streams.iter().any(|s| s == metadata.target())
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the logger with the given enabled streams.
pub fn init(streams: Vec<String>) {
    let logger = Box::new(StreamLogger { streams });
    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(LevelFilter::Trace);
    }
}
