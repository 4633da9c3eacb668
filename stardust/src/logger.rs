//! Logger implementation

use {
    core::str::FromStr,
    log::{Level, LevelFilter, Log, Metadata, Record},
    xen::{console, println},
};

static LOGGER: Logger = Logger;

/// Default level when the command line sets none
pub const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;

/// Initialise logger using the xen::console backend
pub fn init(level: LevelFilter) {
    // only fails if a logger is already installed, which keeps logging working
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// Picks the level from a `loglevel=<level>` option on the kernel command line
pub fn level_from_cmdline(cmdline: &str) -> LevelFilter {
    cmdline
        .split_whitespace()
        .filter_map(|option| option.strip_prefix("loglevel="))
        .filter_map(|level| LevelFilter::from_str(level).ok())
        .last()
        .unwrap_or(DEFAULT_LEVEL)
}

struct Logger;

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        match record.level() {
            Level::Trace | Level::Debug => println!(
                "{} {}: {}",
                format_level(record.level()),
                record.target(),
                record.args()
            ),
            level => println!("{} {}", format_level(level), record.args()),
        }
    }

    fn flush(&self) {
        console::flush();
    }
}

fn format_level(level: Level) -> &'static str {
    match level {
        Level::Trace => "\x1b[0;35mTRACE\x1b[0m",
        Level::Debug => "\x1b[0;34mDEBUG\x1b[0m",
        Level::Info => "\x1b[0;32mINFO \x1b[0m",
        Level::Warn => "\x1b[0;33mWARN \x1b[0m",
        Level::Error => "\x1b[0;31mERROR\x1b[0m",
    }
}
