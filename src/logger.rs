//! `log` backend that prints records on the PL011 console.
//!
//! Records look like `[INFO ] spm::ffa::memory: ...`. Nothing is printed
//! until both the logger is installed and the console has a base address.

use core::fmt::Write;

use log::{LevelFilter, Log, Metadata, Record};

use crate::uart;

pub struct ConsoleLogger {
    level: LevelFilter,
}

impl ConsoleLogger {
    pub const fn new(level: LevelFilter) -> Self {
        Self { level }
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) || !uart::is_enabled() {
            return;
        }
        let _ = writeln!(
            uart::writer(),
            "[{:<5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

#[cfg(feature = "console_log")]
static LOGGER: ConsoleLogger = ConsoleLogger::new(LevelFilter::Debug);

/// Install the console logger. Only the first call has any effect.
#[cfg(feature = "console_log")]
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
