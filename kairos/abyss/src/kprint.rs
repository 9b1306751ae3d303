//! Kernel print utilities.

use crate::{Machine, Platform, QUITE};
use core::sync::atomic::Ordering;

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    Machine::write_console(fmt);
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
///
/// Use the format! syntax to write data to the console.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// A [`log::Log`] sink that writes through the kernel console.
///
/// Every record is printed with a `[LEVEL]` prefix, the same way the
/// console macros of the kernel always did. Setting [`QUITE`] silences
/// everything below [`log::Level::Error`].
pub struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
            && (metadata.level() == log::Level::Error || !QUITE.load(Ordering::SeqCst))
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            log::Level::Error => "[ERROR]",
            log::Level::Warn => "[WARN]",
            log::Level::Info => "[INFO]",
            log::Level::Debug => "[DEBUG]",
            log::Level::Trace => "[TRACE]",
        };
        println!("{} {}", tag, record.args());
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Installs [`KernelLogger`] as the global logger.
///
/// The logger can only be installed once per image; later calls just move
/// the maximum level.
pub fn init_logger(level: log::LevelFilter) {
    // A second installation is refused by `log`, the first one stays.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
