//! A minimal internal logging facility: no external logging crate, just a
//! level-gated write to stderr.
//!
//! `LogDebug` is silent unless `HEAPSCOPE_DEBUG` is set, so the preload
//! side stays quiet by default even when it degrades silently per the
//! tracer's error-handling contract.

use std::fmt;
use std::sync::OnceLock;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LogLevel {
    LogDebug,
    LogWarn,
    LogError,
}

fn debug_enabled() -> bool {
    static DEBUG: OnceLock<bool> = OnceLock::new();
    *DEBUG.get_or_init(|| std::env::var_os("HEAPSCOPE_DEBUG").is_some())
}

#[doc(hidden)]
pub fn log_impl(level: LogLevel, args: fmt::Arguments<'_>) {
    if level == LogLevel::LogDebug && !debug_enabled() {
        return;
    }
    let tag = match level {
        LogLevel::LogDebug => "debug",
        LogLevel::LogWarn => "warn",
        LogLevel::LogError => "error",
    };
    eprintln!("[heapscope] {tag}: {args}");
}

#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::log_impl($level, format_args!($($arg)*))
    };
}
