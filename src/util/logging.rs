//! Standardized logging utility for Tenaya
//!
//! This module provides the `tlog!` macro which ensures early-boot
//! messages (before the tracing subscriber is up) follow the
//! `YYYY-MM-DD HH:MM:SS [MODULE] Message` format.

#[macro_export]
macro_rules! tlog {
    ($module:expr, $($arg:tt)*) => {{
        let now = chrono::Local::now();
        eprintln!("{} [{}] {}",
            now.format("%Y-%m-%d %H:%M:%S"),
            $module,
            format!($($arg)*)
        );
    }};
}

/// Standardized module identifiers
pub const MAIN: &str = "MAIN";
