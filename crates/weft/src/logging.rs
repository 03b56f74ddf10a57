//! Env-gated diagnostic logging. Silent unless `WEFT_TRACE` is set, so the
//! dispatcher's narration costs nothing in normal operation.

use std::fmt::Arguments;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::env;

fn timestamp_hms() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        % 86_400;
    let hours = secs / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

fn emit(kind: &str, args: Arguments) {
    eprintln!("{} [{kind}] {args}", timestamp_hms());
}

/// Emit a trace message when tracing is enabled.
pub fn emit_trace(args: Arguments) {
    if env::trace_enabled() {
        emit("TRACE", args);
    }
}

/// Emit a warning message when tracing is enabled.
pub fn emit_warning(args: Arguments) {
    if env::trace_enabled() {
        emit("WARNING", args);
    }
}

/// Emit an error message when tracing is enabled.
pub fn emit_error(args: Arguments) {
    if env::trace_enabled() {
        emit("ERROR", args);
    }
}

/// Emit a trace message via the logging subsystem.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::logging::emit_trace(format_args!($($arg)*))
    };
}

/// Emit a warning message via the logging subsystem.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => {
        $crate::logging::emit_warning(format_args!($($arg)*))
    };
}

/// Emit an error message via the logging subsystem.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::emit_error(format_args!($($arg)*))
    };
}
