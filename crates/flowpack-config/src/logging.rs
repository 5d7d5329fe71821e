//! Structured logging utilities for flowpack components.
//!
//! Provides consistent logging with component prefixes and structured
//! fields.
//!
//! ```ignore
//! use flowpack_config::logging::*;
//!
//! log_pack_info!("opened output file", path = %display_path);
//! log_append_warn!("hourly lock contended", basename = %name);
//! ```

/// Component identifiers for log filtering.
pub struct Component;

impl Component {
    pub const PACK: &'static str = "PACK";
    pub const APPEND: &'static str = "APPEND";
    pub const INGEST: &'static str = "INGEST";
    pub const CACHE: &'static str = "CACHE";
    pub const DISPOSE: &'static str = "DISPOSE";
}

/// Log levels for runtime configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

// === PACK logging macros ===

// Field values are forwarded as raw token trees rather than `expr`
// fragments so callers can use tracing's `%`/`?` sigils (`error = %e`),
// which aren't valid standalone Rust expressions and so can't be
// captured by an `expr` matcher.

#[macro_export]
macro_rules! log_pack_error {
    ($msg:literal $(, $($rest:tt)*)?) => {
        tracing::error!(component = "PACK", $($($rest)*,)? $msg)
    };
}

#[macro_export]
macro_rules! log_pack_warn {
    ($msg:literal $(, $($rest:tt)*)?) => {
        tracing::warn!(component = "PACK", $($($rest)*,)? $msg)
    };
}

#[macro_export]
macro_rules! log_pack_info {
    ($msg:literal $(, $($rest:tt)*)?) => {
        tracing::info!(component = "PACK", $($($rest)*,)? $msg)
    };
}

// === APPEND logging macros ===

#[macro_export]
macro_rules! log_append_error {
    ($msg:literal $(, $($rest:tt)*)?) => {
        tracing::error!(component = "APPEND", $($($rest)*,)? $msg)
    };
}

#[macro_export]
macro_rules! log_append_warn {
    ($msg:literal $(, $($rest:tt)*)?) => {
        tracing::warn!(component = "APPEND", $($($rest)*,)? $msg)
    };
}

#[macro_export]
macro_rules! log_append_info {
    ($msg:literal $(, $($rest:tt)*)?) => {
        tracing::info!(component = "APPEND", $($($rest)*,)? $msg)
    };
}

// === INGEST logging macros ===

#[macro_export]
macro_rules! log_ingest_warn {
    ($msg:literal $(, $($rest:tt)*)?) => {
        tracing::warn!(component = "INGEST", $($($rest)*,)? $msg)
    };
}

#[macro_export]
macro_rules! log_ingest_debug {
    ($msg:literal $(, $($rest:tt)*)?) => {
        tracing::debug!(component = "INGEST", $($($rest)*,)? $msg)
    };
}

// === CACHE logging macros ===

#[macro_export]
macro_rules! log_cache_debug {
    ($msg:literal $(, $($rest:tt)*)?) => {
        tracing::debug!(component = "CACHE", $($($rest)*,)? $msg)
    };
}

// === DISPOSE logging macros ===

#[macro_export]
macro_rules! log_dispose_warn {
    ($msg:literal $(, $($rest:tt)*)?) => {
        tracing::warn!(component = "DISPOSE", $($($rest)*,)? $msg)
    };
}

/// Initialize logging with the given level filter. Call once at binary
/// startup; `FLOWPACK_LOG` in the environment overrides the level.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let filter = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env_filter =
        EnvFilter::try_from_env("FLOWPACK_LOG").unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_constants() {
        assert_eq!(Component::PACK, "PACK");
        assert_eq!(Component::APPEND, "APPEND");
        assert_eq!(Component::INGEST, "INGEST");
    }
}
