//! Module-gated logging macros for the long-running workers.
//!
//! Each worker module declares its own switch and then logs through these
//! macros instead of the `log` macros directly:
//! ```ignore
//! const ENABLE_LOGS: bool = true;
//!
//! use crate::{log_debug, log_info};
//!
//! log_info!("tile cache started");
//! ```
//! Flipping the switch to `false` silences a chatty worker (the tile cache
//! under fast scrolling, the probe loop while offline) without touching the
//! `RUST_LOG` filter for the rest of the crate.

/// Conditional `log::debug!`. Requires `ENABLE_LOGS` in the calling module.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!($($arg)*)
        }
    };
}

/// Conditional `log::info!`. Requires `ENABLE_LOGS` in the calling module.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*)
        }
    };
}

/// Conditional `log::warn!`. Requires `ENABLE_LOGS` in the calling module.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*)
        }
    };
}

/// Conditional `log::error!`. Requires `ENABLE_LOGS` in the calling module.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*)
        }
    };
}
