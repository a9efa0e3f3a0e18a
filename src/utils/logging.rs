//! Logging for the capture hot path.
//!
//! The loop and drain log once per window or teardown, which is still noisy
//! with many cameras. Modules on that path declare a local switch and log
//! through these macros so the chatter can be silenced per module:
//!
//! ```ignore
//! const ENABLE_LOGS: bool = true;
//! use crate::{log_info, log_warn};
//!
//! log_info!("window closed: {:?}", written);
//! ```
//!
//! Everything else uses the `log` macros directly. The binary installs
//! `env_logger` through [`init`].

/// Install the process-wide logger. `RUST_LOG` overrides the `info` default.
/// Later calls are ignored.
pub fn init() {
    let _ = env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .try_init();
}

/// `log::info!` gated by the calling module's `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

/// `log::warn!` gated by the calling module's `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

/// `log::error!` gated by the calling module's `ENABLE_LOGS`.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}
