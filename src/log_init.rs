//! This module provides a built-in logger implementation.
//!
//! The built-in logger implementation uses the `env_logger` crate. It is enabled by the Cargo
//! feature "builtin_env_logger", which is enabled by default. When enabled, it is initialized
//! from [`crate::init::init`] and shows logs of level INFO or lower by default.
//!
//! This provides convenient out-of-the-box experience for programs linking this crate so they see
//! logs without configuration, and can configure log levels from the `RUST_LOG` environment
//! variable. A host program that already runs its own logger can disable this Cargo feature and
//! register its own implementation with the `log` crate; `try_init` is a no-op in that case.

/// Attempt to init an env_logger for remotethread. Does nothing if the "builtin_env_logger"
/// feature is disabled, and is a harmless no-op (besides a `debug!`) if a logger is already
/// installed by the host program.
pub(crate) fn try_init() {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            let result = env_logger::try_init_from_env(
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            );

            match result {
                Ok(()) => {
                    debug!("remotethread initialized the logger.");
                }
                Err(e) => {
                    debug!("remotethread failed to initialize the built-in env_logger: {e}");
                }
            }
        } else {
            debug!("remotethread didn't initialize the built-in env_logger. The Cargo feature \"builtin_env_logger\" is not enabled.");
        }
    }
}
