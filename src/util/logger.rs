//! This module provides a built-in logger implementation.
//!
//! The built-in logger implementation uses the `env_logger` crate. It is
//! enabled by the Cargo feature "builtin_env_logger" which is enabled by
//! default. When enabled, it is initialized in
//! [`crate::memory_manager::svrc_init`] and shows logs of levels INFO or
//! lower. Runtimes that integrate SVRC into an existing logging setup can
//! disable the feature and register their own implementation with the
//! `log` crate.

cfg_if::cfg_if! {
    if #[cfg(feature = "builtin_env_logger")] {
        /// Attempt to init an env_logger for SVRC.
        pub(crate) fn try_init() {
            let result = env_logger::try_init_from_env(
                // By default, show info level logging.
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            );

            match result {
                Ok(()) => {
                    debug!("SVRC initialized the logger.");
                }
                Err(e) => {
                    // `log::SetLoggerError` is only raised when a logger
                    // has already been installed.
                    debug!("SVRC failed to initialize the built-in env_logger: {e}");
                }
            }
        }
    } else {
        /// Does nothing: the "builtin_env_logger" feature is disabled and
        /// the binding owns logger registration.
        pub(crate) fn try_init() {
            debug!("SVRC didn't initialize the built-in env_logger.");
        }
    }
}
