//! Built-in logger setup.
//!
//! The heap only talks to the `log` facade. Embedders that have no logger
//! of their own can call [`try_init`] to get `env_logger` output filtered by
//! `RUST_LOG`, which defaults to `info`. Heap internals log under the
//! `heap` target and collector internals under the `gc` target, so
//! `RUST_LOG=gc=debug` shows every collection.

use log::debug;

/// Attempt to install `env_logger` as the global logger.
pub fn try_init() {
    let result = env_logger::try_init_from_env(
        env_logger::Env::default()
            .filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    match result {
        Ok(()) => debug!(target: "heap", "initialized the logger"),
        // The only failure is a logger that is already installed.
        Err(e) => debug!(target: "heap", "failed to initialize env_logger: {e}"),
    }
}
