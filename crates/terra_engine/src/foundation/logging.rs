//! Logging utilities

pub use log::{debug, error, info, trace, warn};

/// Initialize the logging system
///
/// `default_level` is used unless `RUST_LOG` is set. Repeated calls are ignored,
/// which lets tests and tools initialize logging unconditionally.
pub fn init(default_level: &str) {
    let env = env_logger::Env::default().default_filter_or(default_level);
    let _ = env_logger::Builder::from_env(env)
        .is_test(cfg!(test))
        .try_init();
}
