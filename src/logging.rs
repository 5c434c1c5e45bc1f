//! Log subscriber setup.
//!
//! The pager logs through `tracing`. [`init`] installs a formatting
//! subscriber once per process; later calls, or an application that already
//! installed its own subscriber, leave the existing one in place.

use tracing::Level;

/// Installs a fmt subscriber writing to stderr at `level`. Returns whether
/// this call installed it.
pub fn init(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_names(true)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        init(Level::DEBUG);
        assert!(!init(Level::TRACE));
    }
}
