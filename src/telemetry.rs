//! tracing initialization for binaries and tests.
//!
//! The library only emits events; installing a subscriber is the
//! application's call. This helper wires up the usual one: an `EnvFilter`
//! whose default level follows a verbosity knob and can be overridden
//! through the `LOG` environment variable, writing compact lines to
//! stderr.

use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install the default subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var("LOG")
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level_from_verbosity(0), LevelFilter::ERROR);
        assert_eq!(level_from_verbosity(1), LevelFilter::INFO);
        assert_eq!(level_from_verbosity(2), LevelFilter::DEBUG);
        assert_eq!(level_from_verbosity(9), LevelFilter::DEBUG);
    }

    #[test]
    fn repeated_init_does_not_panic() {
        init(0);
        init(2);
    }
}
