//! Tracing setup.
//!
//! `RUST_LOG` overrides the default `clarify=info` directive. Telemetry records
//! for each chat turn are logged on the [`TELEMETRY_TARGET`] target so they
//! can be filtered or routed on their own.

use tracing_subscriber::filter::{Directive, EnvFilter};

pub const TELEMETRY_TARGET: &str = "clarify::telemetry";

const DEFAULT_DIRECTIVE: &str = "clarify=info";

/// Installs the global fmt subscriber. Safe to call more than once.
pub fn init() {
    let filter = EnvFilter::builder()
        .with_default_directive(default_directive())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

fn default_directive() -> Directive {
    match DEFAULT_DIRECTIVE.parse() {
        Ok(directive) => directive,
        Err(_) => tracing::Level::INFO.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directive_parses() {
        assert_eq!(default_directive().to_string(), DEFAULT_DIRECTIVE);
    }

    #[test]
    fn init_twice_does_not_panic() {
        init();
        init();
    }
}
