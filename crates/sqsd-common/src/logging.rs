//! Structured logging setup.
//!
//! - `LOG_FORMAT=json` selects JSON lines for log aggregation
//! - anything else selects human-readable text
//! - `RUST_LOG` overrides the level chosen from the daemon's verbosity flags
//!
//! Runtime error lines carry a `category` field (`http-err`, `socket-err`,
//! `dedup-err`, `expired-msg`, ...) plus the message id and elapsed time when
//! they concern a single message.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Verbosity requested through configuration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
    Debug,
}

impl Verbosity {
    pub fn from_flags(quiet: bool, verbose: bool, debug: bool) -> Self {
        if debug {
            Verbosity::Debug
        } else if verbose {
            Verbosity::Verbose
        } else if quiet {
            Verbosity::Quiet
        } else {
            Verbosity::Normal
        }
    }

    fn default_directive(self) -> &'static str {
        match self {
            Verbosity::Quiet => "warn",
            Verbosity::Normal | Verbosity::Verbose => "info",
            Verbosity::Debug => "debug",
        }
    }
}

/// Install the global subscriber. Safe to call once per process.
pub fn init_logging(service_name: &str, verbosity: Verbosity) {
    let env_filter = build_filter(verbosity);
    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .flatten_event(true),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_ansi(true))
            .try_init()
    };

    if result.is_ok() {
        tracing::debug!(service = service_name, ?verbosity, "Logging initialized");
    }
}

fn build_filter(verbosity: Verbosity) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity.default_directive()))
}
