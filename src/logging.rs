//! Log subscriber construction
//!
//! The library never installs a global subscriber. Callers build a
//! [`Dispatch`] here and hand it to [`crate::analyze::Analyzer`], which runs
//! its work under it.

use tracing::Dispatch;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Filter directive for a `-v` count.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "precedent=warn",
        1 => "precedent=info",
        2 => "precedent=debug",
        _ => "precedent=trace",
    }
}

/// Stderr subscriber. `RUST_LOG` wins unless `-v` was given.
pub fn build_dispatch(verbosity: u8) -> Dispatch {
    let filter = if verbosity == 0 {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(0)))
    } else {
        EnvFilter::new(default_directive(verbosity))
    };
    Dispatch::new(
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .finish(),
    )
}

/// Subscriber writing to `make_writer`, filtered by `directive`.
pub fn dispatch_with_writer<W>(directive: &str, make_writer: W) -> Dispatch
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new(default_directive(0)));
    Dispatch::new(
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(make_writer)
            .with_ansi(false)
            .with_target(false)
            .finish(),
    )
}

/// A dispatcher that drops everything.
pub fn silent() -> Dispatch {
    Dispatch::none()
}
