//! Subscriber setup with a runtime-switchable verbosity

use once_cell::sync::OnceCell;
use tracing::debug;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, EnvFilter, Registry};

use crate::LoggingConfig;

const VERBOSE: &str = "gigegrab=debug";

struct FilterState {
    base: String,
    handle: reload::Handle<EnvFilter, Registry>,
}

static FILTER: OnceCell<FilterState> = OnceCell::new();

/// Install the global fmt subscriber. `RUST_LOG` overrides the configured
/// filter.
pub fn init(config: &LoggingConfig) -> Result<(), TryInitError> {
    let base = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| config.filter.clone());
    let (filter, handle) = reload::Layer::new(EnvFilter::new(directives(&base, config.verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()))
        .try_init()?;

    let _ = FILTER.set(FilterState { base, handle });
    Ok(())
}

/// Switch between verbose and notice output. No-op before [`init`].
pub fn set_verbose(verbose: bool) {
    let Some(state) = FILTER.get() else {
        return;
    };
    if state
        .handle
        .reload(EnvFilter::new(directives(&state.base, verbose)))
        .is_ok()
    {
        debug!(verbose, "log level changed");
    }
}

fn directives(base: &str, verbose: bool) -> String {
    if !verbose {
        return base.to_string();
    }
    base.split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty() && !d.starts_with("gigegrab"))
        .chain([VERBOSE])
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_raises_crate_level_only() {
        assert_eq!(directives("gigegrab=info", false), "gigegrab=info");
        assert_eq!(
            directives("warn,gigegrab=info", true),
            "warn,gigegrab=debug"
        );
        assert_eq!(directives("", true), "gigegrab=debug");
    }

    #[test]
    fn set_verbose_before_init_is_harmless() {
        set_verbose(true);
        set_verbose(false);
    }
}
