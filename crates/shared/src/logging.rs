use crate::config::LogFormat;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset. mDNS chatter stays at warn.
fn default_filter(format: LogFormat) -> &'static str {
    match format {
        LogFormat::Json => "info,mdns_sd=warn",
        LogFormat::Pretty => "debug,mdns_sd=warn",
    }
}

/// Install the global subscriber for the chosen output format.
///
/// Fails if a subscriber is already installed or `RUST_LOG` does not parse.
pub fn init_logging(format: LogFormat) -> anyhow::Result<()> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) => EnvFilter::try_new(directives)?,
        Err(_) => EnvFilter::try_new(default_filter(format))?,
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(layer.with_thread_ids(true).json())
            .try_init()?,
        LogFormat::Pretty => registry.with(layer.pretty()).try_init()?,
    }

    tracing::info!(?format, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_quiets_mdns() {
        assert_eq!(default_filter(LogFormat::Json), "info,mdns_sd=warn");
        assert!(default_filter(LogFormat::Pretty).starts_with("debug"));
        assert!(default_filter(LogFormat::Pretty).ends_with("mdns_sd=warn"));
    }

    #[test]
    fn test_second_init_is_rejected() {
        let _ = init_logging(LogFormat::Pretty);
        assert!(init_logging(LogFormat::Json).is_err());
    }
}
