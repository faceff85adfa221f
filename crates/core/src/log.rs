use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogFormat;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

fn build_env_filter_from(tgrelay_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new("info");

    if let Some(v) = tgrelay_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    if let Some(v) = rust_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    default()
}

fn build_env_filter() -> EnvFilter {
    build_env_filter_from(
        std::env::var("TGRELAY_LOG").ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    )
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init_logging(format: LogFormat) {
    TRACING_INIT.get_or_init(|| {
        let env_filter = build_env_filter();
        let timer = tracing_subscriber::fmt::time::UtcTime::rfc_3339();

        let _ = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_timer(timer))
                .try_init(),
            LogFormat::Text => tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_timer(timer))
                .try_init(),
        };
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_filter_precedence_is_tgrelay_then_rust_log_then_default() {
        let f1 = build_env_filter_from(Some("debug"), Some("warn"));
        let f2 = build_env_filter_from(None, Some("warn"));
        let f3 = build_env_filter_from(None, None);

        assert_eq!(f1.to_string(), "debug");
        assert_eq!(f2.to_string(), "warn");
        assert_eq!(f3.to_string(), "info");
    }

    #[test]
    fn invalid_filter_falls_back_to_default() {
        let f = build_env_filter_from(Some("not a [valid filter"), None);
        assert_eq!(f.to_string(), "info");
    }

    #[test]
    fn init_is_idempotent() {
        init_logging(LogFormat::Json);
        init_logging(LogFormat::Text);
        tracing::info!(event = "test.log", "test.log");
    }
}
