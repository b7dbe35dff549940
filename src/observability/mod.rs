//! Observability
//!
//! Tracing setup for the node binary. Libraries in this crate only emit
//! `tracing` events; installing a subscriber is the binary's job.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | RUST_LOG | info | `EnvFilter` directives |
//! | VCR_LOG_FORMAT | text | text or json |

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    /// Read `VCR_LOG_FORMAT`; anything other than "json" means text
    pub fn from_env() -> Self {
        Self::parse(std::env::var("VCR_LOG_FORMAT").ok().as_deref())
    }

    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Install the global subscriber
pub fn init_tracing(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
}
