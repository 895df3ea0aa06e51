//! Tracing subscriber setup for hosts embedding the gateway.

use crate::config::{LogFormat, TelemetryConfig};
use crate::error::GatewayError;
use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` wins over `TelemetryConfig::filter`. Returns an error instead of
/// panicking when a subscriber is already installed, so hosts that configure
/// their own tracing can call this unconditionally.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), GatewayError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| GatewayError::Telemetry(format!("invalid filter: {}", e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };

    installed.map_err(|e| GatewayError::Telemetry(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_reports_error() {
        let config = TelemetryConfig::default();
        // Another test may already have installed a subscriber; either way the
        // second call must fail cleanly rather than panic.
        let _ = init_tracing(&config);
        assert!(matches!(
            init_tracing(&config),
            Err(GatewayError::Telemetry(_))
        ));
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let config = TelemetryConfig {
            filter: "llm_gateway_core=verbose".to_string(),
            format: LogFormat::Json,
        };
        if std::env::var("RUST_LOG").is_err() {
            assert!(init_tracing(&config).is_err());
        }
    }
}
