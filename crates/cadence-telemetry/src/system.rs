//! Subscriber bootstrap

use crate::{
    config::{LogFormat, TelemetryConfig},
    Error, Result,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Installs the global `tracing` subscriber.
pub struct TelemetrySystem;

/// Keeps the non-blocking file writer alive. Dropping it flushes
/// buffered log lines.
pub struct TelemetryGuard {
    _file_guard: Option<WorkerGuard>,
}

impl TelemetrySystem {
    /// Initialize the telemetry system with the given configuration
    pub fn init(config: TelemetryConfig) -> Result<TelemetryGuard> {
        config.validate()?;

        let mut layers: Vec<BoxedLayer> = Vec::new();
        if let Some(console) = Self::build_console_layer(&config) {
            layers.push(console);
        }
        let file_guard = match Self::build_file_layer(&config) {
            Some((layer, guard)) => {
                layers.push(layer);
                Some(guard)
            }
            None => None,
        };

        tracing_subscriber::registry()
            .with(layers)
            .with(Self::build_env_filter(&config))
            .try_init()
            .map_err(|e| Error::System {
                message: format!("Failed to initialize tracing subscriber: {}", e),
            })?;

        tracing::debug!(
            telemetry.event = "system_initialized",
            telemetry.version = env!("CARGO_PKG_VERSION"),
            level = %config.logging.level,
            file_logging = config.logging.file_enabled,
            "Telemetry initialized"
        );

        Ok(TelemetryGuard {
            _file_guard: file_guard,
        })
    }

    /// Build environment filter for log level filtering. `RUST_LOG` wins
    /// over the configured level.
    pub fn build_env_filter(config: &TelemetryConfig) -> EnvFilter {
        if let Ok(env_filter) = EnvFilter::try_from_default_env() {
            return env_filter;
        }

        if !config.enabled {
            return EnvFilter::new("off");
        }

        let mut filter = EnvFilter::new(config.logging.level.to_string());
        for directive in ["hyper=warn", "reqwest=warn", "h2=warn"] {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }
        filter
    }

    fn build_console_layer(config: &TelemetryConfig) -> Option<BoxedLayer> {
        if !config.enabled || !config.logging.console_enabled {
            return None;
        }

        let logging = &config.logging;
        let layer = match logging.format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .with_span_list(false)
                .with_target(true)
                .with_file(logging.include_location)
                .with_line_number(logging.include_location)
                .with_thread_ids(logging.include_thread_ids)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(logging.include_location)
                .with_line_number(logging.include_location)
                .with_thread_ids(logging.include_thread_ids)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_file(logging.include_location)
                .with_line_number(logging.include_location)
                .with_thread_ids(logging.include_thread_ids)
                .boxed(),
        };

        Some(layer)
    }

    fn build_file_layer(config: &TelemetryConfig) -> Option<(BoxedLayer, WorkerGuard)> {
        if !config.enabled || !config.logging.file_enabled {
            return None;
        }

        let logging = &config.logging;
        let appender =
            tracing_appender::rolling::daily(&logging.log_dir, &logging.log_file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let layer = match logging.format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_current_span(true)
                .with_span_list(false)
                .with_target(true)
                .with_file(logging.include_location)
                .with_line_number(logging.include_location)
                .boxed(),
            LogFormat::Pretty | LogFormat::Compact => fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_file(logging.include_location)
                .with_line_number(logging.include_location)
                .boxed(),
        };

        Some((layer, guard))
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::debug!(
            telemetry.event = "system_shutdown",
            "Telemetry system shutting down"
        );
    }
}
