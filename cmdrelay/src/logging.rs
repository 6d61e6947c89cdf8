//! # Logging Initialization
//!
//! [`init_logging`] installs the global `tracing` subscriber once per process.
//!
//! - **Filter**: `RUST_LOG` when set, otherwise the given level for
//!   dependencies and `debug` for this crate, so per-line relay output and
//!   request phases are visible by default.
//! - **File (opt-in)**: with `log_to_file`, a daily rolling file in the user
//!   cache directory (via `directories`), written through a non-blocking
//!   `tracing_appender` worker. ANSI colors are disabled there.
//! - **Stderr**: the default, and the fallback when the cache directory is
//!   missing or not writable.
//! - **OpenTelemetry**: with the `opentelemetry` feature, spans are also
//!   exported over OTLP/HTTP when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use anyhow::Result;
use directories::ProjectDirs;
#[cfg(feature = "opentelemetry")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "opentelemetry")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "opentelemetry")]
use opentelemetry_sdk::{
    Resource,
    trace::{self as sdktrace, SdkTracerProvider},
};
use std::{io::stderr, path::Path, sync::Once};
use tracing_subscriber::{EnvFilter, fmt::layer, prelude::*};

static INIT: Once = Once::new();

const LOG_FILE_PREFIX: &str = "cmdrelay.log";

/// Initializes the global subscriber. Later calls are no-ops.
pub fn init_logging(log_level: &str, log_to_file: bool) -> Result<()> {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{log_level},cmdrelay=debug")));

        if log_to_file
            && let Some(proj_dirs) = ProjectDirs::from("com", "Cmdrelay", "cmdrelay")
            && can_write(proj_dirs.cache_dir())
        {
            // rolling::daily panics on an unwritable directory.
            let file_appender =
                tracing_appender::rolling::daily(proj_dirs.cache_dir(), LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(layer().with_writer(non_blocking).with_ansi(false));

            #[cfg(feature = "opentelemetry")]
            let subscriber = subscriber.with(init_otel());

            subscriber.init();
            // Flushes on drop; must live as long as the process.
            Box::leak(Box::new(guard));
            return;
        }

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(layer().with_writer(stderr).with_ansi(true));

        #[cfg(feature = "opentelemetry")]
        let subscriber = subscriber.with(init_otel());

        subscriber.init();
    });

    Ok(())
}

#[cfg(feature = "opentelemetry")]
fn init_otel<S>() -> Option<tracing_opentelemetry::OpenTelemetryLayer<S, sdktrace::Tracer>>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(format!("{}/v1/traces", endpoint.trim_end_matches('/')))
        .build()
        .ok()?;

    let resource = Resource::builder().with_service_name("cmdrelay").build();
    let provider = SdkTracerProvider::builder()
        .with_resource(resource)
        .with_batch_exporter(exporter)
        .build();

    Some(tracing_opentelemetry::layer().with_tracer(provider.tracer("cmdrelay")))
}

/// Creates `dir` if needed and checks that a file can be written in it.
fn can_write(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let marker = dir.join(".cmdrelay_write_check");
    match std::fs::write(&marker, b"ok") {
        Ok(()) => {
            let _ = std::fs::remove_file(&marker);
            true
        }
        Err(_) => false,
    }
}
