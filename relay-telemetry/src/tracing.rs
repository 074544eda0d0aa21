use std::io;
use std::sync::Once;

use relay_config::Environment;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

/// Directory receiving log files in production.
const LOG_DIRECTORY: &str = "logs";

/// Number of rotated log files kept on disk.
const MAX_LOG_FILES: usize = 5;

const DEFAULT_LOG_FILTER: &str = "info";

/// Environment variable enabling log output in tests.
const ENABLE_TRACING_ENV_NAME: &str = "ENABLE_TRACING";

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to determine the runtime environment: {0}")]
    Environment(#[source] io::Error),

    #[error("failed to create the rolling log file appender: {0}")]
    FileAppender(#[from] tracing_appender::rolling::InitError),

    #[error("failed to bridge `log` records: {0}")]
    LogTracer(#[from] tracing_log::log::SetLoggerError),

    #[error("failed to install the tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

/// Keeps the background log writer alive.
///
/// Buffered lines are flushed when this is dropped, so it must live until the process exits.
#[must_use = "dropping the flusher stops file logging"]
pub struct LogFlusher {
    _guard: Option<WorkerGuard>,
}

/// Installs the global tracing subscriber for `app_name`.
///
/// In `dev` logs are pretty-printed to stdout. In `prod` they are written as JSON lines to a
/// daily rotated file under `logs/`. `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing(app_name: &str) -> Result<LogFlusher, TracingError> {
    let environment = Environment::load().map_err(TracingError::Environment)?;

    // Records emitted through `log` by dependencies are forwarded to tracing.
    tracing_log::LogTracer::init()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if environment.is_prod() {
        let appender = rolling::Builder::new()
            .rotation(Rotation::DAILY)
            .filename_prefix(app_name)
            .filename_suffix("log")
            .max_log_files(MAX_LOG_FILES)
            .build(LOG_DIRECTORY)?;
        let (writer, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(writer),
            )
            .try_init()?;

        return Ok(LogFlusher {
            _guard: Some(guard),
        });
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().pretty())
        .try_init()?;

    Ok(LogFlusher { _guard: None })
}

static INIT_TEST_TRACING: Once = Once::new();

/// Installs a test subscriber once per process when `ENABLE_TRACING` is set.
///
/// Output goes through the test writer so it is captured per test.
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        if std::env::var(ENABLE_TRACING_ENV_NAME).is_err() {
            return;
        }

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}
