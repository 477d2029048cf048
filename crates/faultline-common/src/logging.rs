//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Tracing setup: stderr console plus a daily JSON fault timeline."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "FAULTLINE_LOG";
const DEFAULT_DIRECTIVE: &str = "info,faultline=debug";

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
static CONSOLE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Console format for chaos runs. The fault timeline file is always JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// `FAULTLINE_LOG`, then `RUST_LOG`, then injector debug output over info elsewhere.
fn env_filter() -> EnvFilter {
    if let Ok(directive) = std::env::var(LOG_ENV) {
        match EnvFilter::try_new(&directive) {
            Ok(filter) => return filter,
            Err(err) => eprintln!("ignoring invalid {LOG_ENV} directive {directive:?}: {err}"),
        }
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Install the global subscriber for a chaos run.
///
/// Console output goes to stderr so a driver's stdout stays free for its
/// report. Every event is also appended to `<directory>/<prefix>-<service>.log`,
/// rotated daily, so the injected/removed timeline can be lined up with the
/// monitored system afterwards. Calling this twice keeps the first subscriber.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let prefix = config.file_prefix.as_deref().unwrap_or("faultline");
    let (file_writer, file_guard) = tracing_appender::non_blocking(daily(
        &config.directory,
        format!("{prefix}-{service_name}.log"),
    ));
    let (console_writer, console_guard) = tracing_appender::non_blocking(std::io::stderr());

    let console = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(console_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(console_writer)
            .boxed(),
    };
    let timeline = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .boxed();

    let installed = tracing_subscriber::registry()
        .with(env_filter())
        .with(console)
        .with(timeline)
        .try_init()
        .is_ok();
    if installed {
        let _ = FILE_GUARD.set(file_guard);
        let _ = CONSOLE_GUARD.set(console_guard);
        info!(service = %service_name, log_dir = %config.directory.display(), format = ?config.format, "tracing initialised");
    }
    Ok(())
}

/// Test-writer subscriber; safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_test_writer())
        .try_init();
}
