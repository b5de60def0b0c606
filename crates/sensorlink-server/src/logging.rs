//! Logging initialization.
//!
//! - **Production**: JSON to daily rolling files plus compact stdout for journald
//! - **Development**: pretty stdout with span open/close events
//!
//! The filter comes from `RUST_LOG` when set, else `SENSORLINK_LOG_LEVEL`,
//! else `info`. Wire traffic is logged at `debug` under `sensorlink_core`.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the default filter directive.
pub const LOG_LEVEL_VAR: &str = "SENSORLINK_LOG_LEVEL";
/// Environment variable overriding the production log directory.
pub const LOG_DIR_VAR: &str = "SENSORLINK_LOG_DIR";

/// Writer guards; dropping them loses buffered lines.
static GUARDS: OnceLock<(WorkerGuard, WorkerGuard)> = OnceLock::new();

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if the filter directive cannot be parsed or a global
/// subscriber is already installed.
pub fn init(production: bool) -> anyhow::Result<()> {
    let filter = env_filter(std::env::var(LOG_LEVEL_VAR).ok().as_deref())?;
    if production {
        init_production(filter)
    } else {
        init_development(filter)
    }
}

/// `RUST_LOG` wins over `level`; `level` wins over `info`.
fn env_filter(level: Option<&str>) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    Ok(EnvFilter::try_new(level.unwrap_or("info"))?)
}

fn init_production(filter: EnvFilter) -> anyhow::Result<()> {
    let log_dir = log_directory();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "sensorlink");
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer)
                .with_current_span(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(stdout_writer)
                .with_ansi(false),
        )
        .try_init()?;

    let _ = GUARDS.set((file_guard, stdout_guard));
    Ok(())
}

fn init_development(filter: EnvFilter) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE),
        )
        .try_init()?;
    Ok(())
}

/// Production log directory for the current platform.
fn log_directory() -> PathBuf {
    if let Some(dir) = std::env::var_os(LOG_DIR_VAR) {
        return PathBuf::from(dir);
    }
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/sensorlink")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "sensorlink")
            .map_or_else(|| PathBuf::from("./logs"), |dirs| dirs.data_dir().join("logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directory_is_valid_path() {
        assert!(!log_directory().as_os_str().is_empty());
    }

    #[test]
    fn test_filter_accepts_directives() {
        assert!(env_filter(Some("sensorlink_core=debug,info")).is_ok());
        assert!(env_filter(None).is_ok());
    }
}
