//! Tracing setup: optional console output plus an optional rolling file
//! under the configured log directory.

use crate::domain::settings::LogSettings;
use std::str::FromStr;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

/// Keeps the file writer alive; pending lines are flushed on drop.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

fn rotation(name: &str) -> Rotation {
    match name.to_lowercase().as_str() {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

/// `RUST_LOG` wins over the configured level; an unparsable level falls
/// back to `info`.
fn level_filter(settings: &LogSettings) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::from_str(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn formatted<S, W>(settings: &LogSettings, writer: W, ansi: bool) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_file(settings.show_file_line)
        .with_line_number(settings.show_file_line)
        .with_thread_ids(settings.show_thread_ids)
        .with_target(settings.show_target)
}

/// Install the global subscriber for the fleet manager.
pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let console = settings
        .console_logging_enabled
        .then(|| formatted(settings, std::io::stdout, settings.ansi_colors));

    let mut file_guard = None;
    let file = if settings.file_logging_enabled {
        std::fs::create_dir_all(&settings.log_dir)?;
        let appender = RollingFileAppender::new(
            rotation(&settings.rotation),
            &settings.log_dir,
            &settings.file_name_prefix,
        );
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);
        Some(formatted(settings, writer, false))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(level_filter(settings))
        .with(console)
        .with(file)
        .try_init()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        level = %settings.level,
        log_dir = %settings.log_dir,
        rotation = %settings.rotation,
        "Wearable fleet manager logging ready"
    );
    Ok(LoggingGuard { _file: file_guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_names() {
        assert_eq!(rotation("Hourly"), Rotation::HOURLY);
        assert_eq!(rotation("never"), Rotation::NEVER);
        assert_eq!(rotation("weekly"), Rotation::DAILY);
    }

    #[test]
    fn test_file_log_carries_startup_line() {
        // An inherited RUST_LOG may filter the line out
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let dir = std::env::temp_dir().join(format!("wearable_fleet_logs_{}", std::process::id()));
        let settings = LogSettings {
            console_logging_enabled: false,
            log_dir: dir.to_string_lossy().into_owned(),
            rotation: "never".to_string(),
            ..LogSettings::default()
        };
        let guard = init_logger(&settings).unwrap();
        drop(guard);

        let written: String = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|entry| std::fs::read_to_string(entry.ok()?.path()).ok())
            .collect();
        assert!(written.contains("Wearable fleet manager logging ready"));
        assert!(written.contains(env!("CARGO_PKG_VERSION")));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
