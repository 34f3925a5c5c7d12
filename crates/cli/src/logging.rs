use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,hyper=warn,reqwest=warn,tungstenite=warn";

pub struct LoggingHandle {
    pub log_path: PathBuf,
    pub guard: WorkerGuard,
}

/// `STUDYRUN_LOG_DIR`, else `<local data dir>/studyrun/logs`.
fn log_dir(configured: Option<String>) -> PathBuf {
    match configured.filter(|dir| !dir.trim().is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("studyrun")
            .join("logs"),
    }
}

/// JSON lines unless `pretty` is asked for
fn wants_pretty(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.trim().eq_ignore_ascii_case("pretty"))
}

pub fn init_logging() -> anyhow::Result<LoggingHandle> {
    let log_dir = log_dir(std::env::var("STUDYRUN_LOG_DIR").ok());
    std::fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join("studyrun.log");

    let filter = std::env::var("STUDYRUN_LOG_FILTER")
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));

    let file_appender = tracing_appender::rolling::never(&log_dir, "studyrun.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let pretty = wants_pretty(std::env::var("STUDYRUN_LOG_FORMAT").ok().as_deref());

    let registry = tracing_subscriber::registry().with(filter);
    if pretty {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .init();
    }

    let format = if pretty { "pretty" } else { "json" };
    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        log_path = %log_path.display(),
        format,
        filter = %std::env::var("STUDYRUN_LOG_FILTER")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| DEFAULT_FILTER.to_string()),
    );

    Ok(LoggingHandle { log_path, guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_dir_prefers_the_configured_directory() {
        assert_eq!(
            log_dir(Some("/tmp/run-logs".to_string())),
            PathBuf::from("/tmp/run-logs")
        );
        assert!(log_dir(Some("  ".to_string())).ends_with("studyrun/logs"));
        assert!(log_dir(None).ends_with("studyrun/logs"));
    }

    #[test]
    fn json_is_the_default_format() {
        assert!(!wants_pretty(None));
        assert!(!wants_pretty(Some("json")));
        assert!(!wants_pretty(Some("compact")));
        assert!(wants_pretty(Some(" Pretty ")));
    }
}
