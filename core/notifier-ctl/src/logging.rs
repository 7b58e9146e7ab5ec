//! Logging for the CLI: human-readable stderr plus a daily rolling file under
//! `~/.chat-notifier/logs/`.
//!
//! Stdout is reserved for command output.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "notifier-ctl.log";

/// Installs the global subscriber. Keep the guard alive for the whole process
/// or buffered file output is lost.
pub fn init() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let file = chat_notifier_core::config::log_dir()
        .ok()
        .filter(|dir| fs_err::create_dir_all(dir).is_ok())
        .map(|dir| tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_NAME)));

    match file {
        Some((writer, guard)) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .try_init();
            None
        }
    }
}
