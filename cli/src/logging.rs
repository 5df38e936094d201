use std::env;
use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding a tracing filter such as `backsort_engine=debug`.
pub const LOG_ENV: &str = "BACKSORT_LOG";

/// Route engine diagnostics to stderr and, with a log dir, to a per-run
/// `run_<YYYYmmdd_HHMMSS>.log` file. `BACKSORT_LOG` wins over `--verbose`.
///
/// The returned guard flushes the file on drop; keep it alive for the run.
pub fn init_logger(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let override_filter = env::var(LOG_ENV).ok();
    let filter = |default: &str| {
        override_filter
            .as_deref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(default))
    };

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(filter(if verbose { "debug" } else { "warn" }));

    let (file_layer, guard) = match log_dir.map(open_run_log) {
        Some(Ok(appender)) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter(if verbose { "debug" } else { "info" }));
            (Some(layer), Some(guard))
        }
        Some(Err(msg)) => {
            eprintln!("Warning: {}", msg);
            (None, None)
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    guard
}

fn open_run_log(dir: &Path) -> Result<RollingFileAppender, String> {
    fs::create_dir_all(dir).map_err(|e| format!("cannot create log dir {}: {}", dir.display(), e))?;
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");

    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(format!("run_{}", stamp))
        .filename_suffix("log")
        .build(dir)
        .map_err(|e| format!("cannot open run log in {}: {}", dir.display(), e))
}
