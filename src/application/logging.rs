use std::env;

use tracing_appender::non_blocking::WorkerGuard;

/// Debug logging to a rolling file, enabled when `RUST_LOG` mentions this
/// crate. The returned guard must be held for the lifetime of the process or
/// buffered lines are lost.
pub fn init(log_dir: &str) -> Option<WorkerGuard> {
    if !env::var("RUST_LOG")
        .unwrap_or_else(|_| return "".to_string())
        .contains("confab")
    {
        return None;
    }

    let file_appender = tracing_appender::rolling::never(log_dir, "debug.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .json()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(writer)
        .init();

    return Some(guard);
}
