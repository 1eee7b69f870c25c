use chrono::Local;
use std::io;
use tracing_appender::rolling;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

/// Initialize the tracing system.
///
/// Logging level is controlled by the RUST_LOG environment variable. Logs go
/// to stdout; set BOSUN_LOG_DIR to write to a timestamped file instead.
pub fn init_tracing() -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bosun=debug"));

    if let Ok(log_dir) = std::env::var("BOSUN_LOG_DIR") {
        std::fs::create_dir_all(&log_dir)?;
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let file_appender = rolling::never(&log_dir, format!("{timestamp}.log"));

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::Layer::new()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(filter);

        tracing::subscriber::set_global_default(subscriber)
            .expect("Failed to set global default subscriber");
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(fmt::Layer::default().with_ansi(true).with_target(true))
            .with(filter);

        tracing::subscriber::set_global_default(subscriber)
            .expect("Failed to set global default subscriber");
    }

    Ok(())
}
