use std::io::Write;

use chrono::Local;
use env_logger::{Builder, Env};
use log::LevelFilter;

/// Installs the process logger. `RUST_LOG` takes precedence over `level`.
pub fn init(level: LevelFilter) {
    let default_filter = level.to_string().to_lowercase();
    let result = Builder::from_env(Env::default().default_filter_or(default_filter))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();

    match result {
        Ok(()) => log::info!("Logging initialized at {}", level),
        // Already installed, e.g. by a test harness.
        Err(e) => log::debug!("Logger not replaced: {}", e),
    }
}
