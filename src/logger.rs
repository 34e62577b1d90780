//! A process-wide logger writing to stderr (and therefore following an
//! `-L` redirect), with records prefixed by level and source location so
//! a failing privileged call can be pinned down. Initialized once,
//! before any privileged call.

use std::env;
use std::io::{stderr, Write};
use std::str::FromStr;

use anyhow::{anyhow, Result};
use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

static SANDBOX_LOGGER: OnceCell<SandboxLogger> = OnceCell::new();

/// `-D` forces debug output; otherwise `NSBOX_LOG_LEVEL` may select a
/// level, defaulting to warnings only.
pub fn init(debug: bool) -> Result<()> {
    let level_filter = if debug {
        LevelFilter::Debug
    } else if let Ok(level) = env::var("NSBOX_LOG_LEVEL") {
        LevelFilter::from_str(&level).unwrap_or(LevelFilter::Warn)
    } else {
        LevelFilter::Warn
    };

    let logger = SANDBOX_LOGGER.get_or_init(|| SandboxLogger::new(level_filter.to_level()));
    log::set_logger(logger)
        .map(|()| log::set_max_level(level_filter))
        .map_err(|e| anyhow!("failed to set logger: {}", e))?;
    Ok(())
}

pub struct SandboxLogger {
    level: Option<log::Level>,
}

impl SandboxLogger {
    fn new(level: Option<log::Level>) -> Self {
        Self { level }
    }
}

impl Log for SandboxLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if let Some(level) = self.level {
            metadata.level() <= level
        } else {
            false
        }
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let msg = match (record.file(), record.line()) {
                (Some(file), Some(line)) => format!(
                    "[{} {}:{}] {}",
                    record.level(),
                    file,
                    line,
                    record.args()
                ),
                (_, _) => format!("[{}] {}", record.level(), record.args()),
            };
            let _ = writeln!(stderr(), "{}", msg);
        }
    }

    fn flush(&self) {
        let _ = stderr().flush();
    }
}
