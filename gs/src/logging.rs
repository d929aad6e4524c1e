//! Tracing subscriber setup

use std::fs;
use std::path::Path;

use eyre::{Context, Result, eyre};
use tracing::{Level, debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Parse a level name; unknown names fall back to INFO
pub fn parse_level(level: Option<&str>) -> Level {
    let Some(s) = level else {
        return Level::INFO;
    };
    match s.to_uppercase().as_str() {
        "TRACE" => Level::TRACE,
        "DEBUG" => Level::DEBUG,
        "INFO" => Level::INFO,
        "WARN" | "WARNING" => Level::WARN,
        "ERROR" => Level::ERROR,
        _ => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
            Level::INFO
        }
    }
}

/// Install the global fmt subscriber
///
/// Logs go to `log_file` when given (parent directories are created), else to
/// stderr. `RUST_LOG` directives are honoured on top of `level`.
pub fn init_logging(level: Option<&str>, log_file: Option<&Path>) -> Result<()> {
    let level = parse_level(level);

    let writer = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).context("Failed to create log directory")?;
            }
            let file = fs::File::create(path).context("Failed to create log file")?;
            BoxMakeWriter::new(file)
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_ansi(log_file.is_none())
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .try_init()
        .map_err(|e| eyre!("Failed to install subscriber: {}", e))?;

    info!("Logging initialized (level: {:?})", level);
    debug!(?log_file, "init_logging: done");
    Ok(())
}
