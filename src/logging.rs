use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use flexi_logger::{Cleanup, Criterion, DeferredNow, Duplicate, FileSpec, Naming, WriteMode};
use log::Record;

use crate::config::Logger;

/// Starts the process-wide logger: stdout by default, with optional
/// size-rotated file output. Warnings and errors are mirrored to stderr
/// so they survive stdout redirection under a process supervisor.
pub fn init(config: &Logger, verbose: bool) -> Result<()> {
    let spec = if verbose {
        "debug"
    } else {
        level_spec(&config.level)
    };

    let mut logger = flexi_logger::Logger::try_with_str(spec)
        .context("init logger")?
        .format(render)
        .duplicate_to_stderr(Duplicate::Warn);

    if !config.path.trim().is_empty() {
        logger = logger
            .log_to_file(FileSpec::try_from(Path::new(&config.path))?)
            .write_mode(WriteMode::BufferAndFlush);
        if config.max_size > 0 {
            let cleanup = if config.max_backups > 0 {
                Cleanup::KeepLogFiles(config.max_backups as usize)
            } else {
                Cleanup::Never
            };
            logger = logger.rotate(
                Criterion::Size(config.max_size * 1024 * 1024),
                Naming::Numbers,
                cleanup,
            );
        }
    }

    logger.start()?;
    Ok(())
}

fn level_spec(raw: &str) -> &'static str {
    match raw.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

// One line per record: UTC timestamp, level, emitting module, message.
// The module path is what distinguishes engine, backend, and server
// lines when a request fans out.
fn render(w: &mut dyn Write, now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
    writeln!(
        w,
        "{} {:<5} {}: {}",
        now.now_utc_owned().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        record.level().as_str().to_ascii_lowercase(),
        record.module_path().unwrap_or("chronocache"),
        record.args()
    )
}
