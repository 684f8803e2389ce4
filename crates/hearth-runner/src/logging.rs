use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use hearth_host::{LoggingConfig, ProjectPaths};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const MAX_LOG_SIZE: u64 = 1024 * 1024; // 1MB

/// Initialize logging for a component.
///
/// - `component_name`: name of the log file (e.g. "hearth")
/// - `config`: `filter` is used when `RUST_LOG` is unset; `file_logging`
///   adds a file layer next to console output
///
/// Returns a guard that must be kept alive for the duration of the program.
pub fn init_logging(component_name: &str, config: &LoggingConfig) -> io::Result<Option<WorkerGuard>> {
    let env_filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter))
    };

    if config.file_logging {
        let log_dir = get_log_directory()?;
        fs::create_dir_all(&log_dir)?;
        let log_path = log_dir.join(format!("{}.log", component_name));

        let (non_blocking_file, guard) = open_log_file(&log_path)?;

        tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt::layer().with_writer(io::stderr).with_ansi(true))
            .with(
                fmt::layer()
                    .with_writer(non_blocking_file)
                    .with_ansi(false)
                    .with_target(true),
            )
            .try_init()
            .map_err(io::Error::other)?;

        tracing::info!("Logging to file: {}", log_path.display());

        Ok(Some(guard))
    } else {
        // Console-only logging
        tracing_subscriber::fmt()
            .with_writer(io::stderr)
            .with_env_filter(env_filter())
            .try_init()
            .map_err(io::Error::other)?;

        Ok(None)
    }
}

fn open_log_file(
    log_path: &Path,
) -> io::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    truncate_if_needed(log_path)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    Ok(tracing_appender::non_blocking(BufWriter::new(file)))
}

fn get_log_directory() -> io::Result<PathBuf> {
    let proj_paths = ProjectPaths::new("hearth")
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Failed to find home directory"))?;

    Ok(proj_paths.logs_dir())
}

/// Truncate log file if it exceeds MAX_LOG_SIZE.
fn truncate_if_needed(log_path: &Path) -> io::Result<()> {
    if log_path.exists() {
        let metadata = fs::metadata(log_path)?;
        if metadata.len() > MAX_LOG_SIZE {
            let file = File::create(log_path)?;
            file.set_len(0)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_truncates_oversized_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.log");
        let mut file = File::create(&path).unwrap();
        file.write_all(&vec![b'x'; (MAX_LOG_SIZE + 1) as usize]).unwrap();
        drop(file);

        truncate_if_needed(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_keeps_small_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.log");
        fs::write(&path, "line\n").unwrap();

        truncate_if_needed(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "line\n");

        // Missing files are fine
        truncate_if_needed(&dir.path().join("absent.log")).unwrap();
    }
}
