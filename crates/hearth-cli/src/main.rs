mod bootstrap;

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::Parser;
use hearth_host::{ConfigError, Platform, ProcessConfig};
use hearth_runner::{INTERNAL_ERROR, INVALID_CONFIGURATION, RunDriver, Termination};
use tracing::{error, info};

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Entry module (.wasm or .wat)
    entry: PathBuf,

    /// Arguments passed through to the entry module
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Configuration file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of thread-pool workers
    #[arg(long)]
    thread_pool_size: Option<usize>,

    /// Abort instead of continuing after an uncaught exception
    #[arg(long)]
    abort_on_uncaught_exception: bool,

    /// Enables debug logging (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    /// Also write logs to the data directory
    #[arg(long)]
    log_file: bool,
}

impl Cli {
    fn exec_argv(&self) -> Vec<String> {
        let mut exec_argv = Vec::new();
        if let Some(size) = self.thread_pool_size {
            exec_argv.push(format!("--thread-pool-size={}", size));
        }
        if self.abort_on_uncaught_exception {
            exec_argv.push("--abort-on-uncaught-exception".to_string());
        }
        exec_argv
    }
}

fn load_config(cli: &Cli) -> Result<ProcessConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => ProcessConfig::load_from(path)?,
        None => match ProcessConfig::load() {
            Ok(config) => config,
            Err(ConfigError::NotFound) => ProcessConfig::default(),
            Err(e) => return Err(e),
        },
    };

    if let Some(size) = cli.thread_pool_size {
        config.thread_pool_size = size;
    }
    if cli.abort_on_uncaught_exception {
        config.abort_on_uncaught_exception = true;
    }
    if cli.log_file {
        config.logging.file_logging = true;
    }
    match cli.debug {
        0 => {}
        1 => config.logging.filter = "debug".to_string(),
        _ => config.logging.filter = "trace".to_string(),
    }

    config.validate()?;
    Ok(config)
}

fn run(cli: Cli, config: ProcessConfig) -> anyhow::Result<Termination> {
    let platform = Platform::new(config).context("Failed to initialize platform")?;
    let wasm = bootstrap::wasm_loader(&platform, &cli.entry)?;

    let mut argv = vec![cli.entry.display().to_string()];
    argv.extend(cli.args.iter().cloned());
    let exec_argv = cli.exec_argv();

    let report = RunDriver::new(platform.clone()).run(move |platform| {
        bootstrap::create_context(platform, wasm, argv, exec_argv)
    });
    info!(
        "Finished after {} before-exit passes ({} work items abandoned)",
        report.before_exit_passes, report.abandoned_work
    );

    platform.dispose();
    Ok(report.termination)
}

fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("hearth: invalid configuration: {}", e);
            process::exit(INVALID_CONFIGURATION);
        }
    };

    let guard = match hearth_runner::logging::init_logging("hearth", &config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("hearth: failed to initialize logging: {}", e);
            process::exit(INTERNAL_ERROR);
        }
    };

    info!("Starting hearth with {}", cli.entry.display());

    match run(cli, config) {
        Ok(Termination::Exited(code)) => {
            drop(guard);
            process::exit(code);
        }
        Ok(Termination::Aborted(e)) => {
            error!("Aborting: {}", e);
            drop(guard);
            process::abort();
        }
        Err(e) => {
            error!("{:#}", e);
            drop(guard);
            process::exit(INTERNAL_ERROR);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("hearth").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "thread_pool_size = 2\n").unwrap();
        let path = path.display().to_string();

        let cli = parse(&[
            "--config",
            &path,
            "--thread-pool-size",
            "8",
            "-dd",
            "entry.wasm",
            "input.txt",
            "--flag",
        ]);
        assert_eq!(cli.args, vec!["input.txt", "--flag"]);

        let config = load_config(&cli).unwrap();
        assert_eq!(config.thread_pool_size, 8);
        assert_eq!(config.logging.filter, "trace");
        assert_eq!(cli.exec_argv(), vec!["--thread-pool-size=8"]);
    }

    #[test]
    fn test_invalid_pool_size_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "").unwrap();
        let path = path.display().to_string();

        let cli = parse(&["--config", &path, "--thread-pool-size", "0", "entry.wasm"]);
        assert!(matches!(load_config(&cli), Err(ConfigError::Invalid(_))));
    }
}
