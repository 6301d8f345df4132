use crate::config::WorkerConfig;
use crate::error::ConfigError;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "drudge")]
#[command(about = "Queue message worker", long_about = None)]
pub struct Cli {
    /// Run detached from the terminal, logging only to the logfile
    #[arg(short, long)]
    pub daemon: bool,

    /// Path to YAML config file
    #[arg(short = 'C', long)]
    pub config: Option<PathBuf>,

    /// Path to writable logfile
    #[arg(short = 'L', long)]
    pub logfile: Option<PathBuf>,

    /// Path to pidfile
    #[arg(short = 'P', long)]
    pub pidfile: Option<PathBuf>,

    /// Print more verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon && self.logfile.is_none() {
            return Err(ConfigError::DaemonWithoutLogfile);
        }
        Ok(())
    }

    pub fn load_config(&self) -> Result<WorkerConfig, ConfigError> {
        match &self.config {
            Some(path) => WorkerConfig::from_file(path),
            None => Ok(WorkerConfig::default()),
        }
    }

    /// Install the global subscriber. The returned guard flushes the logfile
    /// writer when dropped and must live until exit.
    pub fn init_tracing(&self, default_level: &str) -> Result<Option<WorkerGuard>, ConfigError> {
        let filter = if self.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
        };

        let Some(logfile) = &self.logfile else {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(false))
                .init();
            return Ok(None);
        };

        let (directory, file_name) = split_logfile(logfile)?;
        let appender = tracing_appender::rolling::never(directory, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let stdout = (!self.daemon).then(|| fmt::layer().with_target(false));

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_ansi(false).with_writer(writer))
            .with(stdout)
            .init();
        Ok(Some(guard))
    }

    pub fn write_pid(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.pidfile else {
            return Ok(());
        };
        std::fs::write(path, format!("{}\n", std::process::id())).map_err(|source| {
            ConfigError::PidFile {
                path: path.clone(),
                source,
            }
        })
    }
}

fn split_logfile(path: &Path) -> Result<(PathBuf, PathBuf), ConfigError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| ConfigError::InvalidLogfile(path.to_path_buf()))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((directory, PathBuf::from(file_name)))
}
