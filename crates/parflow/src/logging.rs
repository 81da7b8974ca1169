//! Subscriber setup for binaries embedding parflow.

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::worker::OUTPUT_TARGET;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Filter directives for `level`.
///
/// Forwarded worker output is kept at `info` or finer. Explicit `env`
/// directives replace the defaults entirely.
pub fn filter_directives(level: LogLevel, env: Option<&str>) -> String {
    if let Some(directives) = env.map(str::trim).filter(|d| !d.is_empty()) {
        return directives.to_string();
    }
    let base = level.as_filter();
    let worker = base.max(LevelFilter::INFO);
    format!("{base},{OUTPUT_TARGET}={worker}").to_lowercase()
}

/// Install a stderr subscriber. `RUST_LOG` directives, when set, override `level`.
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = EnvFilter::builder()
        .with_default_directive(level.as_filter().into())
        .parse_lossy(filter_directives(level, env.as_deref()));
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false);

    match format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().try_init();
        }
    }
}
