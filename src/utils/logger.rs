use log::LevelFilter;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::append::rolling_file::policy::compound::{
    CompoundPolicy, roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger,
};
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::{Path, PathBuf};

use crate::errors::DbError;
use crate::utils::devlog::DEV_TARGET;

const ROLL_SIZE: u64 = 10 * 1024 * 1024;
const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}";

fn parse_level(level: Option<&str>) -> LevelFilter {
    match level.unwrap_or("info").to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

fn rolling(base: &Path, stem: &str, keep: u32) -> Result<RollingFileAppender, DbError> {
    let roller = FixedWindowRoller::builder()
        .build(&format!("{}", base.join(format!("{stem}.{{}}.log")).display()), keep)
        .map_err(|e| DbError::Config(format!("log roller: {e}")))?;
    let policy = CompoundPolicy::new(Box::new(SizeTrigger::new(ROLL_SIZE)), Box::new(roller));
    RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build(base.join(format!("{stem}.log")), Box::new(policy))
        .map_err(DbError::Io)
}

/// Builds the process log configuration without installing it.
/// - `dir`: base directory for logs; current directory when `None`.
/// - `level`: error|warn|info|debug|trace (default info).
/// - `retention`: rolled files to keep (default 7).
/// - `dev`: also persist developer trace events to `flexdoc-dev.log`.
pub fn build_config(
    dir: Option<&Path>,
    level: Option<&str>,
    retention: Option<usize>,
    dev: bool,
) -> Result<Config, DbError> {
    let base = match dir {
        Some(d) => d.to_path_buf(),
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    std::fs::create_dir_all(&base)?;
    let keep = u32::try_from(retention.unwrap_or(7)).unwrap_or(u32::MAX);
    let lvl = parse_level(level);

    let mut builder =
        Config::builder().appender(Appender::builder().build("app", Box::new(rolling(&base, "flexdoc", keep)?)));
    builder = if dev {
        builder
            .appender(Appender::builder().build("dev", Box::new(rolling(&base, "flexdoc-dev", keep)?)))
            .logger(Logger::builder().appender("dev").additive(false).build(DEV_TARGET, LevelFilter::Trace))
    } else {
        builder.logger(Logger::builder().additive(false).build(DEV_TARGET, LevelFilter::Off))
    };
    builder
        .build(Root::builder().appender("app").build(lvl))
        .map_err(|e| DbError::Config(format!("log config: {e}")))
}

/// Installs the log configuration for the process. Re-initialization is reported as an error.
pub fn configure_logging(
    dir: Option<&Path>,
    level: Option<&str>,
    retention: Option<usize>,
    dev: bool,
) -> Result<(), DbError> {
    let config = build_config(dir, level, retention, dev)?;
    log4rs::init_config(config).map_err(|e| DbError::Config(format!("logger init: {e}")))?;
    Ok(())
}

/// Configure logging from environment variables if present:
/// - FLEXDOC_LOG_DIR
/// - FLEXDOC_LOG_LEVEL
/// - FLEXDOC_LOG_RETENTION
/// - FLEXDOC_DEV
pub fn configure_from_env() -> Result<(), DbError> {
    let dir = std::env::var("FLEXDOC_LOG_DIR").ok().map(PathBuf::from);
    let level = std::env::var("FLEXDOC_LOG_LEVEL").ok();
    let retention =
        std::env::var("FLEXDOC_LOG_RETENTION").ok().and_then(|s| s.parse::<usize>().ok());
    let dev = std::env::var("FLEXDOC_DEV")
        .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);
    configure_logging(dir.as_deref(), level.as_deref(), retention, dev)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_rolling_files_in_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = build_config(Some(dir.path()), Some("debug"), Some(3), true).unwrap();
        assert_eq!(cfg.root().level(), LevelFilter::Debug);
        assert!(cfg.appenders().iter().any(|a| a.name() == "dev"));
        assert!(dir.path().join("flexdoc.log").exists());
        assert!(dir.path().join("flexdoc-dev.log").exists());
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(parse_level(Some("loud")), LevelFilter::Info);
        assert_eq!(parse_level(None), LevelFilter::Info);
    }
}
