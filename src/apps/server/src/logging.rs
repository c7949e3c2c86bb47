//! Logging Configuration

use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_ENV: &str = "TAVERN_PROXY_LOG_LEVEL";

/// Crates whose request-level chatter stays quiet below `debug`.
const NOISY_TARGETS: [&str; 4] = ["hyper", "hyper_util", "reqwest", "tokenizers"];

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: log::LevelFilter,
    pub is_debug: bool,
}

impl LogConfig {
    pub fn new(cli_level: Option<&str>, is_debug: bool) -> Self {
        Self {
            level: resolve_level(std::env::var(LOG_LEVEL_ENV).ok().as_deref(), cli_level, is_debug),
            is_debug,
        }
    }
}

fn default_level(is_debug: bool) -> log::LevelFilter {
    if is_debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    }
}

/// Environment first, then the command line, then the default.
pub fn resolve_level(env: Option<&str>, cli: Option<&str>, is_debug: bool) -> log::LevelFilter {
    if let Some(val) = env {
        match parse_log_level(val) {
            Some(level) => return level,
            None => eprintln!(
                "Warning: Invalid {} '{}', falling back to default",
                LOG_LEVEL_ENV, val
            ),
        }
    }
    if let Some(val) = cli {
        match parse_log_level(val) {
            Some(level) => return level,
            None => eprintln!("Warning: Invalid --log-level '{}', falling back to default", val),
        }
    }
    default_level(is_debug)
}

pub fn parse_log_level(value: &str) -> Option<log::LevelFilter> {
    match value.trim().to_lowercase().as_str() {
        "trace" => Some(log::LevelFilter::Trace),
        "debug" => Some(log::LevelFilter::Debug),
        "info" => Some(log::LevelFilter::Info),
        "warn" => Some(log::LevelFilter::Warn),
        "error" => Some(log::LevelFilter::Error),
        "off" => Some(log::LevelFilter::Off),
        _ => None,
    }
}

pub fn level_to_str(level: log::LevelFilter) -> &'static str {
    match level {
        log::LevelFilter::Trace => "trace",
        log::LevelFilter::Debug => "debug",
        log::LevelFilter::Info => "info",
        log::LevelFilter::Warn => "warn",
        log::LevelFilter::Error => "error",
        log::LevelFilter::Off => "off",
    }
}

pub fn build_filter(config: &LogConfig) -> EnvFilter {
    let level = level_to_str(config.level);
    let mut directives = vec![level.to_string()];
    if config.level > log::LevelFilter::Info && !config.is_debug {
        directives.extend(NOISY_TARGETS.iter().map(|target| format!("{}=info", target)));
    } else if config.level == log::LevelFilter::Info {
        directives.extend(NOISY_TARGETS.iter().map(|target| format!("{}=warn", target)));
    }
    EnvFilter::new(directives.join(","))
}

/// Installs the global subscriber. `log` records from the library crates
/// reach it through the `tracing-log` bridge.
pub fn init_logging(config: &LogConfig) {
    let result = tracing_subscriber::fmt()
        .with_env_filter(build_filter(config))
        .with_target(config.is_debug)
        .try_init();
    if let Err(e) = result {
        eprintln!("Warning: Failed to install logger: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_beats_cli_and_default() {
        assert_eq!(
            resolve_level(Some("trace"), Some("warn"), false),
            log::LevelFilter::Trace
        );
        assert_eq!(resolve_level(None, Some("warn"), true), log::LevelFilter::Warn);
        assert_eq!(resolve_level(None, None, true), log::LevelFilter::Debug);
        assert_eq!(resolve_level(None, None, false), log::LevelFilter::Info);
    }

    #[test]
    fn invalid_values_fall_through() {
        assert_eq!(
            resolve_level(Some("loud"), Some("error"), false),
            log::LevelFilter::Error
        );
        assert_eq!(resolve_level(Some("loud"), Some("quiet"), true), log::LevelFilter::Debug);
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(parse_log_level(" WARN "), Some(log::LevelFilter::Warn));
        assert_eq!(parse_log_level("verbose"), None);
    }

    #[test]
    fn info_level_quiets_http_crates() {
        let config = LogConfig {
            level: log::LevelFilter::Info,
            is_debug: false,
        };
        let filter = build_filter(&config).to_string();
        assert!(filter.contains("hyper=warn"));
        assert!(filter.contains("info"));
    }
}
