//! Logging setup for the `procduplex` binary using `tracing` + `tracing-subscriber`.
//!
//! Level precedence:
//! 1. `--log-level` flag
//! 2. `PROCDUPLEX_LOG` environment variable (e.g. "info", "debug")
//! 3. `info`
//!
//! Logs go to stderr; stdout carries the child's output.

use tracing_subscriber::fmt;

/// Install the global subscriber. Call once at startup.
pub fn init_logging(cli_level: Option<tracing::Level>) {
    let env = std::env::var("PROCDUPLEX_LOG").ok();
    let level = resolve_level(cli_level, env.as_deref());

    fmt()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_level(cli_level: Option<tracing::Level>, env: Option<&str>) -> tracing::Level {
    cli_level
        .or_else(|| env.and_then(parse_level))
        .unwrap_or(tracing::Level::INFO)
}

pub fn parse_level(s: &str) -> Option<tracing::Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!(parse_level("DEBUG"), Some(tracing::Level::DEBUG));
        assert_eq!(parse_level(" warning "), Some(tracing::Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn flag_beats_env_beats_default() {
        use tracing::Level;
        assert_eq!(resolve_level(None, None), Level::INFO);
        assert_eq!(resolve_level(None, Some("bogus")), Level::INFO);
        assert_eq!(resolve_level(None, Some("debug")), Level::DEBUG);
        assert_eq!(resolve_level(Some(Level::ERROR), Some("debug")), Level::ERROR);
    }
}
