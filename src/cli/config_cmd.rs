//! Config CLI subcommands: show, defaults, check.
//!
//! Reads configuration from environment variables or a TOML file; no
//! session is started.

use std::path::Path;

use crate::config::{self, EffectiveConfig, EnvConfig};

/// Print the effective config as key-value pairs to stdout.
pub fn run_show(json: bool) {
    print_config(&config::load().effective_config(), json);
}

/// Print built-in defaults, ignoring the environment.
pub fn run_defaults(json: bool) {
    print_config(&EnvConfig::default().effective_config(), json);
}

/// Parse a TOML config file and print what it resolves to.
///
/// Returns 0 if the file is valid, 2 otherwise.
pub fn run_check(path: &Path) -> i32 {
    match config::load_file(path) {
        Ok(cfg) => {
            print_config(&cfg.effective_config(), false);
            0
        }
        Err(e) => {
            eprintln!("{e}");
            2
        }
    }
}

fn print_config(cfg: &EffectiveConfig, json: bool) {
    if json {
        match serde_json::to_string_pretty(cfg) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("Failed to serialize config: {e}"),
        }
        return;
    }
    for line in config_lines(cfg) {
        println!("{line}");
    }
}

fn config_lines(cfg: &EffectiveConfig) -> Vec<String> {
    vec![
        format!("DBG_CORE_MAX_PENDING={}", cfg.max_pending),
        format!("DBG_CORE_READ_AHEAD={}", cfg.read_ahead),
        format!("DBG_CORE_MAX_FETCH_UNITS={}", cfg.max_fetch_units),
        format!("DBG_CORE_SHUTDOWN_TIMEOUT_MS={}", cfg.shutdown_timeout_ms),
        format!("DBG_CORE_LOG_LEVEL={}", cfg.log_level),
        format!("DBG_CORE_LOG_FORMAT={}", cfg.log_format.as_str()),
        format!(
            "DBG_CORE_LOG_FILE={}",
            cfg.log_file.as_ref().map(|p| p.display().to_string()).unwrap_or_default()
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_lines() {
        let lines = config_lines(&EnvConfig::default().effective_config());
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[0], "DBG_CORE_MAX_PENDING=0");
        assert_eq!(lines[2], "DBG_CORE_MAX_FETCH_UNITS=65536");
        assert_eq!(lines[5], "DBG_CORE_LOG_FORMAT=json");
        assert_eq!(lines[6], "DBG_CORE_LOG_FILE=");
    }

    #[test]
    fn test_check_valid_and_invalid_files() {
        let mut good = tempfile::NamedTempFile::new().unwrap();
        writeln!(good, "[cache]\nread_ahead = 8").unwrap();
        assert_eq!(run_check(good.path()), 0);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "[cache]\nread_ahead = \"many\"").unwrap();
        assert_eq!(run_check(bad.path()), 2);

        assert_eq!(run_check(Path::new("/nonexistent/dbg-core.toml")), 2);
    }
}
