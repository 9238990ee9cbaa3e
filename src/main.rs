//! `dbg-core-cli` entry point.
//!
//! ## Subcommands
//!
//! - `dbg-core-cli scenario [--config FILE]` - Run a scripted session, print a JSON report
//! - `dbg-core-cli config show [--json]` - Effective configuration
//! - `dbg-core-cli config defaults [--json]` - Built-in defaults
//! - `dbg-core-cli config check FILE` - Validate a TOML config file

use std::path::Path;
use std::process::ExitCode;

use dbg_core::cli::{config_cmd, run_scenario};
use dbg_core::config::{self as dbg_config, EnvConfig};
use dbg_core::telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");
    let json = args.iter().any(|a| a == "--json");

    match command {
        "scenario" => {
            let config = match load_config(&args) {
                Ok(config) => config,
                Err(code) => return code,
            };
            if let Err(e) = telemetry::init_logging(&config.log_config()) {
                eprintln!("Logging disabled: {e}");
            }
            match run_scenario(&config).await {
                Ok(report) => match serde_json::to_string_pretty(&report) {
                    Ok(text) => {
                        println!("{text}");
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        eprintln!("Failed to serialize report: {e}");
                        ExitCode::FAILURE
                    }
                },
                Err(e) => {
                    eprintln!("Scenario failed: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => {
                    config_cmd::run_show(json);
                    ExitCode::SUCCESS
                }
                "defaults" => {
                    config_cmd::run_defaults(json);
                    ExitCode::SUCCESS
                }
                "check" => match args.get(3) {
                    Some(path) => ExitCode::from(config_cmd::run_check(Path::new(path)) as u8),
                    None => {
                        eprintln!("Usage: dbg-core-cli config check FILE");
                        ExitCode::from(2u8)
                    }
                },
                _ => {
                    eprintln!("Unknown config subcommand: {subcommand}");
                    print_usage();
                    ExitCode::FAILURE
                }
            }
        }
        "help" | "--help" | "-h" => {
            print_usage();
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("dbg-core-cli {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {command}");
            print_usage();
            ExitCode::FAILURE
        }
    }
}

/// Environment config, or the file named by `--config`.
fn load_config(args: &[String]) -> Result<EnvConfig, ExitCode> {
    let path = args.iter().position(|a| a == "--config").and_then(|i| args.get(i + 1));
    match path {
        Some(path) => dbg_config::load_file(Path::new(path)).map_err(|e| {
            eprintln!("{e}");
            ExitCode::from(2u8)
        }),
        None => Ok(dbg_config::load()),
    }
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "dbg-core-cli v{version}

USAGE:
    dbg-core-cli <COMMAND> [OPTIONS]

COMMANDS:
    scenario          Run a scripted session against a simulated target
    config show       Print effective configuration
    config defaults   Print built-in defaults
    config check F    Validate a TOML config file
    version           Show version information
    help              Show this help message

OPTIONS:
    --config FILE     Load configuration from a TOML file (scenario)
    --json            JSON output (config show/defaults)

ENVIRONMENT:
    DBG_CORE_MAX_PENDING          Dispatcher queue bound (0 = unbounded)
    DBG_CORE_READ_AHEAD           Read-ahead units for trailing gaps
    DBG_CORE_MAX_FETCH_UNITS      Largest single target read
    DBG_CORE_SHUTDOWN_TIMEOUT_MS  Session drain grace period
    DBG_CORE_LOG_LEVEL            Tracing filter (default: info)
    DBG_CORE_LOG_FORMAT           json or pretty
    DBG_CORE_LOG_FILE             Log file (default: stderr)

EXIT CODES:
    0  Success
    1  Failure
    2  Configuration error
"
    );
}
