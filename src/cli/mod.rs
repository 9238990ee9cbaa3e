//! CLI subcommands for `dbg-core-cli`.
//!
//! ```bash
//! dbg-core-cli scenario         # Run a scripted session against a simulated target
//! dbg-core-cli config show      # Print effective configuration
//! dbg-core-cli config defaults  # Print built-in defaults
//! ```

pub mod config_cmd;
pub mod scenario;

pub use scenario::{run_scenario, ScenarioReport};
