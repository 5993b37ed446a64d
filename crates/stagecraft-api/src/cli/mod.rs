//! CLI command definitions for the `stagecraft` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod display;
pub mod run;
pub mod runs;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run durable multi-stage workflows.
#[derive(Parser)]
#[command(name = "stagecraft", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Default log filter for the chosen verbosity.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "warn",
            1 => "info,stagecraft=debug",
            _ => "trace",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a workflow file to completion.
    Run {
        /// Path to the workflow YAML file.
        file: PathBuf,

        /// Run input as JSON.
        #[arg(long)]
        input: Option<String>,

        /// Journal every attempt so the run can be resumed after a crash.
        #[arg(long)]
        durable: bool,

        /// Override the per-run concurrency limit.
        #[arg(long)]
        max_concurrency: Option<usize>,
    },

    /// Resume an interrupted durable run.
    Resume {
        /// Run UUID.
        #[arg(required_unless_present = "all")]
        run_id: Option<String>,

        /// Resume every run that did not reach a terminal status.
        #[arg(long, conflicts_with = "run_id")]
        all: bool,
    },

    /// List recent durable runs.
    #[command(alias = "ls")]
    List {
        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show the stages of a run.
    Show {
        /// Run UUID.
        run_id: String,
    },

    /// Send a signal to a run hosted by `stagecraft serve`.
    Signal {
        /// Run UUID.
        run_id: String,

        /// Signal name.
        name: String,

        /// JSON payload (default null).
        payload: Option<String>,

        /// Server base URL (default from config.toml).
        #[arg(long)]
        server: Option<String>,
    },

    /// Start the REST API server.
    Serve {
        /// Port to listen on (default from config.toml).
        #[arg(long)]
        port: Option<u16>,

        /// Host to bind to (default from config.toml).
        #[arg(long)]
        host: Option<String>,
    },

    /// Check a workflow file without running it.
    Validate {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Parse `--input`-style JSON arguments.
pub fn parse_json_arg(raw: Option<&str>) -> anyhow::Result<serde_json::Value> {
    match raw {
        None => Ok(serde_json::Value::Null),
        Some(s) => serde_json::from_str(s)
            .map_err(|e| anyhow::anyhow!("Invalid JSON '{s}': {e}")),
    }
}

pub fn parse_run_id(raw: &str) -> anyhow::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(raw).map_err(|_| anyhow::anyhow!("Invalid run ID: '{raw}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_run_with_flags() {
        let cli = Cli::try_parse_from([
            "stagecraft",
            "run",
            "flow.yaml",
            "--input",
            r#"{"a":1}"#,
            "--durable",
            "--max-concurrency",
            "2",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.log_filter(), "info,stagecraft=debug");
        match cli.command {
            Commands::Run {
                file,
                input,
                durable,
                max_concurrency,
            } => {
                assert_eq!(file, PathBuf::from("flow.yaml"));
                assert_eq!(parse_json_arg(input.as_deref()).unwrap(), json!({"a": 1}));
                assert!(durable);
                assert_eq!(max_concurrency, Some(2));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn resume_needs_id_or_all() {
        assert!(Cli::try_parse_from(["stagecraft", "resume"]).is_err());
        assert!(Cli::try_parse_from(["stagecraft", "resume", "--all"]).is_ok());
        assert!(Cli::try_parse_from(["stagecraft", "resume", "abc", "--all"]).is_err());
    }

    #[test]
    fn quiet_and_verbosity_filters() {
        let cli = Cli::try_parse_from(["stagecraft", "--quiet", "list"]).unwrap();
        assert_eq!(cli.log_filter(), "error");
        let cli = Cli::try_parse_from(["stagecraft", "-vv", "list"]).unwrap();
        assert_eq!(cli.log_filter(), "trace");
        let cli = Cli::try_parse_from(["stagecraft", "ls"]).unwrap();
        assert_eq!(cli.log_filter(), "warn");
    }

    #[test]
    fn bad_json_and_ids_rejected() {
        assert!(parse_json_arg(Some("{nope")).is_err());
        assert_eq!(parse_json_arg(None).unwrap(), serde_json::Value::Null);
        assert!(parse_run_id("not-a-uuid").is_err());
    }

    #[test]
    fn clap_definition_is_consistent() {
        <Cli as clap::CommandFactory>::command().debug_assert();
    }
}
