//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running the controller (`run`, the default)
//! - Validating a desired-state document (`check`)
//! - One garbage-collection pass (`sweep`)
//! - Removing every managed container (`cleanup`)

use std::path::PathBuf;

use clap::{ColorChoice, Parser, Subcommand};

use crate::config::Config;
use crate::controller::CleanupReport;
use crate::gc::{AgeReport, SweepReport};

#[derive(Parser, Debug)]
#[command(name = "harbormaster")]
#[command(about = "Keep the containers on one Docker host in line with a desired-state document")]
#[command(
    long_about = "Harbormaster reconciles a single Docker host against a declarative document.\nExamples:\n  harbormaster --config fleet.yml  # Run the controller\n  harbormaster check  # Validate and print the normalized sets"
)]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Desired-state document (YAML, JSON or TOML, by extension)
    #[arg(
        short,
        long,
        global = true,
        env = "HARBORMASTER_CONFIG",
        default_value = "harbormaster.yml"
    )]
    pub config: PathBuf,

    /// Log level or filter directive (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the controller until SIGINT/SIGTERM (default if no subcommand given)
    Run,

    /// Validate the document and print the normalized container sets
    Check,

    /// Run one garbage-collection and age sweep, then exit
    Sweep,

    /// Remove every container labelled auto-deployed=true, then exit
    Cleanup,
}

/// Pick the tracing filter directive.
///
/// `RUST_LOG` wins over `--log-level`, which wins over `logLevel` from the
/// document. Falls back to `info`.
pub fn log_directive(
    rust_log: Option<&str>,
    cli_level: Option<&str>,
    config_level: Option<&str>,
) -> String {
    [rust_log, cli_level, config_level]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or("info")
        .to_string()
}

/// Human-readable summary printed by `check`.
pub fn render_check(config: &Config) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    out.push_str(&format!(
        "{} container set(s), scale every {:?}, gc every {:?}\n",
        config.containers.len(),
        config.scale_interval,
        config.gc_interval
    ));
    match config.max_age {
        Some(age) => out.push_str(&format!(
            "age sweep: maxAge {:?}, every {:?}, slowKill {}\n",
            age, config.age_check_interval, config.slow_kill
        )),
        None => out.push_str("age sweep: disabled\n"),
    }
    out.push_str(&serde_json::to_string_pretty(&config.containers)?);
    out.push('\n');
    Ok(out)
}

pub fn render_sweep(sweep: &SweepReport, age: &AgeReport) -> String {
    format!(
        "removed {} container(s), {} image(s), {} volume(s); kept {} data container(s); \
         retired {} worker(s), {} deferred; {} failure(s)",
        sweep.removed_containers.len(),
        sweep.removed_images.len(),
        sweep.removed_volumes.len(),
        sweep.retained.len(),
        age.retired.len(),
        age.deferred,
        sweep.failures + age.failures
    )
}

pub fn render_cleanup(report: &CleanupReport) -> String {
    format!(
        "removed {} managed container(s), {} failure(s)",
        report.removed, report.failures
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFormat;

    #[test]
    fn test_log_directive_precedence() {
        assert_eq!(log_directive(Some("trace"), Some("debug"), Some("warn")), "trace");
        assert_eq!(log_directive(None, Some("debug"), Some("warn")), "debug");
        assert_eq!(log_directive(Some(""), None, Some("warn")), "warn");
        assert_eq!(log_directive(None, None, None), "info");
    }

    #[test]
    fn test_default_command_and_flags() {
        let cli = Cli::try_parse_from(["harbormaster", "--log-level", "debug"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level.as_deref(), Some("debug"));

        let cli = Cli::try_parse_from(["harbormaster", "sweep", "-c", "/etc/fleet.toml"]).unwrap();
        assert_eq!(cli.command, Some(Command::Sweep));
        assert_eq!(cli.config, PathBuf::from("/etc/fleet.toml"));
    }

    #[test]
    fn test_render_check_lists_sets() {
        let config = Config::parse_document(
            "containers:\n  web:\n    image: nginx\n    instances: 2\n",
            ConfigFormat::Yaml,
        )
        .unwrap();
        let out = render_check(&config).unwrap();
        assert!(out.starts_with("1 container set(s)"));
        assert!(out.contains("age sweep: disabled"));
        assert!(out.contains("\"nginx:latest\""));
    }
}
