//! `clap`-derived CLI surface.
//!
//! A `Commands` enum with three operations: spawn every configured
//! component, spawn one component and its dependencies, or (internal,
//! hidden) run a single named component in this process. The last is what
//! [`crate::monitor::ComponentMonitor`] re-execs into a fresh child process
//! for, so one component crashing cannot take down the others sharing its
//! address space.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Top-level CLI, parsed once in `main`.
#[derive(Debug, Parser)]
#[command(name = "spm-node", about = "SPM experiment coordination substrate")]
pub struct Cli {
    /// Log level override; falls back to the loaded config's
    /// `application.log_level` when absent.
    #[arg(long, global = true)]
    pub log_level: Option<String>,
    /// Emit JSON-formatted logs instead of compact text.
    #[arg(long, global = true)]
    pub log_json: bool,
    /// The operation to perform.
    #[command(subcommand)]
    pub command: Commands,
}

/// The operations this binary supports.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Spawn and supervise every component in the loaded descriptor tree.
    SpawnAll {
        /// Path to the TOML configuration file.
        config: PathBuf,
        /// Only spawn components with these names (default: all).
        #[arg(long)]
        include: Vec<String>,
        /// Never spawn components with these names.
        #[arg(long)]
        exclude: Vec<String>,
    },
    /// Spawn a single named component (and report, but not spawn, the other
    /// descriptors it `depends_on`).
    SpawnSingle {
        /// Path to the TOML configuration file.
        config: PathBuf,
        /// The component to spawn.
        name: String,
    },
    /// Internal: run a single named component in this process. Invoked by
    /// [`crate::monitor::ComponentMonitor`] re-execing this binary; not
    /// intended for direct interactive use.
    #[command(hide = true)]
    RunComponent {
        /// The component to run, looked up in `config`.
        name: String,
        /// Path to the TOML configuration file.
        #[arg(long)]
        config: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_all_parses_include_exclude() {
        let cli = Cli::parse_from([
            "spm-node",
            "spawn-all",
            "config.toml",
            "--include",
            "translator",
            "--exclude",
            "drift-scheduler",
        ]);
        match cli.command {
            Commands::SpawnAll { config, include, exclude } => {
                assert_eq!(config, PathBuf::from("config.toml"));
                assert_eq!(include, vec!["translator".to_string()]);
                assert_eq!(exclude, vec!["drift-scheduler".to_string()]);
            }
            other => panic!("expected SpawnAll, got {other:?}"),
        }
    }

    #[test]
    fn run_component_requires_config_flag() {
        let cli = Cli::parse_from(["spm-node", "run-component", "translator", "--config", "config.toml"]);
        match cli.command {
            Commands::RunComponent { name, config } => {
                assert_eq!(name, "translator");
                assert_eq!(config, PathBuf::from("config.toml"));
            }
            other => panic!("expected RunComponent, got {other:?}"),
        }
    }
}
