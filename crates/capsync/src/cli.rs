//! Clap derive structures for the `capsync` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// capsync -- synchronized start/stop across camera triggers and motion sensors
#[derive(Debug, Parser)]
#[command(
    name = "capsync",
    version,
    about = "Start and stop camera trigger boxes and motion sensors together",
    long_about = "Opens every serial trigger box and wireless motion sensor, joins the \
        boxes to wifi, then fans START and STOP out to all of them from an \
        interactive console.\n\n\
        Console commands: a (start), s (stop), status, q (quit).",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file to use instead of the default location
    #[arg(long, env = "CAPSYNC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Open all devices and run the operator console
    #[command(alias = "r")]
    Run(RunArgs),

    /// List serial ports visible on this machine
    Ports,

    /// Manage the configuration file
    #[command(alias = "cfg")]
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Run ──────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Serial port of a trigger box (repeatable, replaces configured ports)
    #[arg(long = "port", short = 'p', value_name = "PORT")]
    pub ports: Vec<String>,

    /// Credentials file, one `name,secret` per line
    #[arg(long, short = 'c', value_name = "FILE")]
    pub credentials: Option<PathBuf>,

    /// Skip wireless sensor discovery
    #[arg(long)]
    pub no_sensors: bool,

    /// Seconds between STATUS probes (0 disables)
    #[arg(long, value_name = "SECS")]
    pub status_interval: Option<u64>,

    /// Directory for sensor capture files
    #[arg(long, value_name = "DIR")]
    pub capture_dir: Option<PathBuf>,

    /// Never ask the operator for credentials
    #[arg(long)]
    pub no_prompt: bool,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Write a config file with default settings
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Display current resolved configuration
    Show,

    /// Print the config file path
    Path,
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
