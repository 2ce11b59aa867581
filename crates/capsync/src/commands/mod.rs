//! Subcommand handlers.

pub mod config_cmd;
pub mod ports;
pub mod run;
