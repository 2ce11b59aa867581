//! Config subcommand handlers.

use std::path::PathBuf;

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;

fn resolved_path(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(capsync_config::config_path)
}

pub fn handle(args: &ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let path = resolved_path(global);
    match args.command {
        ConfigCommand::Path => {
            println!("{}", path.display());
        }

        ConfigCommand::Show => {
            let cfg = capsync_config::load_config(Some(&path))?;
            print!("{}", toml::to_string_pretty(&cfg)?);
        }

        ConfigCommand::Init { force } => {
            if force {
                capsync_config::save_config(&capsync_config::Config::default(), &path)?;
            } else {
                capsync_config::init_config(&path)?;
            }
            eprintln!("Wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}
