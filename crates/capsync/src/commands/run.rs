//! `capsync run`: open every device and hand control to the operator console.

use std::path::PathBuf;
use std::sync::{Arc, mpsc};
use std::time::Duration;

use tracing::{info, warn};

use capsync_config::Config;
use capsync_core::{ConsolePrompt, SessionBuilder, SessionConfig, run_console};

use crate::cli::{GlobalOpts, RunArgs};
use crate::console::{self, TerminalView};
use crate::error::CliError;
use crate::output;

pub fn handle(args: &RunArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = capsync_config::load_config(global.config.as_deref())?;
    let session_config = session_config(&cfg, args)?;
    let color = output::should_color(global.color);

    info!(
        ports = session_config.ports.len(),
        credentials = session_config.credentials.len(),
        "opening session"
    );

    let (events, inbox) = mpsc::channel();
    let manual_override = session_config.provisioning.manual_override;
    let mut builder = SessionBuilder::new(session_config, Arc::new(cfg.serial_opener()));
    if manual_override {
        builder = builder.prompt(Arc::new(ConsolePrompt::new(events.clone())));
    }
    if cfg.sensors.enabled && !args.no_sensors {
        builder = with_sensors(builder);
    }

    // Lines typed while devices are being opened are queued, not lost.
    console::spawn_stdin_reader(events)?;
    let mut session = builder.open()?;

    for failure in session.open_failures() {
        warn!("{failure}");
    }

    let mut view = TerminalView::new(color);
    run_console(&mut session, &inbox, &mut view)?;
    Ok(())
}

/// Merge command-line overrides into the file/env configuration.
fn session_config(cfg: &Config, args: &RunArgs) -> Result<SessionConfig, CliError> {
    let credentials_path: PathBuf = match &args.credentials {
        Some(path) if !path.exists() => {
            return Err(CliError::NotFound {
                what: "Credentials file".into(),
                path: path.clone(),
            });
        }
        Some(path) => path.clone(),
        None => cfg.provisioning.credentials_file.clone(),
    };
    let credentials = capsync_config::load_credentials(&credentials_path)?;

    let mut session_config = cfg.to_session_config(credentials)?;
    if !args.ports.is_empty() {
        session_config.ports.clone_from(&args.ports);
    }
    if let Some(secs) = args.status_interval {
        session_config.fanout.status_interval = Duration::from_secs(secs);
    }
    if let Some(dir) = &args.capture_dir {
        session_config.sensors.capture_dir.clone_from(dir);
    }
    if args.no_prompt {
        session_config.provisioning.manual_override = false;
    }
    Ok(session_config)
}

#[cfg(feature = "ble")]
fn with_sensors(builder: SessionBuilder) -> SessionBuilder {
    builder.sensors(capsync_link::ble::BleScanner::new)
}

#[cfg(not(feature = "ble"))]
fn with_sensors(builder: SessionBuilder) -> SessionBuilder {
    warn!("built without the `ble` feature; wireless sensors are unavailable");
    builder
}
