//! `capsync ports`: list serial ports visible on this host.

use crate::error::CliError;
use crate::output;

pub fn handle() -> Result<(), CliError> {
    let ports = capsync_link::list_ports()?;
    println!("{}", output::render_ports(&ports));
    Ok(())
}
