//! Wireless sensor side of a session: discovery, characteristic
//! negotiation, per-sensor actors and capture files.

mod actor;
mod capture;
mod domain;
mod negotiate;

pub use actor::SensorAck;
pub use capture::{CaptureLog, file_name};
pub use domain::{SensorDomain, SensorReport};
pub use negotiate::{configure, negotiate};
