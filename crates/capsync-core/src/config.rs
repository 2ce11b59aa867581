// ── Runtime session configuration ──
//
// These types describe *how* a session runs: which ports, which networks,
// and every timing constant. They never touch disk; `capsync-config`
// builds a `SessionConfig` from file, environment and CLI flags.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::credentials::Credential;

/// Everything a [`Session`](crate::Session) needs besides its transports.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Serial ports to open, one trigger box each.
    pub ports: Vec<String>,
    /// Ordered network credentials for provisioning.
    pub credentials: Vec<Credential>,
    pub provisioning: ProvisioningConfig,
    pub fanout: FanoutConfig,
    pub sensors: SensorConfig,
}

/// Wifi handshake tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningConfig {
    /// How long to wait for CONNECTED/DISCONNECTED after SETPASS.
    pub attempt_timeout: Duration,
    /// Pause between SETSSID and SETPASS unless NO_PASS arrives sooner.
    pub settle: Duration,
    /// Attempts with list credentials before asking the operator.
    pub max_attempts: u32,
    /// Ask the operator for a credential once the list is exhausted.
    pub manual_override: bool,
    /// How long to wait for the operator's answer.
    pub override_timeout: Duration,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(15),
            settle: Duration::from_millis(500),
            max_attempts: 3,
            manual_override: true,
            override_timeout: Duration::from_secs(60),
        }
    }
}

/// Broadcast tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutConfig {
    pub workers: NonZeroUsize,
    /// Bounded wait for STARTED/STOPPED echoes. Zero skips the wait.
    pub ack_timeout: Duration,
    /// Liveness STATUS probe interval. Zero disables the probe.
    pub status_interval: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            workers: NonZeroUsize::new(8).unwrap_or(NonZeroUsize::MIN),
            ack_timeout: Duration::from_secs(5),
            status_interval: Duration::from_secs(5),
        }
    }
}

/// Wireless sensor discovery, negotiation and capture.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorConfig {
    /// Substring an advertised name must contain.
    pub name_filter: String,
    pub max_sensors: usize,
    pub scan_window: Duration,
    /// Pause after connecting before the first write.
    pub connect_settle: Duration,
    /// How long a data candidate has to produce a notification.
    pub probe_window: Duration,
    pub configure_attempts: u32,
    pub configure_pause: Duration,
    /// Upper bound for every single wireless operation.
    pub op_timeout: Duration,
    /// Where capture files are written.
    pub capture_dir: PathBuf,
    pub gatt: GattLayout,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            name_filter: "Movella DOT".into(),
            max_sensors: 5,
            scan_window: Duration::from_secs(5),
            connect_settle: Duration::from_millis(2500),
            probe_window: Duration::from_secs(3),
            configure_attempts: 3,
            configure_pause: Duration::from_millis(1500),
            op_timeout: Duration::from_secs(10),
            capture_dir: PathBuf::from("."),
            gatt: GattLayout::default(),
        }
    }
}

/// Characteristics and opcodes used to drive a sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattLayout {
    /// Receives start/stop opcodes.
    pub control: Uuid,
    /// Probed in order; the first to notify becomes the data channel.
    pub data_candidates: Vec<Uuid>,
    /// Tried in order; the first accepting `config_payload` wins.
    pub config_candidates: Vec<Uuid>,
    pub start_opcode: Vec<u8>,
    pub stop_opcode: Vec<u8>,
    pub config_payload: Vec<u8>,
}

impl GattLayout {
    pub const CONTROL: Uuid = Uuid::from_u128(0x1517_2001_4947_11e9_8646_d663_bd87_3d93);
    pub const DATA: [Uuid; 3] = [
        Uuid::from_u128(0x1517_2002_4947_11e9_8646_d663_bd87_3d93),
        Uuid::from_u128(0x1517_2003_4947_11e9_8646_d663_bd87_3d93),
        Uuid::from_u128(0x1517_2004_4947_11e9_8646_d663_bd87_3d93),
    ];
    pub const CONFIG: [Uuid; 4] = [
        Uuid::from_u128(0x1517_2005_4947_11e9_8646_d663_bd87_3d93),
        Uuid::from_u128(0x1517_4001_4947_11e9_8646_d663_bd87_3d93),
        Uuid::from_u128(0x1517_4002_4947_11e9_8646_d663_bd87_3d93),
        Uuid::from_u128(0x1517_7001_4947_11e9_8646_d663_bd87_3d93),
    ];
}

impl Default for GattLayout {
    fn default() -> Self {
        Self {
            control: Self::CONTROL,
            data_candidates: Self::DATA.to_vec(),
            config_candidates: Self::CONFIG.to_vec(),
            start_opcode: vec![0x01, 0x01, 0x06],
            stop_opcode: vec![0x01, 0x00, 0x06],
            config_payload: vec![0x01],
        }
    }
}
