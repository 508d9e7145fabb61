//! On-disk configuration for the `dgpd` daemon.
//!
//! Deserialized directly with `serde` the way `flux::config` loads every other config
//! struct in this workspace, then converted into the plain (non-serde) structs the
//! `ax25`/`kiss` crates expect. Keeping serde out of those crates keeps the protocol
//! engines free of a dependency they have no other use for; the daemon is the only thing
//! that needs to know how its own config file is shaped.

use std::path::PathBuf;
use std::time::Duration;

use ax25::{Ax25Address, AddressError, SessionConfig};
use dgp::Algorithm;
use kiss::{BaudRate, KissConfig, VendorConfig};
use serde_derive::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub station: StationConfig,
    pub transport: TransportConfig,
    #[serde(default)]
    pub session: SessionTuning,
    #[serde(default)]
    pub dgp: DgpConfig,
    pub logging: Option<flux::logging::LoggingConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StationConfig {
    pub callsign: String,
    #[serde(default)]
    pub ssid: u8,
    #[serde(default)]
    pub channel: u16,
}

impl StationConfig {
    pub fn address(&self) -> Result<Ax25Address, AddressError> {
        Ax25Address::new(&self.callsign, self.ssid)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    pub device_path: String,
    #[serde(default = "default_baud")]
    pub baud_rate: u32,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    pub vendor_gain: Option<u8>,
    pub vendor_modem_config: Option<Vec<u8>>,
}

fn default_baud() -> u32 {
    115200
}

fn default_true() -> bool {
    true
}

impl TransportConfig {
    pub fn to_kiss_config(&self) -> KissConfig {
        KissConfig {
            device_path: self.device_path.clone(),
            baud_rate: baud_rate_from_u32(self.baud_rate),
            auto_reconnect: self.auto_reconnect,
            vendor: if self.vendor_gain.is_some() || self.vendor_modem_config.is_some() {
                Some(VendorConfig {
                    gain: self.vendor_gain,
                    modem_config: self.vendor_modem_config.clone(),
                })
            } else {
                None
            },
        }
    }
}

fn baud_rate_from_u32(baud: u32) -> BaudRate {
    match baud {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        _ => BaudRate::B115200,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionTuning {
    #[serde(default = "default_window")]
    pub window_size: u8,
    #[serde(default = "default_paclen")]
    pub paclen: u16,
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,
    #[serde(default)]
    pub extended: bool,
    #[serde(default = "default_initial_rto_secs")]
    pub initial_rto_secs: u64,
    #[serde(default = "default_rto_min_secs")]
    pub rto_min_secs: u64,
    #[serde(default = "default_rto_max_secs")]
    pub rto_max_secs: u64,
    #[serde(default = "default_t3_secs")]
    pub t3_interval_secs: u64,
}

fn default_window() -> u8 {
    2
}
fn default_paclen() -> u16 {
    128
}
fn default_max_retries() -> u8 {
    10
}
fn default_initial_rto_secs() -> u64 {
    4
}
fn default_rto_min_secs() -> u64 {
    1
}
fn default_rto_max_secs() -> u64 {
    30
}
fn default_t3_secs() -> u64 {
    180
}

impl Default for SessionTuning {
    fn default() -> Self {
        SessionTuning {
            window_size: default_window(),
            paclen: default_paclen(),
            max_retries: default_max_retries(),
            extended: false,
            initial_rto_secs: default_initial_rto_secs(),
            rto_min_secs: default_rto_min_secs(),
            rto_max_secs: default_rto_max_secs(),
            t3_interval_secs: default_t3_secs(),
        }
    }
}

impl SessionTuning {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            window_size: self.window_size.min(7).max(1),
            paclen: self.paclen.min(256).max(32),
            max_retries: self.max_retries,
            extended: self.extended,
            initial_rto: Duration::from_secs(self.initial_rto_secs),
            rto_min: Duration::from_secs(self.rto_min_secs),
            rto_max: Duration::from_secs(self.rto_max_secs),
            t3_interval: Duration::from_secs(self.t3_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DgpConfig {
    #[serde(default = "default_true")]
    pub extensions_enabled: bool,
    #[serde(default)]
    pub auto_negotiate: bool,
    #[serde(default = "default_true")]
    pub compression_enabled: bool,
    #[serde(default = "default_algorithm")]
    pub preferred_algorithm: String,
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
}

fn default_algorithm() -> String {
    "zstd".to_string()
}

fn default_downloads_dir() -> PathBuf {
    PathBuf::from("downloads")
}

impl Default for DgpConfig {
    fn default() -> Self {
        DgpConfig {
            extensions_enabled: true,
            auto_negotiate: false,
            compression_enabled: true,
            preferred_algorithm: default_algorithm(),
            downloads_dir: default_downloads_dir(),
        }
    }
}

impl DgpConfig {
    pub fn preferred_algorithm(&self) -> Option<Algorithm> {
        if !self.compression_enabled {
            return Some(Algorithm::None);
        }
        match self.preferred_algorithm.to_lowercase().as_str() {
            "none" => Some(Algorithm::None),
            "lz4" => Some(Algorithm::Lz4),
            "zstd" => Some(Algorithm::Zstd),
            "deflate" => Some(Algorithm::Deflate),
            _ => None,
        }
    }
}
