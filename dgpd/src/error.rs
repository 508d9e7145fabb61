use ax25::AddressError;
use flux::config::ConfigError;
use kiss::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid station address: {0}")]
    Address(#[from] AddressError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("no config path given and ./dgpd.json does not exist")]
    NoConfigFile,
}
