//! The routing config file, `routing.json` in the config directory.

use std::fs;
use std::fs::create_dir_all;
use std::io::{ErrorKind, Write};
use std::path::Path;

use chrono::Utc;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use tempfile::{NamedTempFile, PersistError};
use thiserror::Error;

use crate::family::AddressFamily;

pub const CONFIG_FILE: &str = "routing.json";

#[derive(Debug, Error)]
pub enum ConfigSaveError {
    #[error("encoding routing config failed: {0}")]
    SerializeError(serde_json::Error),
    #[error("creating config directory failed: {0}")]
    CreateDirError(std::io::Error),
    #[error("creating temporary config file failed: {0}")]
    CreateTempFileError(std::io::Error),
    #[error("writing temporary config file failed: {0}")]
    TempFileWriteError(std::io::Error),
    #[error("replacing config file failed: {0}")]
    TempFilePersistError(PersistError),
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("reading routing config failed: {0}")]
    ReadError(std::io::Error),
    #[error("routing config is not valid JSON: {0}")]
    DeserializeError(serde_json::Error),
    #[error("resetting routing config failed: {0}")]
    SaveError(ConfigSaveError),
}

/// Tunnel interface name, `tun0` unless configured.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, derive_more::Display, derive_more::Deref)]
#[serde(transparent)]
pub struct InterfaceName(String);

impl From<&str> for InterfaceName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl Default for InterfaceName {
    fn default() -> Self {
        Self("tun0".to_string())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, derive_more::Deref)]
#[serde(transparent)]
pub struct Families(Vec<AddressFamily>);

impl From<Vec<AddressFamily>> for Families {
    fn from(families: Vec<AddressFamily>) -> Self {
        Self(families)
    }
}

impl Default for Families {
    fn default() -> Self {
        Self(vec![AddressFamily::V4])
    }
}

/// Log verbosity from 0 (errors only) to 6.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
#[serde(transparent)]
pub struct Verbosity(pub u8);

impl Default for Verbosity {
    fn default() -> Self {
        Self(1)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct AddressPollConfig {
    pub attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_ms: u64,
}

impl Default for AddressPollConfig {
    fn default() -> Self {
        Self { attempts: 5, base_delay_ms: 250, max_delay_ms: 4000, timeout_ms: 20000 }
    }
}

/// This is the configuration structure as stored to disk.
///
/// Fields must never fail to parse, use `#[serde(deserialize_with = "crate::serde_safe::deserialize")]` so a broken field resets to
/// its default.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    #[serde(deserialize_with = "crate::serde_safe::deserialize")]
    pub interface: InterfaceName,
    #[serde(deserialize_with = "crate::serde_safe::deserialize")]
    pub families: Families,
    /// Destinations routed outside the tunnel in addition to the private and link-local ranges.
    #[serde(deserialize_with = "crate::serde_safe::deserialize")]
    pub exceptions: Vec<IpNetwork>,
    #[serde(deserialize_with = "crate::serde_safe::deserialize")]
    pub address_poll: AddressPollConfig,
    #[serde(deserialize_with = "crate::serde_safe::deserialize")]
    pub verbosity: Verbosity,
}

fn read(path: &Path) -> Result<Option<Config>, ConfigLoadError> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(ConfigLoadError::DeserializeError),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
        Err(error) => Err(ConfigLoadError::ReadError(error)),
    }
}

/// Loads the config from `config_dir`. A missing file yields the default config. A file which isn't JSON at all is moved aside and
/// replaced with the default config.
pub fn load(config_dir: &Path) -> Result<Config, ConfigLoadError> {
    let path = config_dir.join(CONFIG_FILE);
    let parse_error = match read(&path) {
        Ok(config) => return Ok(config.unwrap_or_default()),
        Err(error @ ConfigLoadError::DeserializeError(_)) => error,
        Err(error) => return Err(error),
    };
    tracing::error!(error = ?parse_error, config.path =? path, message_id = "Voh8rieW", "routing config is not valid JSON, resetting to defaults");

    let backup_path = config_dir.join(format!("routing-backup-{}.json", Utc::now().to_rfc3339()));
    if let Err(error) = fs::rename(&path, &backup_path) {
        tracing::error!(?error, config.path =? path, config.backup_path =? backup_path, message_id = "t8YwQs1m", "could not move broken routing config aside");
        return Err(parse_error);
    }

    let config = Config::default();
    save(config_dir, &config).map_err(ConfigLoadError::SaveError)?;
    Ok(config)
}

/// Replaces the config file atomically: the new content is synced to a temporary file in `config_dir` which is then renamed over it.
pub fn save(config_dir: &Path, config: &Config) -> Result<(), ConfigSaveError> {
    let result = write_atomically(config_dir, config);
    match &result {
        Ok(()) => tracing::info!(config.dir =? config_dir, message_id = "Ieb3ooxa", "saved routing config"),
        Err(error) => tracing::error!(?error, config.dir =? config_dir, message_id = "Chae0Eem", "could not save routing config"),
    }
    result
}

fn write_atomically(config_dir: &Path, config: &Config) -> Result<(), ConfigSaveError> {
    let json = serde_json::to_vec_pretty(config).map_err(ConfigSaveError::SerializeError)?;
    create_dir_all(config_dir).map_err(ConfigSaveError::CreateDirError)?;
    let mut file = NamedTempFile::new_in(config_dir).map_err(ConfigSaveError::CreateTempFileError)?;
    file.write_all(&json).and_then(|()| file.flush()).and_then(|()| file.as_file_mut().sync_data()).map_err(ConfigSaveError::TempFileWriteError)?;
    file.persist(config_dir.join(CONFIG_FILE)).map_err(ConfigSaveError::TempFilePersistError)?;
    Ok(())
}
