mod persistence;


pub use persistence::*;

use std::time::Duration;

use ipnetwork::IpNetwork;
use thiserror::Error;

use crate::family::{AddressFamily, RoutingException};
use crate::manager::{AddressPoll, TunnelArgs};
use crate::net::is_valid_interface_name;

const MAX_VERBOSITY: u8 = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid interface name {0:?}: expected 1 to 15 characters of a-z, A-Z, 0-9, '_' or '-'")]
    InvalidInterfaceName(String),
    #[error("verbosity {0} is out of range: must be between 0 and 6")]
    VerbosityOutOfRange(u8),
    #[error("at least one address family must be enabled")]
    NoFamilies,
    #[error("exception {0} would route everything outside the tunnel")]
    ExceptionCoversEverything(IpNetwork),
    #[error("address_poll.attempts must be at least 1")]
    NoPollAttempts,
}

/// Command line values which take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub interface: Option<String>,
    pub families: Vec<AddressFamily>,
    pub exceptions: Vec<IpNetwork>,
    pub verbosity: Option<u8>,
}

impl Config {
    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(interface) = overrides.interface {
            self.interface = interface.as_str().into();
        }
        if !overrides.families.is_empty() {
            self.families = overrides.families.into();
        }
        self.exceptions.extend(overrides.exceptions);
        if let Some(verbosity) = overrides.verbosity {
            self.verbosity = Verbosity(verbosity);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_interface_name(&self.interface) {
            return Err(ConfigError::InvalidInterfaceName(self.interface.to_string()));
        }
        if self.verbosity.0 > MAX_VERBOSITY {
            return Err(ConfigError::VerbosityOutOfRange(self.verbosity.0));
        }
        if self.families.is_empty() {
            return Err(ConfigError::NoFamilies);
        }
        if let Some(network) = self.exceptions.iter().find(|n| n.prefix() == 0) {
            return Err(ConfigError::ExceptionCoversEverything(*network));
        }
        if self.address_poll.attempts == 0 {
            return Err(ConfigError::NoPollAttempts);
        }
        Ok(())
    }

    /// Without any configured exception the VPN server endpoint is routed into the tunnel itself.
    pub fn lacks_server_exception(&self) -> bool {
        self.exceptions.is_empty()
    }

    /// Requested families in order, without duplicates.
    pub fn families(&self) -> Vec<AddressFamily> {
        let mut families = Vec::new();
        for family in self.families.iter() {
            if !families.contains(family) {
                families.push(*family);
            }
        }
        families
    }

    pub fn tunnel_args(&self) -> TunnelArgs {
        let exceptions = self.exceptions.iter().map(|n| RoutingException::user_configured(*n)).collect();
        TunnelArgs { interface: self.interface.to_string(), families: self.families(), exceptions }
    }

    pub fn address_poll(&self) -> AddressPoll {
        let poll = &self.address_poll;
        AddressPoll {
            attempts: poll.attempts,
            base_delay: Duration::from_millis(poll.base_delay_ms),
            max_delay: Duration::from_millis(poll.max_delay_ms),
            timeout: Duration::from_millis(poll.timeout_ms),
        }
    }
}
