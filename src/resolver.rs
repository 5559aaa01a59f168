use std::net::IpAddr;

use serde::Serialize;
use strum::EnumIs;

use crate::errors::ResolveError;
use crate::family::{AddressFamily, matches_family, normalize};
use crate::host::InterfaceQuery;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, EnumIs)]
#[serde(rename_all = "camelCase")]
pub enum Readiness {
    NotReady,
    Ready,
    Failed,
}

/// The tunnel interface as seen by one address family of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelInterface {
    pub name: String,
    pub family: AddressFamily,
    pub assigned_address: Option<IpAddr>,
    pub readiness: Readiness,
}

impl TunnelInterface {
    pub fn new(name: impl Into<String>, family: AddressFamily) -> Self {
        Self { name: name.into(), family, assigned_address: None, readiness: Readiness::NotReady }
    }

    pub fn set_ready(&mut self, address: IpAddr) {
        self.assigned_address = Some(normalize(address));
        self.readiness = Readiness::Ready;
    }

    pub fn set_failed(&mut self) {
        self.assigned_address = None;
        self.readiness = Readiness::Failed;
    }
}

/// Returns the first address of `interface_name` belonging to `family`, with V4-mapped addresses unwrapped.
///
/// Never retries: a missing address is reported as [`ResolveError::NoMatchingAddress`] and it's up to the caller to poll.
pub async fn resolve_interface_address(host: &dyn InterfaceQuery, interface_name: &str, family: AddressFamily) -> Result<IpAddr, ResolveError> {
    let interface = host
        .interface_by_name(interface_name)
        .await
        .map_err(|source| ResolveError::AddressListFailed { interface: interface_name.to_string(), source })?
        .ok_or_else(|| ResolveError::InterfaceNotFound { interface: interface_name.to_string() })?;
    let addresses = host
        .interface_addresses(&interface)
        .await
        .map_err(|source| ResolveError::AddressListFailed { interface: interface_name.to_string(), source })?;
    match addresses.iter().copied().find(|&addr| matches_family(addr, family)) {
        Some(addr) => {
            let addr = normalize(addr);
            tracing::debug!(message_id = "c7HwQz1e", interface = interface_name, %family, %addr, "resolved tunnel address");
            Ok(addr)
        }
        None => Err(ResolveError::NoMatchingAddress { interface: interface_name.to_string(), family, address_count: addresses.len() }),
    }
}
