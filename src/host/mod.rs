//! Host collaborators: interface enumeration and kernel routing state.
//!
//! Errors are plain `std::io::Error`s which keep the kernel errno, so callers can tell "already exists" and "already gone" apart from
//! real rejections.

#[cfg(target_os = "linux")]
pub mod netlink;
#[cfg(test)]
pub(crate) mod simulated;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::Serialize;
use std::io;
use std::net::IpAddr;
use std::num::NonZeroU32;

use crate::family::AddressFamily;
use crate::net::NetworkInterface;

pub const MAIN_TABLE_ID: u32 = 254;

/// A policy routing rule: packets of `family` matching `destination` (all packets if `None`) are looked up in `table`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct PolicyRule {
    pub family: AddressFamily,
    pub priority: u32,
    pub destination: Option<IpNetwork>,
    pub table: u32,
}

impl PolicyRule {
    pub fn matches(&self, destination: IpAddr) -> bool {
        self.destination.is_none_or(|network| network.contains(destination))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Route {
    pub destination: IpNetwork,
    pub gateway: Option<IpAddr>,
    pub interface_index: NonZeroU32,
    pub metric: u32,
    pub table: u32,
}

impl Route {
    pub fn family(&self) -> AddressFamily {
        AddressFamily::of_network(&self.destination)
    }

    pub fn is_default(&self) -> bool {
        self.destination.prefix() == 0
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(gateway) = self.gateway {
            write!(f, " via {gateway}")?;
        }
        write!(f, " dev #{} metric {} table {}", self.interface_index, self.metric, self.table)
    }
}

#[async_trait]
pub trait InterfaceQuery: Send + Sync {
    /// `Ok(None)` if no interface has this name.
    async fn interface_by_name(&self, name: &str) -> io::Result<Option<NetworkInterface>>;

    async fn interface_by_index(&self, index: NonZeroU32) -> io::Result<Option<NetworkInterface>>;

    /// All addresses bound to the interface, in kernel order.
    async fn interface_addresses(&self, interface: &NetworkInterface) -> io::Result<Vec<IpAddr>>;
}

/// Kernel routing rules and routes. Adding a present entry fails with `EEXIST`, deleting an absent one with `ENOENT` or `ESRCH`.
#[async_trait]
pub trait RouteTable: Send + Sync {
    async fn list_rules(&self, family: AddressFamily) -> io::Result<Vec<PolicyRule>>;

    async fn add_rule(&self, rule: &PolicyRule) -> io::Result<()>;

    async fn delete_rule(&self, rule: &PolicyRule) -> io::Result<()>;

    async fn list_routes(&self, family: AddressFamily, table: u32) -> io::Result<Vec<Route>>;

    async fn add_route(&self, route: &Route) -> io::Result<()>;

    async fn delete_route(&self, route: &Route) -> io::Result<()>;
}

pub trait Host: InterfaceQuery + RouteTable {}

impl<T: InterfaceQuery + RouteTable> Host for T {}

pub fn is_already_exists(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::AlreadyExists || error.raw_os_error() == Some(libc::EEXIST)
}

pub fn is_already_gone(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::NotFound || matches!(error.raw_os_error(), Some(libc::ENOENT) | Some(libc::ESRCH))
}
