use std::io;

use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};
use thiserror::Error;

use crate::family::AddressFamily;

/// High-level establishment error codes, which are actionable for operators and the firewall collaborator.
///
/// All remaining errors are mapped to the `Other` variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, IntoStaticStr, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum EstablishErrorCode {
    Cancelled,
    InterfaceNotFound,
    NoTunnelAddress,
    RoutingRejected,
    Teardown,
    Other,
}

impl EstablishErrorCode {
    pub fn as_static_str(&self) -> &'static str {
        self.into()
    }
}

impl From<&EstablishError> for EstablishErrorCode {
    fn from(err: &EstablishError) -> Self {
        match err {
            EstablishError::Cancelled => Self::Cancelled,
            EstablishError::Resolve(err) => match err {
                ResolveError::InterfaceNotFound { .. } => Self::InterfaceNotFound,
                ResolveError::NoMatchingAddress { .. } => Self::NoTunnelAddress,
                ResolveError::AddressListFailed { .. } => Self::Other,
            },
            EstablishError::AddressTimeout { .. } => Self::NoTunnelAddress,
            EstablishError::Routing(_) => Self::RoutingRejected,
            EstablishError::Teardown(_) => Self::Teardown,
            EstablishError::Snapshot(_) | EstablishError::Superseded => Self::Other,
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("interface {interface:?} does not exist")]
    InterfaceNotFound { interface: String },
    #[error("failed to list addresses of interface {interface:?}: {source}")]
    AddressListFailed {
        interface: String,
        #[source]
        source: io::Error,
    },
    #[error("interface {interface:?} has no {family} address among {address_count} address(es)")]
    NoMatchingAddress { interface: String, family: AddressFamily, address_count: usize },
}

impl ResolveError {
    /// Only a missing address is expected to heal by itself: the VPN protocol assigns it after the interface comes up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoMatchingAddress { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RoutingOperation {
    ListRules,
    AddRule,
    DeleteRule,
    ListRoutes,
    AddRoute,
    DeleteRoute,
    FindInterface,
}

#[derive(Debug, Error)]
#[error("{family} routing operation {operation} failed: {source}")]
pub struct RoutingProgramFailed {
    pub operation: RoutingOperation,
    pub family: AddressFamily,
    #[source]
    pub source: io::Error,
}

impl RoutingProgramFailed {
    pub fn new(operation: RoutingOperation, family: AddressFamily, source: io::Error) -> Self {
        Self { operation, family, source }
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("no {family} default route in the main table")]
    NoDefaultRoute { family: AddressFamily },
    #[error("interface {interface:?} of the saved {family} default route no longer exists")]
    RestoreTargetGone { family: AddressFamily, interface: String },
    #[error("a {family} default route snapshot is already pending")]
    SnapshotAlreadyPending { family: AddressFamily },
    #[error(transparent)]
    Routing(#[from] RoutingProgramFailed),
}

#[derive(Debug, Error)]
pub enum EstablishError {
    #[error("establishment was cancelled")]
    Cancelled,
    #[error("could not resolve tunnel address: {0}")]
    Resolve(#[from] ResolveError),
    #[error("interface {interface:?} got no {family} address within {timeout_ms}ms")]
    AddressTimeout { interface: String, family: AddressFamily, timeout_ms: u64 },
    #[error("could not install tunnel routing: {0}")]
    Routing(#[from] RoutingProgramFailed),
    #[error("could not capture default route: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("could not tear down previous session: {0}")]
    Teardown(#[from] TeardownError),
    #[error("establishment was superseded by a concurrent teardown")]
    Superseded,
}

impl EstablishError {
    pub fn code(&self) -> EstablishErrorCode {
        self.into()
    }
}

#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("could not remove tunnel routing: {0}")]
    Remove(#[source] RoutingProgramFailed),
    #[error("could not restore default route: {0}")]
    Restore(#[source] SnapshotError),
}
