use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use strum::{Display, EnumIs};

/// Address family of an address, route or rule. Routing state is kept independently per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumIs, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub const ALL: [AddressFamily; 2] = [AddressFamily::V4, AddressFamily::V6];

    pub fn of(addr: IpAddr) -> Self {
        match normalize(addr) {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    pub fn of_network(network: &IpNetwork) -> Self {
        match network {
            IpNetwork::V4(_) => Self::V4,
            IpNetwork::V6(_) => Self::V6,
        }
    }

    /// `0.0.0.0/0` or `::/0`.
    pub fn default_network(self) -> IpNetwork {
        match self {
            Self::V4 => IpNetwork::V4(Ipv4Network::new_checked(Ipv4Addr::UNSPECIFIED, 0).unwrap()),
            Self::V6 => IpNetwork::V6(Ipv6Network::new_checked(Ipv6Addr::UNSPECIFIED, 0).unwrap()),
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::V4 => 0,
            Self::V6 => 1,
        }
    }
}

/// Why a destination bypasses the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ExceptionReason {
    Private,
    Loopback,
    LinkLocalUnicast,
    LinkLocalMulticast,
    UserConfigured,
}

/// A destination range which is routed via the pre-VPN path instead of the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingException {
    pub destination: IpNetwork,
    pub reason: ExceptionReason,
}

impl RoutingException {
    pub fn user_configured(destination: IpNetwork) -> Self {
        Self { destination: normalize_network(destination), reason: ExceptionReason::UserConfigured }
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of_network(&self.destination)
    }
}

const EXCLUDED_V4: [(Ipv4Addr, u8, ExceptionReason); 6] = [
    // RFC 1918
    (Ipv4Addr::new(10, 0, 0, 0), 8, ExceptionReason::Private),
    (Ipv4Addr::new(172, 16, 0, 0), 12, ExceptionReason::Private),
    (Ipv4Addr::new(192, 168, 0, 0), 16, ExceptionReason::Private),
    (Ipv4Addr::new(127, 0, 0, 0), 8, ExceptionReason::Loopback),
    // RFC 3927
    (Ipv4Addr::new(169, 254, 0, 0), 16, ExceptionReason::LinkLocalUnicast),
    // RFC 5771 local network control block
    (Ipv4Addr::new(224, 0, 0, 0), 24, ExceptionReason::LinkLocalMulticast),
];

const EXCLUDED_V6: [(Ipv6Addr, u8, ExceptionReason); 4] = [
    // RFC 4193
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7, ExceptionReason::Private),
    (Ipv6Addr::LOCALHOST, 128, ExceptionReason::Loopback),
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10, ExceptionReason::LinkLocalUnicast),
    (Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0), 16, ExceptionReason::LinkLocalMulticast),
];

/// Built-in exceptions for a family: private, loopback and link-local ranges.
pub fn excluded_networks(family: AddressFamily) -> Vec<RoutingException> {
    match family {
        AddressFamily::V4 => EXCLUDED_V4
            .iter()
            .map(|&(addr, prefix, reason)| RoutingException {
                destination: IpNetwork::V4(Ipv4Network::new_checked(addr, prefix).unwrap()),
                reason,
            })
            .collect(),
        AddressFamily::V6 => EXCLUDED_V6
            .iter()
            .map(|&(addr, prefix, reason)| RoutingException {
                destination: IpNetwork::V6(Ipv6Network::new_checked(addr, prefix).unwrap()),
                reason,
            })
            .collect(),
    }
}

/// True for private-use, loopback, link-local unicast and link-local multicast addresses of either family.
pub fn is_excluded_from_tunnel(addr: IpAddr) -> bool {
    exclusion_reason(addr).is_some()
}

pub fn exclusion_reason(addr: IpAddr) -> Option<ExceptionReason> {
    match normalize(addr) {
        IpAddr::V4(addr) => {
            let [a, b, c, _] = addr.octets();
            match (a, b, c) {
                (10, _, _) => Some(ExceptionReason::Private),
                (172, 16..=31, _) => Some(ExceptionReason::Private),
                (192, 168, _) => Some(ExceptionReason::Private),
                (127, _, _) => Some(ExceptionReason::Loopback),
                (169, 254, _) => Some(ExceptionReason::LinkLocalUnicast),
                (224, 0, 0) => Some(ExceptionReason::LinkLocalMulticast),
                _ => None,
            }
        }
        IpAddr::V6(addr) => {
            let first = addr.segments()[0];
            if first & 0xfe00 == 0xfc00 {
                Some(ExceptionReason::Private)
            } else if addr == Ipv6Addr::LOCALHOST {
                Some(ExceptionReason::Loopback)
            } else if first & 0xffc0 == 0xfe80 {
                Some(ExceptionReason::LinkLocalUnicast)
            } else if first & 0xff0f == 0xff02 {
                // multicast with link-local scope, regardless of flags
                Some(ExceptionReason::LinkLocalMulticast)
            } else {
                None
            }
        }
    }
}

/// V6 only matches genuine V6 addresses. V4 matches bare V4 and V4-mapped V6 addresses.
pub fn matches_family(addr: IpAddr, family: AddressFamily) -> bool {
    match (addr, family) {
        (IpAddr::V4(_), AddressFamily::V4) => true,
        (IpAddr::V6(addr), AddressFamily::V4) => addr.to_ipv4_mapped().is_some(),
        (IpAddr::V6(addr), AddressFamily::V6) => addr.to_ipv4_mapped().is_none(),
        (IpAddr::V4(_), AddressFamily::V6) => false,
    }
}

/// Strips the V4-mapped V6 wrapper, so both encodings of a V4 address compare equal.
pub fn normalize(addr: IpAddr) -> IpAddr {
    addr.to_canonical()
}

/// Unmaps V4-mapped networks and clears host bits, which the kernel rejects in rule selectors.
pub fn normalize_network(network: IpNetwork) -> IpNetwork {
    let network = match network {
        IpNetwork::V6(v6) if v6.prefix() >= 96 => match v6.ip().to_ipv4_mapped() {
            Some(v4) => Ipv4Network::new_checked(v4, v6.prefix() - 96).map(IpNetwork::V4).unwrap_or(network),
            None => network,
        },
        network => network,
    };
    IpNetwork::new(network.network(), network.prefix()).unwrap_or(network)
}
