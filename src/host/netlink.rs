use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::num::NonZeroU32;

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use rtnetlink::packet_route::AddressFamily as NetlinkFamily;
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::link::{LinkAttribute, LinkMessage};
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute, RouteHeader, RouteMessage};
use rtnetlink::packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
use rtnetlink::{IpVersion, RouteMessageBuilder};

use crate::family::{AddressFamily, normalize_network};
use crate::host::{InterfaceQuery, PolicyRule, Route, RouteTable};
use crate::net::NetworkInterface;

/// Host collaborators backed by a single rtnetlink connection.
pub struct NetlinkHost {
    handle: rtnetlink::Handle,
    connection: tokio::task::JoinHandle<()>,
}

impl NetlinkHost {
    /// Must be called from within a tokio runtime, which drives the connection.
    pub fn connect() -> io::Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection().inspect_err(|error| {
            tracing::error!(message_id = "eZYzFxxY", ?error, "failed to create netlink connection");
        })?;
        Ok(Self { handle, connection: tokio::spawn(connection) })
    }
}

impl Drop for NetlinkHost {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

fn to_io_error(error: rtnetlink::Error) -> io::Error {
    match error {
        rtnetlink::Error::NetlinkError(message) => io::Error::from_raw_os_error(-message.raw_code()),
        error => io::Error::other(error),
    }
}

fn is_no_device(error: &rtnetlink::Error) -> bool {
    matches!(error, rtnetlink::Error::NetlinkError(message) if message.raw_code() == -libc::ENODEV)
}

fn interface_from_link(message: LinkMessage) -> io::Result<NetworkInterface> {
    let index = NonZeroU32::new(message.header.index).ok_or_else(|| io::Error::other("interface index can't be 0"))?;
    let name = message
        .attributes
        .into_iter()
        .find_map(|attr| if let LinkAttribute::IfName(name) = attr { Some(name) } else { None })
        .ok_or_else(|| io::Error::other("no name attribute for interface"))?;
    Ok(NetworkInterface { index, name })
}

#[async_trait]
impl InterfaceQuery for NetlinkHost {
    async fn interface_by_name(&self, name: &str) -> io::Result<Option<NetworkInterface>> {
        match self.handle.link().get().match_name(name.to_string()).execute().try_next().await {
            Ok(Some(message)) => interface_from_link(message).map(Some),
            Ok(None) => Ok(None),
            Err(error) if is_no_device(&error) => Ok(None),
            Err(error) => Err(to_io_error(error)),
        }
    }

    async fn interface_by_index(&self, index: NonZeroU32) -> io::Result<Option<NetworkInterface>> {
        match self.handle.link().get().match_index(index.get()).execute().try_next().await {
            Ok(Some(message)) => interface_from_link(message).map(Some),
            Ok(None) => Ok(None),
            Err(error) if is_no_device(&error) => Ok(None),
            Err(error) => Err(to_io_error(error)),
        }
    }

    async fn interface_addresses(&self, interface: &NetworkInterface) -> io::Result<Vec<IpAddr>> {
        let mut messages = self.handle.address().get().set_link_index_filter(interface.index.get()).execute();
        let mut addresses = Vec::new();
        while let Some(message) = messages.try_next().await.map_err(to_io_error)? {
            // On point-to-point links `Address` is the peer, `Local` is ours.
            let (mut local, mut address) = (None, None);
            for attr in message.attributes {
                match attr {
                    AddressAttribute::Local(ip) => local = Some(ip),
                    AddressAttribute::Address(ip) => address = Some(ip),
                    _ => {}
                }
            }
            if let Some(ip) = local.or(address) {
                addresses.push(ip);
            }
        }
        Ok(addresses)
    }
}

fn netlink_family(family: AddressFamily) -> NetlinkFamily {
    match family {
        AddressFamily::V4 => NetlinkFamily::Inet,
        AddressFamily::V6 => NetlinkFamily::Inet6,
    }
}

pub(super) fn rule_message(rule: &PolicyRule) -> RuleMessage {
    let mut message = RuleMessage::default();
    message.header.family = netlink_family(rule.family);
    message.header.action = RuleAction::ToTable;
    message.header.table = u8::try_from(rule.table).unwrap_or(RouteHeader::RT_TABLE_UNSPEC);
    message.attributes.push(RuleAttribute::Table(rule.table));
    message.attributes.push(RuleAttribute::Priority(rule.priority));
    if let Some(destination) = rule.destination {
        message.header.dst_len = destination.prefix();
        message.attributes.push(RuleAttribute::Destination(destination.network()));
    }
    message
}

/// Rules with selectors beyond a destination prefix are reported as `None`, they are never ours.
pub(super) fn parse_rule(family: AddressFamily, message: RuleMessage) -> Option<PolicyRule> {
    if message.header.action != RuleAction::ToTable || message.header.src_len != 0 {
        return None;
    }
    let (mut table, mut priority, mut destination) = (u32::from(message.header.table), 0, None);
    for attr in message.attributes {
        match attr {
            RuleAttribute::Table(v) => table = v,
            RuleAttribute::Priority(v) => priority = v,
            RuleAttribute::Destination(ip) => destination = Some(ip),
            RuleAttribute::Source(_) | RuleAttribute::Iifname(_) | RuleAttribute::Oifname(_) | RuleAttribute::FwMark(_) => return None,
            _ => {}
        }
    }
    let destination = match destination {
        Some(ip) => Some(IpNetwork::new(ip, message.header.dst_len).ok()?),
        None => None,
    };
    Some(PolicyRule { family, priority, destination, table })
}

pub(super) fn route_message(route: &Route) -> io::Result<RouteMessage> {
    let builder = RouteMessageBuilder::<IpAddr>::new()
        .destination_prefix(route.destination.network(), route.destination.prefix())
        .map_err(io::Error::other)?;
    let builder = match route.gateway {
        Some(gateway) => builder.gateway(gateway).map_err(io::Error::other)?,
        None => builder,
    };
    Ok(builder.output_interface(route.interface_index.get()).priority(route.metric).table_id(route.table).build())
}

fn route_address(address: RouteAddress) -> Option<IpAddr> {
    match address {
        RouteAddress::Inet(ip) => Some(IpAddr::V4(ip)),
        RouteAddress::Inet6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    }
}

/// Multipath and blackhole routes have no single output interface and are skipped.
pub(super) fn parse_route(family: AddressFamily, message: RouteMessage) -> Option<Route> {
    let (mut destination, mut gateway, mut interface_index, mut metric) = (None, None, None, 0);
    let mut table = u32::from(message.header.table);
    for attr in message.attributes {
        match attr {
            RouteAttribute::Destination(address) => destination = route_address(address),
            RouteAttribute::Gateway(address) => gateway = route_address(address),
            RouteAttribute::Oif(v) => interface_index = NonZeroU32::new(v),
            RouteAttribute::Priority(v) => metric = v,
            RouteAttribute::Table(v) => table = v,
            _ => {}
        }
    }
    let destination = destination.unwrap_or(match family {
        AddressFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        AddressFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    });
    let destination = normalize_network(IpNetwork::new(destination, message.header.destination_prefix_length).ok()?);
    Some(Route { destination, gateway, interface_index: interface_index?, metric, table })
}

#[async_trait]
impl RouteTable for NetlinkHost {
    async fn list_rules(&self, family: AddressFamily) -> io::Result<Vec<PolicyRule>> {
        let version = match family {
            AddressFamily::V4 => IpVersion::V4,
            AddressFamily::V6 => IpVersion::V6,
        };
        let mut messages = self.handle.rule().get(version).execute();
        let mut rules = Vec::new();
        while let Some(message) = messages.try_next().await.map_err(to_io_error)? {
            rules.extend(parse_rule(family, message));
        }
        Ok(rules)
    }

    async fn add_rule(&self, rule: &PolicyRule) -> io::Result<()> {
        let mut request = self.handle.rule().add();
        *request.message_mut() = rule_message(rule);
        request.execute().await.map_err(|error| {
            tracing::debug!(message_id = "LjBAFsFF", ?error, ?rule, "add rule rejected");
            to_io_error(error)
        })
    }

    async fn delete_rule(&self, rule: &PolicyRule) -> io::Result<()> {
        self.handle.rule().del(rule_message(rule)).execute().await.map_err(|error| {
            tracing::debug!(message_id = "v0MfL2sa", ?error, ?rule, "delete rule rejected");
            to_io_error(error)
        })
    }

    async fn list_routes(&self, family: AddressFamily, table: u32) -> io::Result<Vec<Route>> {
        let filter = match family {
            AddressFamily::V4 => RouteMessageBuilder::<Ipv4Addr>::new().table_id(table).build(),
            AddressFamily::V6 => RouteMessageBuilder::<Ipv6Addr>::new().table_id(table).build(),
        };
        let mut messages = self.handle.route().get(filter).execute();
        let mut routes = Vec::new();
        while let Some(message) = messages.try_next().await.map_err(to_io_error)? {
            // dumps are not filtered by table in the kernel
            routes.extend(parse_route(family, message).filter(|route| route.table == table));
        }
        Ok(routes)
    }

    async fn add_route(&self, route: &Route) -> io::Result<()> {
        let message = route_message(route)?;
        self.handle.route().add(message).execute().await.map_err(|error| {
            tracing::debug!(message_id = "8zNoy9Bt", ?error, %route, "add route rejected");
            to_io_error(error)
        })
    }

    async fn delete_route(&self, route: &Route) -> io::Result<()> {
        let message = route_message(route)?;
        self.handle.route().del(message).execute().await.map_err(|error| {
            tracing::debug!(message_id = "wz2g0oDL", ?error, %route, "delete route rejected");
            to_io_error(error)
        })
    }
}
