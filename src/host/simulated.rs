//! In-memory host with kernel-like rule evaluation, used by the routing tests.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Mutex;

use async_trait::async_trait;
use ipnetwork::IpNetwork;

use crate::family::{AddressFamily, normalize};
use crate::host::{InterfaceQuery, MAIN_TABLE_ID, PolicyRule, Route, RouteTable};
use crate::net::NetworkInterface;

pub const LOCAL_TABLE_ID: u32 = 255;
pub const DEFAULT_TABLE_ID: u32 = 253;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    InterfaceByName,
    InterfaceByIndex,
    InterfaceAddresses,
    ListRules,
    AddRule,
    DeleteRule,
    ListRoutes,
    AddRoute,
    DeleteRoute,
}

#[derive(Debug, Clone)]
struct SimInterface {
    interface: NetworkInterface,
    addresses: Vec<IpAddr>,
    // addresses appear once this many address queries have been answered
    assign_after: Option<(usize, Vec<IpAddr>)>,
}

#[derive(Default)]
struct State {
    interfaces: Vec<SimInterface>,
    rules: Vec<PolicyRule>,
    routes: Vec<Route>,
    failures: HashMap<Call, (i32, Option<usize>)>,
    calls: Vec<Call>,
    address_queries: HashMap<String, usize>,
}

pub struct SimulatedHost {
    state: Mutex<State>,
}

pub fn net(s: &str) -> IpNetwork {
    s.parse().unwrap()
}

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

impl SimulatedHost {
    /// A host with no interfaces and only the kernel's stock rules.
    pub fn empty() -> Self {
        let mut state = State::default();
        for family in AddressFamily::ALL {
            for (priority, table) in [(0, LOCAL_TABLE_ID), (32766, MAIN_TABLE_ID), (32767, DEFAULT_TABLE_ID)] {
                state.rules.push(PolicyRule { family, priority, destination: None, table });
            }
        }
        Self { state: Mutex::new(state) }
    }

    /// `eth0` (index 2) with `192.168.1.10/24` and a default route via `192.168.1.1` metric 100, plus an address-less `tun0` (index 7).
    pub fn lan() -> Self {
        let host = Self::empty();
        let eth0 = host.add_interface(2, "eth0", &["192.168.1.10", "fe80::10"]);
        host.add_interface(7, "tun0", &[]);
        host.insert_route(Route { destination: net("0.0.0.0/0"), gateway: Some(ip("192.168.1.1")), interface_index: eth0.index, metric: 100, table: MAIN_TABLE_ID });
        host.insert_route(Route { destination: net("192.168.1.0/24"), gateway: None, interface_index: eth0.index, metric: 100, table: MAIN_TABLE_ID });
        host
    }

    pub fn add_interface(&self, index: u32, name: &str, addresses: &[&str]) -> NetworkInterface {
        let interface = NetworkInterface { index: NonZeroU32::new(index).unwrap(), name: name.to_string() };
        self.state.lock().unwrap().interfaces.push(SimInterface {
            interface: interface.clone(),
            addresses: addresses.iter().map(|s| ip(s)).collect(),
            assign_after: None,
        });
        interface
    }

    pub fn remove_interface(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        let Some(position) = state.interfaces.iter().position(|i| i.interface.name == name) else { return };
        let index = state.interfaces.remove(position).interface.index;
        state.routes.retain(|r| r.interface_index != index);
    }

    pub fn set_addresses(&self, name: &str, addresses: &[&str]) {
        let mut state = self.state.lock().unwrap();
        let interface = state.interfaces.iter_mut().find(|i| i.interface.name == name).unwrap();
        interface.addresses = addresses.iter().map(|s| ip(s)).collect();
    }

    /// The addresses show up after `queries` address lookups have returned without them.
    pub fn assign_addresses_after(&self, name: &str, queries: usize, addresses: &[&str]) {
        let mut state = self.state.lock().unwrap();
        let interface = state.interfaces.iter_mut().find(|i| i.interface.name == name).unwrap();
        interface.assign_after = Some((queries, addresses.iter().map(|s| ip(s)).collect()));
    }

    pub fn insert_route(&self, route: Route) {
        self.state.lock().unwrap().routes.push(route);
    }

    pub fn remove_route(&self, route: &Route) {
        self.state.lock().unwrap().routes.retain(|r| r != route);
    }

    pub fn interface(&self, name: &str) -> NetworkInterface {
        let state = self.state.lock().unwrap();
        state.interfaces.iter().find(|i| i.interface.name == name).map(|i| i.interface.clone()).unwrap()
    }

    pub fn insert_rule(&self, rule: PolicyRule) {
        self.state.lock().unwrap().rules.push(rule);
    }

    /// Every following `call` fails with `errno`.
    pub fn fail(&self, call: Call, errno: i32) {
        self.state.lock().unwrap().failures.insert(call, (errno, None));
    }

    /// Only the next `times` invocations of `call` fail.
    pub fn fail_times(&self, call: Call, errno: i32, times: usize) {
        self.state.lock().unwrap().failures.insert(call, (errno, Some(times)));
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    pub fn rules(&self, family: AddressFamily) -> Vec<PolicyRule> {
        let mut rules: Vec<_> = self.state.lock().unwrap().rules.iter().filter(|r| r.family == family).cloned().collect();
        rules.sort_by_key(|r| r.priority);
        rules
    }

    pub fn routes(&self, table: u32) -> Vec<Route> {
        self.state.lock().unwrap().routes.iter().filter(|r| r.table == table).cloned().collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Number of mutating calls recorded so far.
    pub fn mutations(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, Call::AddRule | Call::DeleteRule | Call::AddRoute | Call::DeleteRoute)).count()
    }

    pub fn address_queries(&self, name: &str) -> usize {
        self.state.lock().unwrap().address_queries.get(name).copied().unwrap_or(0)
    }

    /// Resolves the route a packet to `destination` takes: rules in priority order, longest prefix match per table, falling through to
    /// the next rule when the table has no matching route.
    pub fn lookup(&self, destination: IpAddr) -> Option<Route> {
        let destination = normalize(destination);
        let family = AddressFamily::of(destination);
        let state = self.state.lock().unwrap();
        let mut rules: Vec<_> = state.rules.iter().filter(|r| r.family == family && r.matches(destination)).collect();
        rules.sort_by_key(|r| r.priority);
        rules.into_iter().find_map(|rule| {
            state
                .routes
                .iter()
                .filter(|r| r.table == rule.table && r.destination.contains(destination))
                .min_by_key(|r| (std::cmp::Reverse(r.destination.prefix()), r.metric))
                .cloned()
        })
    }

    /// Name of the interface a packet to `destination` leaves through.
    pub fn egress(&self, destination: &str) -> Option<String> {
        let route = self.lookup(ip(destination))?;
        let state = self.state.lock().unwrap();
        state.interfaces.iter().find(|i| i.interface.index == route.interface_index).map(|i| i.interface.name.clone())
    }

    fn enter(&self, call: Call) -> io::Result<std::sync::MutexGuard<'_, State>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if let Some((errno, remaining)) = state.failures.get(&call).copied() {
            match remaining {
                Some(n) if n <= 1 => {
                    state.failures.remove(&call);
                }
                Some(n) => {
                    state.failures.insert(call, (errno, Some(n - 1)));
                }
                None => {}
            }
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(state)
    }
}

fn same_route(a: &Route, b: &Route) -> bool {
    a.destination == b.destination && a.table == b.table && a.metric == b.metric
}

#[async_trait]
impl InterfaceQuery for SimulatedHost {
    async fn interface_by_name(&self, name: &str) -> io::Result<Option<NetworkInterface>> {
        let state = self.enter(Call::InterfaceByName)?;
        Ok(state.interfaces.iter().find(|i| i.interface.name == name).map(|i| i.interface.clone()))
    }

    async fn interface_by_index(&self, index: NonZeroU32) -> io::Result<Option<NetworkInterface>> {
        let state = self.enter(Call::InterfaceByIndex)?;
        Ok(state.interfaces.iter().find(|i| i.interface.index == index).map(|i| i.interface.clone()))
    }

    async fn interface_addresses(&self, interface: &NetworkInterface) -> io::Result<Vec<IpAddr>> {
        let mut state = self.enter(Call::InterfaceAddresses)?;
        let answered = *state.address_queries.entry(interface.name.clone()).and_modify(|n| *n += 1).or_insert(1) - 1;
        let Some(sim) = state.interfaces.iter_mut().find(|i| i.interface.index == interface.index) else {
            return Err(io::Error::from_raw_os_error(libc::ENODEV));
        };
        if sim.assign_after.as_ref().is_some_and(|(after, _)| answered >= *after) {
            if let Some((_, addresses)) = sim.assign_after.take() {
                sim.addresses = addresses;
            }
        }
        Ok(sim.addresses.clone())
    }
}

#[async_trait]
impl RouteTable for SimulatedHost {
    async fn list_rules(&self, family: AddressFamily) -> io::Result<Vec<PolicyRule>> {
        let state = self.enter(Call::ListRules)?;
        Ok(state.rules.iter().filter(|r| r.family == family).cloned().collect())
    }

    async fn add_rule(&self, rule: &PolicyRule) -> io::Result<()> {
        let mut state = self.enter(Call::AddRule)?;
        if state.rules.contains(rule) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        state.rules.push(rule.clone());
        Ok(())
    }

    async fn delete_rule(&self, rule: &PolicyRule) -> io::Result<()> {
        let mut state = self.enter(Call::DeleteRule)?;
        let Some(position) = state.rules.iter().position(|r| r == rule) else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };
        state.rules.remove(position);
        Ok(())
    }

    async fn list_routes(&self, family: AddressFamily, table: u32) -> io::Result<Vec<Route>> {
        let state = self.enter(Call::ListRoutes)?;
        Ok(state.routes.iter().filter(|r| r.family() == family && r.table == table).cloned().collect())
    }

    async fn add_route(&self, route: &Route) -> io::Result<()> {
        let mut state = self.enter(Call::AddRoute)?;
        if !state.interfaces.iter().any(|i| i.interface.index == route.interface_index) {
            return Err(io::Error::from_raw_os_error(libc::ENODEV));
        }
        if state.routes.iter().any(|r| same_route(r, route)) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        state.routes.push(route.clone());
        Ok(())
    }

    async fn delete_route(&self, route: &Route) -> io::Result<()> {
        let mut state = self.enter(Call::DeleteRoute)?;
        let Some(position) = state.routes.iter().position(|r| same_route(r, route) && r.interface_index == route.interface_index) else {
            return Err(io::Error::from_raw_os_error(libc::ESRCH));
        };
        state.routes.remove(position);
        Ok(())
    }
}
