use std::collections::BTreeMap;
use std::io;

use serde::Serialize;
use static_assertions::const_assert;

use crate::errors::{RoutingOperation, RoutingProgramFailed};
use crate::family::{AddressFamily, RoutingException, normalize_network};
use crate::host::{Host, MAIN_TABLE_ID, PolicyRule, Route, is_already_exists, is_already_gone};
use crate::net::NetworkInterface;
use crate::resolver::TunnelInterface;

/// Dedicated table holding the tunnel default routes.
pub const TUNNEL_TABLE_ID: u32 = 199;
/// `to <exception> lookup main`
pub const EXCEPTION_RULE_PRIORITY: u32 = 100;
/// `from all lookup TUNNEL_TABLE_ID`
pub const TUNNEL_RULE_PRIORITY: u32 = 101;

// Exceptions must be evaluated before the catch-all tunnel rule. Both must come before the main table rule (32766).
const_assert!(EXCEPTION_RULE_PRIORITY < TUNNEL_RULE_PRIORITY);
const_assert!(TUNNEL_RULE_PRIORITY < 32766);

/// Rules and routes this process installed for one tunnel interface and family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingPolicy {
    pub interface: NetworkInterface,
    pub family: AddressFamily,
    /// In installation order, the tunnel rule last.
    pub rules: Vec<PolicyRule>,
    pub routes: Vec<Route>,
}

impl RoutingPolicy {
    fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.routes.is_empty()
    }
}

fn tunnel_rule(family: AddressFamily) -> PolicyRule {
    PolicyRule { family, priority: TUNNEL_RULE_PRIORITY, destination: None, table: TUNNEL_TABLE_ID }
}

fn exception_rule(exception: &RoutingException) -> PolicyRule {
    PolicyRule {
        family: exception.family(),
        priority: EXCEPTION_RULE_PRIORITY,
        destination: Some(normalize_network(exception.destination)),
        table: MAIN_TABLE_ID,
    }
}

fn tunnel_route(family: AddressFamily, interface: &NetworkInterface) -> Route {
    Route { destination: family.default_network(), gateway: None, interface_index: interface.index, metric: 0, table: TUNNEL_TABLE_ID }
}

/// Owns the kernel state installed for tunnels. V4 and V6 are tracked and changed independently.
#[derive(Debug, Default)]
pub struct RoutingTableManager {
    policies: BTreeMap<(String, AddressFamily), RoutingPolicy>,
}

impl RoutingTableManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policy(&self, interface_name: &str, family: AddressFamily) -> Option<&RoutingPolicy> {
        self.policies.get(&(interface_name.to_string(), family))
    }

    pub fn policies(&self) -> impl Iterator<Item = &RoutingPolicy> {
        self.policies.values()
    }

    /// Routes all traffic of the tunnel's family through the tunnel, except for destinations in `exceptions`, which keep using the
    /// main table.
    ///
    /// Only entries this manager added are recorded. Identical entries that already exist are used but not recorded, so removal leaves
    /// them in place. A foreign default route in the tunnel table fails the install instead of being replaced. On error, entries added
    /// so far stay recorded and are removed by [`Self::remove_tunnel_routing`].
    pub async fn install_tunnel_routing(
        &mut self,
        host: &dyn Host,
        tunnel: &TunnelInterface,
        exceptions: &[RoutingException],
    ) -> Result<(), RoutingProgramFailed> {
        let family = tunnel.family;
        let interface = host
            .interface_by_name(&tunnel.name)
            .await
            .map_err(failed(RoutingOperation::FindInterface, family))?
            .ok_or_else(|| failed(RoutingOperation::FindInterface, family)(io::Error::from_raw_os_error(libc::ENODEV)))?;

        let mut desired_rules: Vec<PolicyRule> = Vec::new();
        for rule in exceptions.iter().filter(|e| e.family() == family).map(exception_rule) {
            if !desired_rules.contains(&rule) {
                desired_rules.push(rule);
            }
        }
        let desired_route = tunnel_route(family, &interface);

        let policy = self.policies.entry((tunnel.name.clone(), family)).or_insert_with(|| RoutingPolicy {
            interface: interface.clone(),
            family,
            rules: Vec::new(),
            routes: Vec::new(),
        });
        policy.interface = interface.clone();

        let existing_rules = host.list_rules(family).await.map_err(failed(RoutingOperation::ListRules, family))?;
        let existing_routes = host.list_routes(family, TUNNEL_TABLE_ID).await.map_err(failed(RoutingOperation::ListRoutes, family))?;

        // A default route in the tunnel table that was never recorded belongs to someone else and is left alone.
        if let Some(foreign) = existing_routes.iter().find(|r| r.is_default() && **r != desired_route && !policy.routes.contains(r)) {
            tracing::error!(message_id = "Zc4nWu7e", route = %foreign, interface = %tunnel.name, %family, "tunnel table already has a foreign default route");
            return Err(failed(RoutingOperation::AddRoute, family)(io::Error::from_raw_os_error(libc::EEXIST)));
        }
        // Exceptions first and the tunnel rule last: until that rule exists, traffic keeps using the main table.
        for rule in &desired_rules {
            add_rule(host, policy, &existing_rules, rule).await?;
        }

        let stale_routes: Vec<Route> = policy.routes.iter().filter(|r| **r != desired_route).cloned().collect();
        for stale in stale_routes {
            tracing::info!(message_id = "Jt0eWq8c", %stale, interface = %tunnel.name, %family, "replacing stale tunnel table route");
            match host.delete_route(&stale).await {
                Ok(()) => {}
                Err(error) if is_already_gone(&error) => {}
                Err(error) => return Err(failed(RoutingOperation::DeleteRoute, family)(error)),
            }
            policy.routes.retain(|r| *r != stale);
        }
        if existing_routes.contains(&desired_route) {
            if !policy.routes.contains(&desired_route) {
                tracing::info!(message_id = "fP3kYw0n", route = %desired_route, "tunnel route already present, not taking ownership");
            }
        } else {
            match host.add_route(&desired_route).await {
                Ok(()) => {
                    if !policy.routes.contains(&desired_route) {
                        policy.routes.push(desired_route);
                    }
                }
                Err(error) => {
                    tracing::error!(message_id = "Guo1vK5r", ?error, route = %desired_route, "failed to add tunnel route");
                    return Err(failed(RoutingOperation::AddRoute, family)(error));
                }
            }
        }

        let tunnel_rule = tunnel_rule(family);
        add_rule(host, policy, &existing_rules, &tunnel_rule).await?;

        // Exceptions dropped since a previous install.
        let stale_rules: Vec<PolicyRule> = policy.rules.iter().filter(|r| **r != tunnel_rule && !desired_rules.contains(r)).cloned().collect();
        for rule in stale_rules {
            match host.delete_rule(&rule).await {
                Ok(()) => {}
                Err(error) if is_already_gone(&error) => {}
                Err(error) => return Err(failed(RoutingOperation::DeleteRule, family)(error)),
            }
            policy.rules.retain(|r| *r != rule);
        }
        policy.rules.sort_by_key(|r| *r == tunnel_rule);

        tracing::info!(
            message_id = "rT6b2NsQ",
            interface = %interface,
            %family,
            exceptions = desired_rules.len(),
            "tunnel routing installed"
        );
        Ok(())
    }

    /// Deletes exactly the recorded entries of the tunnel: rules in reverse installation order, then routes. Entries that are already
    /// gone count as removed. If a deletion fails, the remaining entries stay recorded so a later call can retry.
    pub async fn remove_tunnel_routing(&mut self, host: &dyn Host, tunnel: &TunnelInterface) -> Result<(), RoutingProgramFailed> {
        let family = tunnel.family;
        let key = (tunnel.name.clone(), family);
        let Some(policy) = self.policies.get_mut(&key) else {
            tracing::debug!(message_id = "N3v8ZcHa", interface = %tunnel.name, %family, "no tunnel routing recorded");
            return Ok(());
        };

        while let Some(rule) = policy.rules.last() {
            match host.delete_rule(rule).await {
                Ok(()) => {}
                Err(error) if is_already_gone(&error) => {
                    tracing::info!(message_id = "na1VknJu", ?rule, "tried to delete non-existent rule");
                }
                Err(error) => {
                    tracing::error!(message_id = "p9LxS2dE", ?error, ?rule, "failed to delete rule");
                    return Err(RoutingProgramFailed::new(RoutingOperation::DeleteRule, family, error));
                }
            }
            policy.rules.pop();
        }
        while let Some(route) = policy.routes.last() {
            match host.delete_route(route).await {
                Ok(()) => {}
                Err(error) if is_already_gone(&error) => {
                    tracing::info!(message_id = "k2WbT7yr", %route, "tried to delete non-existent route");
                }
                Err(error) => {
                    tracing::error!(message_id = "Hs5uE1mB", ?error, %route, "failed to delete route");
                    return Err(RoutingProgramFailed::new(RoutingOperation::DeleteRoute, family, error));
                }
            }
            policy.routes.pop();
        }

        if policy.is_empty() {
            self.policies.remove(&key);
        }
        tracing::info!(message_id = "bQ8mF4zo", interface = %tunnel.name, %family, "tunnel routing removed");
        Ok(())
    }
}

fn failed(operation: RoutingOperation, family: AddressFamily) -> impl FnOnce(io::Error) -> RoutingProgramFailed {
    move |source| RoutingProgramFailed::new(operation, family, source)
}

/// Records `rule` only if this call added it. An identical rule that already exists without being recorded is left untouched, so
/// removal never deletes it.
async fn add_rule(host: &dyn Host, policy: &mut RoutingPolicy, existing: &[PolicyRule], rule: &PolicyRule) -> Result<(), RoutingProgramFailed> {
    if existing.contains(rule) {
        if !policy.rules.contains(rule) {
            tracing::info!(message_id = "yE5cJ0qL", ?rule, "rule already present, not taking ownership");
        }
        return Ok(());
    }
    match host.add_rule(rule).await {
        Ok(()) => {
            if !policy.rules.contains(rule) {
                policy.rules.push(rule.clone());
            }
            Ok(())
        }
        Err(error) if is_already_exists(&error) => {
            tracing::info!(message_id = "Rm8hGq2v", ?rule, "rule appeared concurrently, not taking ownership");
            Ok(())
        }
        Err(error) => {
            tracing::error!(message_id = "Vd2oA9kX", ?error, ?rule, "failed to add rule");
            Err(RoutingProgramFailed::new(RoutingOperation::AddRule, rule.family, error))
        }
    }
}
