use std::io;
use std::net::IpAddr;

use serde::Serialize;

use crate::errors::{RoutingOperation, RoutingProgramFailed, SnapshotError};
use crate::family::AddressFamily;
use crate::host::{Host, MAIN_TABLE_ID, Route, is_already_exists, is_already_gone};
use crate::net::NetworkInterface;

/// The pre-VPN default route of one family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DefaultRouteSnapshot {
    pub family: AddressFamily,
    pub gateway: Option<IpAddr>,
    pub interface: NetworkInterface,
    pub metric: u32,
    /// Logical clock of the keeper that captured it.
    pub captured_at: u64,
}

/// Holds at most one pending snapshot per family, from capture until a successful restore.
#[derive(Debug, Default)]
pub struct DefaultRouteKeeper {
    pending: [Option<DefaultRouteSnapshot>; 2],
    clock: u64,
}

/// The main table default route with the lowest metric. Ties keep the first listed.
pub fn best_default_route(routes: &[Route]) -> Option<&Route> {
    routes.iter().filter(|r| r.is_default()).fold(None, |best: Option<&Route>, route| match best {
        Some(best) if best.metric <= route.metric => Some(best),
        _ => Some(route),
    })
}

impl DefaultRouteKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self, family: AddressFamily) -> Option<&DefaultRouteSnapshot> {
        self.pending[family.index()].as_ref()
    }

    pub fn pending_snapshots(&self) -> impl Iterator<Item = &DefaultRouteSnapshot> {
        self.pending.iter().flatten()
    }

    pub async fn capture_default_route(&mut self, host: &dyn Host, family: AddressFamily) -> Result<DefaultRouteSnapshot, SnapshotError> {
        if self.pending(family).is_some() {
            return Err(SnapshotError::SnapshotAlreadyPending { family });
        }
        let routes = host
            .list_routes(family, MAIN_TABLE_ID)
            .await
            .map_err(|source| RoutingProgramFailed::new(RoutingOperation::ListRoutes, family, source))?;
        let Some(route) = best_default_route(&routes) else {
            return Err(SnapshotError::NoDefaultRoute { family });
        };
        let interface = host
            .interface_by_index(route.interface_index)
            .await
            .map_err(|source| RoutingProgramFailed::new(RoutingOperation::FindInterface, family, source))?
            .ok_or_else(|| RoutingProgramFailed::new(RoutingOperation::FindInterface, family, io::Error::from_raw_os_error(libc::ENODEV)))?;

        self.clock += 1;
        let snapshot = DefaultRouteSnapshot { family, gateway: route.gateway, interface, metric: route.metric, captured_at: self.clock };
        tracing::info!(message_id = "UIlRXjZE", ?snapshot, "captured default route");
        self.pending[family.index()] = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Re-installs the snapshot's route in the main table. The interface is looked up by name, so a recreated interface with a new
    /// index is still a valid target.
    ///
    /// If the interface is gone, the snapshot is dropped and [`SnapshotError::RestoreTargetGone`] is returned. Any other failure keeps
    /// the snapshot pending.
    pub async fn restore_default_route(&mut self, host: &dyn Host, snapshot: &DefaultRouteSnapshot) -> Result<(), SnapshotError> {
        let family = snapshot.family;
        let interface = host
            .interface_by_name(&snapshot.interface.name)
            .await
            .map_err(|source| RoutingProgramFailed::new(RoutingOperation::FindInterface, family, source))?;
        let Some(interface) = interface else {
            tracing::warn!(message_id = "e4HsLq2V", ?snapshot, "default route interface is gone, dropping snapshot");
            self.clear(snapshot);
            return Err(SnapshotError::RestoreTargetGone { family, interface: snapshot.interface.name.clone() });
        };
        let route = Route {
            destination: family.default_network(),
            gateway: snapshot.gateway,
            interface_index: interface.index,
            metric: snapshot.metric,
            table: MAIN_TABLE_ID,
        };
        match host.add_route(&route).await {
            Ok(()) => tracing::info!(message_id = "PnR5gW3k", %route, "restored default route"),
            Err(error) if is_already_exists(&error) => self.replace_conflicting(host, &route).await?,
            Err(error) => {
                tracing::error!(message_id = "Mz9cY6uF", ?error, %route, "failed to restore default route");
                return Err(RoutingProgramFailed::new(RoutingOperation::AddRoute, family, error).into());
            }
        }
        self.clear(snapshot);
        Ok(())
    }

    // The kernel reports EEXIST for any default route with the same metric, whichever path it takes.
    async fn replace_conflicting(&self, host: &dyn Host, route: &Route) -> Result<(), RoutingProgramFailed> {
        let family = route.family();
        let routes = host.list_routes(family, MAIN_TABLE_ID).await.map_err(|source| RoutingProgramFailed::new(RoutingOperation::ListRoutes, family, source))?;
        let conflicting: Vec<&Route> = routes.iter().filter(|r| r.is_default() && r.metric == route.metric).collect();
        if conflicting.iter().any(|r| r.gateway == route.gateway && r.interface_index == route.interface_index) {
            tracing::info!(message_id = "xB7tK0wz", %route, "default route still present");
            return Ok(());
        }
        for stale in conflicting {
            tracing::warn!(message_id = "Wq3pZr8d", %stale, restored = %route, "replacing default route which took over the captured one");
            if let Err(error) = host.delete_route(stale).await {
                if !is_already_gone(&error) {
                    tracing::error!(message_id = "Ty6mLs0c", ?error, %stale, "failed to delete conflicting default route");
                    return Err(RoutingProgramFailed::new(RoutingOperation::DeleteRoute, family, error));
                }
            }
        }
        host.add_route(route).await.map_err(|error| {
            tracing::error!(message_id = "Fk1nUe5h", ?error, %route, "failed to restore default route");
            RoutingProgramFailed::new(RoutingOperation::AddRoute, family, error)
        })?;
        tracing::info!(message_id = "Bd9hRv2j", %route, "restored default route");
        Ok(())
    }

    fn clear(&mut self, snapshot: &DefaultRouteSnapshot) {
        let slot = &mut self.pending[snapshot.family.index()];
        if slot.as_ref().is_some_and(|pending| pending.captured_at == snapshot.captured_at) {
            *slot = None;
        }
    }
}
