use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIs};
use tokio::select;
use tokio::sync::Mutex;
use tokio::sync::watch::{Receiver, Sender, channel};
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::default_route::DefaultRouteKeeper;
use crate::errors::{EstablishError, EstablishErrorCode, ResolveError, SnapshotError, TeardownError};
use crate::family::{AddressFamily, RoutingException, excluded_networks};
use crate::host::Host;
use crate::resolver::{Readiness, TunnelInterface, resolve_interface_address};
use crate::routing_table::RoutingTableManager;

/// What the VPN protocol collaborator hands over once the tunnel interface exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelArgs {
    pub interface: String,
    pub families: Vec<AddressFamily>,
    /// Extra destinations which bypass the tunnel, e.g. the VPN server endpoint. The built-in private and link-local ranges are always
    /// added.
    pub exceptions: Vec<RoutingException>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPoll {
    pub attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

impl Default for AddressPoll {
    fn default() -> Self {
        Self { attempts: 5, base_delay: Duration::from_millis(250), max_delay: Duration::from_secs(4), timeout: Duration::from_secs(20) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumIs)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum TunnelPhase {
    Idle,
    Establishing,
    Ready,
    TearingDown,
    Failed,
}

/// Published on every phase change, this is the readiness signal for the firewall collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingStatus {
    pub phase: TunnelPhase,
    pub interface: Option<String>,
    pub tunnels: Vec<TunnelInterface>,
    pub error: Option<EstablishErrorCode>,
}

impl RoutingStatus {
    fn idle() -> Self {
        Self { phase: TunnelPhase::Idle, interface: None, tunnels: Vec::new(), error: None }
    }

    pub fn ready_address(&self, family: AddressFamily) -> Option<IpAddr> {
        self.tunnels.iter().find(|t| t.family == family && t.readiness == Readiness::Ready).and_then(|t| t.assigned_address)
    }
}

#[derive(Debug)]
struct Session {
    interface: String,
    tunnels: Vec<TunnelInterface>,
    exceptions: Vec<RoutingException>,
}

/// Everything guarded by the routing lock.
#[derive(Debug)]
struct Inner {
    phase: TunnelPhase,
    session: Option<Session>,
    table: RoutingTableManager,
    keeper: DefaultRouteKeeper,
    error: Option<EstablishErrorCode>,
    // bumped by every establish and teardown, so a resumed establish can tell it was superseded
    generation: u64,
}

/// Serializes establishment and teardown of tunnel routing. Address polling runs outside the routing lock.
pub struct RoutingManager<H> {
    host: Arc<H>,
    poll: AddressPoll,
    inner: Mutex<Inner>,
    status: Sender<RoutingStatus>,
}

impl<H: Host> RoutingManager<H> {
    pub fn new(host: Arc<H>, poll: AddressPoll) -> Self {
        let (status, _) = channel(RoutingStatus::idle());
        let inner = Inner {
            phase: TunnelPhase::Idle,
            session: None,
            table: RoutingTableManager::new(),
            keeper: DefaultRouteKeeper::new(),
            error: None,
            generation: 0,
        };
        Self { host, poll, inner: Mutex::new(inner), status }
    }

    pub fn subscribe(&self) -> Receiver<RoutingStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> RoutingStatus {
        self.status.borrow().clone()
    }

    /// Captures the pre-VPN default routes, waits for the tunnel interface addresses and installs tunnel routing for every requested
    /// family. A previous session is torn down first.
    ///
    /// On failure everything installed so far is removed again and the phase becomes [`TunnelPhase::Failed`]. If `cancel` fires
    /// before routing is installed, the session is torn down and [`EstablishError::Cancelled`] is returned.
    pub async fn establish(&self, args: TunnelArgs, cancel: &CancellationToken) -> Result<Vec<TunnelInterface>, EstablishError> {
        let mut families = args.families.clone();
        families.sort();
        families.dedup();

        let generation = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            if inner.phase != TunnelPhase::Idle || inner.session.is_some() {
                tracing::info!(message_id = "L0aZc5Rw", phase = %inner.phase, "tearing down previous session before establishing");
                if let Err(error) = self.teardown_locked(inner).await {
                    return Err(EstablishError::Teardown(error));
                }
            }
            inner.generation += 1;
            inner.phase = TunnelPhase::Establishing;
            inner.error = None;
            let mut exceptions = Vec::new();
            for family in &families {
                exceptions.extend(excluded_networks(*family));
            }
            exceptions.extend(args.exceptions.iter().copied());
            inner.session = Some(Session {
                interface: args.interface.clone(),
                tunnels: families.iter().map(|family| TunnelInterface::new(args.interface.clone(), *family)).collect(),
                exceptions,
            });
            tracing::info!(message_id = "LGvOwuHw", interface = %args.interface, ?families, "establishing tunnel routing");
            self.publish(inner);

            for family in &families {
                if inner.keeper.pending(*family).is_some() {
                    tracing::info!(message_id = "qW2nD8rT", %family, "keeping pending default route snapshot");
                    continue;
                }
                match inner.keeper.capture_default_route(&*self.host, *family).await {
                    Ok(_) => {}
                    Err(SnapshotError::NoDefaultRoute { family }) => {
                        tracing::info!(message_id = "u6GzE1xP", %family, "no default route to capture");
                    }
                    Err(error) => return Err(self.fail_locked(inner, error.into()).await),
                }
            }
            inner.generation
        };

        let mut addresses = Vec::with_capacity(families.len());
        for family in &families {
            match self.poll_address(&args.interface, *family, cancel).await {
                Ok(addr) => addresses.push((*family, addr)),
                Err(error) => {
                    let mut guard = self.inner.lock().await;
                    if guard.generation != generation {
                        return Err(EstablishError::Superseded);
                    }
                    return Err(self.fail_locked(&mut guard, error).await);
                }
            }
        }

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.generation != generation {
            tracing::warn!(message_id = "hJ3sV9cN", "establishment superseded while polling addresses");
            return Err(EstablishError::Superseded);
        }
        if cancel.is_cancelled() {
            return Err(self.fail_locked(inner, EstablishError::Cancelled).await);
        }
        let Some(session) = inner.session.as_mut() else {
            return Err(EstablishError::Superseded);
        };
        for (family, addr) in addresses {
            let Some(tunnel) = session.tunnels.iter_mut().find(|t| t.family == family) else { continue };
            tunnel.set_ready(addr);
            if let Err(error) = inner.table.install_tunnel_routing(&*self.host, tunnel, &session.exceptions).await {
                tracing::error!(message_id = "Yj7IBZt5", ?error, %family, "failed to install tunnel routing");
                return Err(self.fail_locked(inner, error.into()).await);
            }
        }
        let tunnels = session.tunnels.clone();
        inner.phase = TunnelPhase::Ready;
        tracing::info!(message_id = "CBrpdS1C", ?tunnels, "tunnel routing ready");
        self.publish(inner);
        Ok(tunnels)
    }

    /// Removes tunnel routing, then restores the captured default routes. If removal fails, the restore is skipped and the phase becomes
    /// [`TunnelPhase::Failed`], a later call retries both.
    pub async fn teardown(&self) -> Result<(), TeardownError> {
        let mut guard = self.inner.lock().await;
        self.teardown_locked(&mut guard).await
    }

    pub async fn reconnect(&self, args: TunnelArgs, cancel: &CancellationToken) -> Result<Vec<TunnelInterface>, EstablishError> {
        self.teardown().await?;
        self.establish(args, cancel).await
    }

    async fn poll_address(&self, interface: &str, family: AddressFamily, cancel: &CancellationToken) -> Result<IpAddr, EstablishError> {
        let poll = async {
            let mut backoff = Backoff::new(self.poll.base_delay, self.poll.max_delay).take(self.poll.attempts);
            let mut last_error: Option<ResolveError> = None;
            loop {
                if !backoff.wait_or_cancelled(cancel).await {
                    if cancel.is_cancelled() {
                        return Err(EstablishError::Cancelled);
                    }
                    return Err(match last_error {
                        Some(error) => error.into(),
                        None => EstablishError::AddressTimeout { interface: interface.to_string(), family, timeout_ms: 0 },
                    });
                }
                match resolve_interface_address(&*self.host, interface, family).await {
                    Ok(addr) => return Ok(addr),
                    Err(error) if error.is_retryable() => {
                        tracing::debug!(message_id = "TuQGYOLO", %error, "tunnel address not assigned yet");
                        last_error = Some(error);
                    }
                    Err(error) => return Err(error.into()),
                }
            }
        };
        select! {
            biased;
            () = cancel.cancelled() => Err(EstablishError::Cancelled),
            result = tokio::time::timeout(self.poll.timeout, poll) => result.unwrap_or_else(|_| {
                Err(EstablishError::AddressTimeout {
                    interface: interface.to_string(),
                    family,
                    timeout_ms: self.poll.timeout.as_millis().try_into().unwrap_or(u64::MAX),
                })
            }),
        }
    }

    /// Cleans up after a failed establishment. Cancellation leads to a regular teardown instead of the failed phase.
    async fn fail_locked(&self, inner: &mut Inner, error: EstablishError) -> EstablishError {
        let code = error.code();
        if let EstablishError::Cancelled = error {
            tracing::info!(message_id = "zuYqWBKm", "establishment cancelled, tearing down");
            if let Err(error) = self.teardown_locked(inner).await {
                tracing::error!(message_id = "9eSvnhyg", ?error, "teardown after cancellation failed");
            }
            inner.error = Some(code);
            self.publish(inner);
            return EstablishError::Cancelled;
        }

        tracing::error!(message_id = "a2Udxrz7", ?error, code = code.as_static_str(), "establishment failed, cleaning up");
        if let Some(session) = inner.session.as_mut() {
            session.tunnels.iter_mut().for_each(TunnelInterface::set_failed);
        }
        if let Err(error) = self.cleanup_locked(inner).await {
            tracing::error!(message_id = "h5Byfi94", ?error, "cleanup after failed establishment incomplete");
        }
        inner.phase = TunnelPhase::Failed;
        inner.error = Some(code);
        self.publish(inner);
        error
    }

    async fn teardown_locked(&self, inner: &mut Inner) -> Result<(), TeardownError> {
        if inner.phase == TunnelPhase::Idle && inner.session.is_none() && inner.table.policies().next().is_none() && inner.keeper.pending_snapshots().next().is_none() {
            tracing::debug!(message_id = "j1Z14UW0", "nothing to tear down");
            return Ok(());
        }
        inner.generation += 1;
        inner.phase = TunnelPhase::TearingDown;
        self.publish(inner);

        let result = self.cleanup_locked(inner).await;
        match &result {
            Ok(()) | Err(TeardownError::Restore(SnapshotError::RestoreTargetGone { .. })) => {
                inner.session = None;
                inner.phase = TunnelPhase::Idle;
                tracing::info!(message_id = "rxdx2Sid", "tunnel routing torn down");
            }
            Err(error) => {
                tracing::error!(message_id = "na8sHJaa", ?error, "teardown incomplete");
                inner.phase = TunnelPhase::Failed;
                inner.error = Some(EstablishErrorCode::Teardown);
            }
        }
        self.publish(inner);
        result
    }

    /// Removes every recorded tunnel policy, then restores pending snapshots unless a removal failed. Returns the first error.
    async fn cleanup_locked(&self, inner: &mut Inner) -> Result<(), TeardownError> {
        let recorded: Vec<TunnelInterface> = inner.table.policies().map(|p| TunnelInterface::new(p.interface.name.clone(), p.family)).collect();
        let mut remove_error = None;
        for tunnel in &recorded {
            if let Err(error) = inner.table.remove_tunnel_routing(&*self.host, tunnel).await {
                tracing::error!(message_id = "1r3fxITX", ?error, interface = %tunnel.name, family = %tunnel.family, "failed to remove tunnel routing");
                remove_error.get_or_insert(error);
            }
        }
        if let Some(error) = remove_error {
            tracing::warn!(message_id = "VFVgZwaq", "skipping default route restore while tunnel routing is still installed");
            return Err(TeardownError::Remove(error));
        }

        let pending: Vec<_> = inner.keeper.pending_snapshots().cloned().collect();
        let mut restore_error = None;
        for snapshot in &pending {
            if let Err(error) = inner.keeper.restore_default_route(&*self.host, snapshot).await {
                tracing::error!(message_id = "ahWKE8Sb", ?error, family = %snapshot.family, "failed to restore default route");
                // a vanished interface is only reported, other failures take precedence
                match (&restore_error, &error) {
                    (None, _) | (Some(SnapshotError::RestoreTargetGone { .. }), _) => restore_error = Some(error),
                    _ => {}
                }
            }
        }
        match restore_error {
            Some(error) => Err(TeardownError::Restore(error)),
            None => Ok(()),
        }
    }

    fn publish(&self, inner: &Inner) {
        let status = RoutingStatus {
            phase: inner.phase,
            interface: inner.session.as_ref().map(|s| s.interface.clone()),
            tunnels: inner.session.as_ref().map(|s| s.tunnels.clone()).unwrap_or_default(),
            error: inner.error,
        };
        self.status.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }
}
