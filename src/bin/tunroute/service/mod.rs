use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::select;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tunroute::config;
use tunroute::default_route::best_default_route;
use tunroute::family::AddressFamily;
use tunroute::host::netlink::NetlinkHost;
use tunroute::host::{Host, MAIN_TABLE_ID};
use tunroute::manager::RoutingManager;
use tunroute::resolver::resolve_interface_address;

use crate::{ShowArgs, UpArgs};

struct Shutdown {
    interrupt: Signal,
    terminate: Signal,
}

impl Shutdown {
    fn new() -> std::io::Result<Self> {
        Ok(Self { interrupt: signal(SignalKind::interrupt())?, terminate: signal(SignalKind::terminate())? })
    }

    async fn requested(&mut self) -> &'static str {
        select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

pub fn up(args: UpArgs) -> anyhow::Result<()> {
    let mut config = config::load(&args.config_dir)?;
    config.apply_overrides(args.overrides());
    config.validate()?;
    tunroute::logging::init(config.verbosity.0)?;
    tracing::info!(message_id = "eeV0oele", ?config, "starting up");
    if config.lacks_server_exception() {
        tracing::warn!(
            message_id = "Ux7dQe3k",
            interface = %config.interface,
            "no exceptions configured, traffic to the VPN server will be routed into the tunnel"
        );
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let mut shutdown = Shutdown::new()?;
        let host = Arc::new(NetlinkHost::connect()?);
        let manager = RoutingManager::new(host, config.address_poll());
        let cancel = CancellationToken::new();

        let establish = manager.establish(config.tunnel_args(), &cancel);
        tokio::pin!(establish);
        let established = select! {
            result = &mut establish => result,
            signal = shutdown.requested() => {
                tracing::info!(message_id = "Aeth4pho", signal, "shutdown requested while establishing");
                cancel.cancel();
                establish.await
            }
        };
        if let Err(error) = established {
            tracing::error!(message_id = "ahT5eib1", ?error, code = error.code().as_static_str(), "could not establish tunnel routing");
            return Err(error.into());
        }

        let mut status = manager.subscribe();
        println!("{}", serde_json::to_string(&*status.borrow_and_update())?);

        loop {
            select! {
                signal = shutdown.requested() => {
                    tracing::info!(message_id = "Ke9ohgh4", signal, "shutting down");
                    break;
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = status.borrow_and_update().clone();
                    tracing::info!(message_id = "ku3Eeh6o", phase = %status.phase, "routing status changed");
                    println!("{}", serde_json::to_string(&status)?);
                }
            }
        }

        manager.teardown().await?;
        tracing::info!(message_id = "Lo2ieghu", "tunnel routing removed");
        Ok::<(), anyhow::Error>(())
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DefaultRouteInfo {
    gateway: Option<IpAddr>,
    interface: String,
    metric: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FamilyInfo {
    family: AddressFamily,
    address: Option<IpAddr>,
    address_error: Option<String>,
    default_route: Option<DefaultRouteInfo>,
}

async fn family_info(host: &impl Host, interface: &str, family: AddressFamily) -> anyhow::Result<FamilyInfo> {
    let (address, address_error) = match resolve_interface_address(host, interface, family).await {
        Ok(addr) => (Some(addr), None),
        Err(error) => (None, Some(error.to_string())),
    };
    let routes = host.list_routes(family, MAIN_TABLE_ID).await?;
    let default_route = match best_default_route(&routes) {
        Some(route) => {
            let interface = match host.interface_by_index(route.interface_index).await? {
                Some(interface) => interface.name,
                None => route.interface_index.to_string(),
            };
            Some(DefaultRouteInfo { gateway: route.gateway, interface, metric: route.metric })
        }
        None => None,
    };
    Ok(FamilyInfo { family, address, address_error, default_route })
}

pub fn show(args: ShowArgs) -> anyhow::Result<()> {
    tunroute::logging::init(0)?;
    let families = if args.families.is_empty() { AddressFamily::ALL.to_vec() } else { args.families };

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let host = NetlinkHost::connect()?;
        let mut infos = Vec::with_capacity(families.len());
        for family in families {
            infos.push(family_info(&host, &args.interface, family).await?);
        }
        println!("{}", serde_json::to_string_pretty(&infos)?);
        Ok::<(), anyhow::Error>(())
    })
}
